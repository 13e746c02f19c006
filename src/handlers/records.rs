//! Typed record store and the `data_*` handlers.
//!
//! Records are JSON objects grouped by type and keyed by id. The store is
//! persisted as one JSON document, rewritten atomically after every change.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{parse_args, Handler, HandlerOutcome};
use crate::error::{OperationError, StoreError};
use crate::operation::OperationContext;
use crate::types::ToolDefinition;

const RECORDS_FORMAT_VERSION: u32 = 1;

type Records = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecords {
    version: u32,
    next_id: u64,
    records: Records,
}

#[derive(Debug, Default)]
struct RecordState {
    path: Option<PathBuf>,
    next_id: u64,
    records: Records,
}

#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    state: Arc<Mutex<RecordState>>,
}

impl RecordStore {
    /// Open (or lazily create) the record file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let (next_id, records) = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let persisted: PersistedRecords = serde_json::from_str(&text)?;
                if persisted.version != RECORDS_FORMAT_VERSION {
                    return Err(StoreError::UnsupportedVersion(persisted.version));
                }
                (persisted.next_id, persisted.records)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (1, Records::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            state: Arc::new(Mutex::new(RecordState {
                path: Some(path),
                next_id,
                records,
            })),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(RecordState {
                next_id: 1,
                ..RecordState::default()
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecordState>, OperationError> {
        self.state
            .lock()
            .map_err(|_| OperationError::HandlerFailed("record store lock poisoned".into()))
    }

    pub fn contains(&self, record_type: &str, id: &str) -> bool {
        self.lock()
            .map(|state| {
                state
                    .records
                    .get(record_type)
                    .is_some_and(|records| records.contains_key(id))
            })
            .unwrap_or(false)
    }

    pub fn count(&self, record_type: &str) -> usize {
        self.lock()
            .map(|state| state.records.get(record_type).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn get(&self, record_type: &str, id: &str) -> Option<Value> {
        let state = self.lock().ok()?;
        state.records.get(record_type)?.get(id).cloned()
    }

    /// Records of one type whose fields equal every entry in `filter`.
    pub fn query(
        &self,
        record_type: &str,
        filter: &Map<String, Value>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, OperationError> {
        let state = self.lock()?;
        let Some(records) = state.records.get(record_type) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .filter(|(_, fields)| {
                filter
                    .iter()
                    .all(|(key, expected)| fields.get(key) == Some(expected))
            })
            .take(limit.unwrap_or(usize::MAX))
            .map(|(id, fields)| with_id(id, fields))
            .collect())
    }

    /// Insert a record; returns its id. Fails if `id` is already taken.
    pub fn insert(
        &self,
        record_type: &str,
        id: Option<String>,
        fields: Value,
    ) -> Result<String, OperationError> {
        let mut state = self.lock()?;
        let mut next_id = state.next_id;
        let id = match id {
            Some(id) => id,
            None => {
                let id = next_id.to_string();
                next_id += 1;
                id
            }
        };
        if state
            .records
            .get(record_type)
            .is_some_and(|records| records.contains_key(&id))
        {
            return Err(OperationError::HandlerFailed(format!(
                "record {record_type}/{id} already exists"
            )));
        }
        let mut records = state.records.clone();
        records
            .entry(record_type.to_string())
            .or_default()
            .insert(id.clone(), fields);
        commit(&mut state, next_id, records)?;
        Ok(id)
    }

    /// Merge `fields` into an existing record; returns the previous value.
    pub fn update(
        &self,
        record_type: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Value, OperationError> {
        let mut state = self.lock()?;
        let mut records = state.records.clone();
        let record = records
            .get_mut(record_type)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| OperationError::HandlerFailed(format!("no record {record_type}/{id}")))?;
        let before = record.clone();
        match record {
            Value::Object(existing) => existing.extend(fields),
            other => *other = Value::Object(fields),
        }
        let next_id = state.next_id;
        commit(&mut state, next_id, records)?;
        Ok(before)
    }

    /// Remove one record; `None` when it did not exist.
    pub fn delete(&self, record_type: &str, id: &str) -> Result<Option<Value>, OperationError> {
        let mut state = self.lock()?;
        let mut records = state.records.clone();
        let removed = records
            .get_mut(record_type)
            .and_then(|records| records.remove(id));
        if removed.is_some() {
            let next_id = state.next_id;
            commit(&mut state, next_id, records)?;
        }
        Ok(removed)
    }

    /// Remove a whole type; returns the records it held.
    pub fn delete_type(&self, record_type: &str) -> Result<BTreeMap<String, Value>, OperationError> {
        let mut state = self.lock()?;
        let mut records = state.records.clone();
        let removed = records.remove(record_type).unwrap_or_default();
        let next_id = state.next_id;
        commit(&mut state, next_id, records)?;
        Ok(removed)
    }
}

fn with_id(id: &str, fields: &Value) -> Value {
    let mut record = Map::new();
    record.insert("id".to_string(), Value::String(id.to_string()));
    if let Value::Object(fields) = fields {
        record.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Value::Object(record)
}

/// Persist the new contents, then swap them in. A failed write leaves the
/// in-memory state untouched.
fn commit(state: &mut RecordState, next_id: u64, records: Records) -> Result<(), OperationError> {
    let records = match state.path.as_deref() {
        Some(path) => write_records(path, next_id, records)
            .map_err(|e| OperationError::HandlerFailed(format!("saving records: {e}")))?,
        None => records,
    };
    state.next_id = next_id;
    state.records = records;
    Ok(())
}

fn write_records(path: &Path, next_id: u64, records: Records) -> Result<Records, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let persisted = PersistedRecords {
        version: RECORDS_FORMAT_VERSION,
        next_id,
        records,
    };
    let json = serde_json::to_string_pretty(&persisted)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(persisted.records)
}

// ---------------------------------------------------------------------------
// Handler arguments
// ---------------------------------------------------------------------------

/// Record ids may arrive as strings or numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RecordId {
    Text(String),
    Number(u64),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(id) => f.write_str(id),
            Self::Number(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Deserialize)]
struct TypeArgs {
    #[serde(rename = "type")]
    record_type: String,
}

#[derive(Deserialize)]
struct QueryArgs {
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default, rename = "where")]
    filter: Map<String, Value>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct InsertArgs {
    #[serde(rename = "type")]
    record_type: String,
    fields: Map<String, Value>,
    #[serde(default)]
    id: Option<RecordId>,
}

#[derive(Deserialize)]
struct UpdateArgs {
    #[serde(rename = "type")]
    record_type: String,
    id: RecordId,
    fields: Map<String, Value>,
}

#[derive(Deserialize)]
struct RecordArgs {
    #[serde(rename = "type")]
    record_type: String,
    id: RecordId,
}

fn type_property() -> Value {
    json!({"type": "string", "description": "Record type, e.g. `contacts`"})
}

fn id_property() -> Value {
    json!({"type": ["string", "integer"], "description": "Record id"})
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub struct DataQueryHandler;

#[async_trait]
impl Handler for DataQueryHandler {
    fn kind(&self) -> &'static str {
        "data_query"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Query records of one type, optionally filtered by exact field values.",
            json!({
                "type": "object",
                "properties": {
                    "type": type_property(),
                    "where": {"type": "object", "description": "Field values that must match exactly"},
                    "limit": {"type": "integer", "minimum": 1}
                },
                "required": ["type"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<QueryArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, _ctx: &OperationContext) -> Result<String, OperationError> {
        let args: QueryArgs = parse_args(input)?;
        Ok(format!("Query {} records", args.record_type))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: QueryArgs = parse_args(input)?;
        let records = ctx
            .env
            .records
            .query(&args.record_type, &args.filter, args.limit)?;
        Ok(HandlerOutcome::done(format!(
            "{} {} record(s) matched",
            records.len(),
            args.record_type
        ))
        .with_output(json!({"type": args.record_type, "records": records})))
    }
}

pub struct DataInsertHandler;

#[async_trait]
impl Handler for DataInsertHandler {
    fn kind(&self) -> &'static str {
        "data_insert"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Insert a new record. The id is generated unless given.",
            json!({
                "type": "object",
                "properties": {
                    "type": type_property(),
                    "fields": {"type": "object"},
                    "id": id_property()
                },
                "required": ["type", "fields"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<InsertArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, _ctx: &OperationContext) -> Result<String, OperationError> {
        let args: InsertArgs = parse_args(input)?;
        let fields: Vec<&str> = args.fields.keys().map(String::as_str).collect();
        Ok(format!(
            "Insert a {} record with fields: {}",
            args.record_type,
            fields.join(", ")
        ))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: InsertArgs = parse_args(input)?;
        let id = ctx.env.records.insert(
            &args.record_type,
            args.id.map(|id| id.to_string()),
            Value::Object(args.fields),
        )?;
        Ok(
            HandlerOutcome::done(format!("Inserted {}/{id}", args.record_type))
                .with_output(json!({"type": args.record_type, "id": id})),
        )
    }
}

pub struct DataUpdateHandler;

#[async_trait]
impl Handler for DataUpdateHandler {
    fn kind(&self) -> &'static str {
        "data_update"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Merge fields into an existing record.",
            json!({
                "type": "object",
                "properties": {
                    "type": type_property(),
                    "id": id_property(),
                    "fields": {"type": "object"}
                },
                "required": ["type", "id", "fields"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<UpdateArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, ctx: &OperationContext) -> Result<String, OperationError> {
        let args: UpdateArgs = parse_args(input)?;
        let id = args.id.to_string();
        let current = ctx.env.records.get(&args.record_type, &id);
        let changes: Vec<String> = args
            .fields
            .iter()
            .map(|(key, value)| {
                let old = current
                    .as_ref()
                    .and_then(|record| record.get(key))
                    .map_or_else(|| "(unset)".to_string(), Value::to_string);
                format!("{key}: {old} -> {value}")
            })
            .collect();
        Ok(format!(
            "Update {}/{id}: {}",
            args.record_type,
            changes.join("; ")
        ))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: UpdateArgs = parse_args(input)?;
        let id = args.id.to_string();
        let before = ctx.env.records.update(&args.record_type, &id, args.fields)?;
        Ok(HandlerOutcome::done(format!("Updated {}/{id}", args.record_type))
            .with_output(json!({"type": args.record_type, "id": id}))
            .with_before(before))
    }
}

pub struct DataDeleteHandler;

#[async_trait]
impl Handler for DataDeleteHandler {
    fn kind(&self) -> &'static str {
        "data_delete"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Delete one record by id.",
            json!({
                "type": "object",
                "properties": {"type": type_property(), "id": id_property()},
                "required": ["type", "id"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<RecordArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, ctx: &OperationContext) -> Result<String, OperationError> {
        let args: RecordArgs = parse_args(input)?;
        let id = args.id.to_string();
        Ok(match ctx.env.records.get(&args.record_type, &id) {
            Some(record) => format!("Delete {}/{id}: {record}", args.record_type),
            None => format!("No record {}/{id} to delete", args.record_type),
        })
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: RecordArgs = parse_args(input)?;
        let id = args.id.to_string();
        Ok(match ctx.env.records.delete(&args.record_type, &id)? {
            Some(before) => {
                HandlerOutcome::done(format!("Deleted {}/{id}", args.record_type)).with_before(before)
            }
            None => HandlerOutcome::done(format!("No record {}/{id} to delete", args.record_type)),
        })
    }
}

pub struct DataTypeDeleteHandler;

#[async_trait]
impl Handler for DataTypeDeleteHandler {
    fn kind(&self) -> &'static str {
        "data_type_delete"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Delete a record type together with all of its records.",
            json!({
                "type": "object",
                "properties": {"type": type_property()},
                "required": ["type"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<TypeArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, ctx: &OperationContext) -> Result<String, OperationError> {
        let args: TypeArgs = parse_args(input)?;
        Ok(format!(
            "Delete type {} and its {} record(s)",
            args.record_type,
            ctx.env.records.count(&args.record_type)
        ))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: TypeArgs = parse_args(input)?;
        let removed = ctx.env.records.delete_type(&args.record_type)?;
        Ok(HandlerOutcome::done(format!(
            "Deleted type {} ({} record(s))",
            args.record_type,
            removed.len()
        ))
        .with_before(json!({"type": args.record_type, "records": removed})))
    }
}
