//! Immutable registry of operation kinds and their risk rules.
//!
//! The built-in catalog is constructed once per process; callers may inject
//! their own (tests do) wherever a `Catalog` is accepted.

use super::{OperationContext, OperationRiskKind};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Risk assignment for one operation kind.
#[derive(Clone, Copy)]
pub enum RiskRule {
    Fixed(OperationRiskKind),
    /// Classified against current state, e.g. whether the target exists.
    Dynamic(fn(&Value, &OperationContext) -> OperationRiskKind),
}

impl std::fmt::Debug for RiskRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(kind) => write!(f, "Fixed({kind})"),
            Self::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Extracts the resource an operation touches, used for sibling ordering.
pub type TargetFn = fn(&Value) -> Option<String>;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub kind: &'static str,
    pub risk: RiskRule,
    pub description: &'static str,
    pub target: Option<TargetFn>,
}

impl CatalogEntry {
    pub fn fixed(kind: &'static str, risk: OperationRiskKind, description: &'static str) -> Self {
        Self {
            kind,
            risk: RiskRule::Fixed(risk),
            description,
            target: None,
        }
    }

    pub fn dynamic(
        kind: &'static str,
        classify: fn(&Value, &OperationContext) -> OperationRiskKind,
        description: &'static str,
    ) -> Self {
        Self {
            kind,
            risk: RiskRule::Dynamic(classify),
            description,
            target: None,
        }
    }

    pub fn with_target(mut self, target: TargetFn) -> Self {
        self.target = Some(target);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<&'static str, CatalogEntry>,
}

impl Catalog {
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.kind, entry))
                .collect(),
        }
    }

    /// Process-wide built-in catalog.
    pub fn builtin() -> Arc<Catalog> {
        static BUILTIN: OnceLock<Arc<Catalog>> = OnceLock::new();
        BUILTIN
            .get_or_init(|| Arc::new(Catalog::from_entries(builtin_entries())))
            .clone()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn entry(&self, kind: &str) -> Option<&CatalogEntry> {
        self.entries.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn description(&self, kind: &str) -> Option<&'static str> {
        self.entries.get(kind).map(|entry| entry.description)
    }

    /// Resolve the risk of one request.
    ///
    /// Unknown kinds are treated as `delete`, the most conservative class.
    pub fn classify(&self, kind: &str, input: &Value, ctx: &OperationContext) -> OperationRiskKind {
        match self.entries.get(kind).map(|entry| entry.risk) {
            Some(RiskRule::Fixed(risk)) => risk,
            Some(RiskRule::Dynamic(classify)) => classify(input, ctx),
            None => {
                tracing::warn!(op_type = kind, "unknown operation kind; classifying as delete");
                OperationRiskKind::Delete
            }
        }
    }

    /// Resource key touched by a request, if the kind declares one.
    pub fn target(&self, kind: &str, input: &Value) -> Option<String> {
        self.entries
            .get(kind)
            .and_then(|entry| entry.target)
            .and_then(|target| target(input))
    }
}

/// Two resource keys overlap when equal or when one contains the other.
///
/// Keys are `/`-separated, so `data/notes` overlaps `data/notes/7`.
pub fn targets_overlap(a: &str, b: &str) -> bool {
    fn contains(parent: &str, child: &str) -> bool {
        child
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('/'))
    }
    a == b || contains(a, b) || contains(b, a)
}

// ---------------------------------------------------------------------------
// Built-in kinds
// ---------------------------------------------------------------------------

fn builtin_entries() -> Vec<CatalogEntry> {
    use OperationRiskKind::*;
    vec![
        CatalogEntry::fixed("file_read", Read, "Read a text file from the workspace.")
            .with_target(file_target),
        CatalogEntry::fixed("file_list", Read, "List entries of a workspace directory.")
            .with_target(file_target),
        CatalogEntry::dynamic(
            "file_write",
            classify_file_write,
            "Create or overwrite a text file in the workspace.",
        )
        .with_target(file_target),
        CatalogEntry::dynamic(
            "file_delete",
            classify_file_delete,
            "Delete a file from the workspace.",
        )
        .with_target(file_target),
        CatalogEntry::fixed("data_query", Read, "Query records of one type.")
            .with_target(record_type_target),
        CatalogEntry::fixed("data_insert", Create, "Insert a new record.")
            .with_target(record_target),
        CatalogEntry::fixed("data_update", Update, "Merge fields into an existing record.")
            .with_target(record_target),
        CatalogEntry::dynamic(
            "data_delete",
            classify_data_delete,
            "Delete one record by id.",
        )
        .with_target(record_target),
        CatalogEntry::dynamic(
            "data_type_delete",
            classify_data_type_delete,
            "Delete every record of a type.",
        )
        .with_target(record_type_target),
        CatalogEntry::fixed("todo_add", Local, "Add an item to the chat's scratch todo list."),
        CatalogEntry::fixed("todo_list", Local, "Show the scratch todo list."),
        CatalogEntry::fixed("todo_complete", Local, "Mark a scratch todo item complete."),
        CatalogEntry::fixed(
            "output_fetch",
            Local,
            "Fetch the full text of a truncated operation message by key.",
        ),
    ]
}

fn str_field<'a>(input: &'a Value, field: &str) -> Option<&'a str> {
    input.get(field).and_then(Value::as_str)
}

fn file_target(input: &Value) -> Option<String> {
    let path = str_field(input, "path").unwrap_or(".");
    let normalized: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if normalized.is_empty() {
        return Some("file".to_string());
    }
    Some(format!("file/{}", normalized.join("/")))
}

fn record_type_target(input: &Value) -> Option<String> {
    str_field(input, "type").map(|record_type| format!("data/{record_type}"))
}

fn record_target(input: &Value) -> Option<String> {
    let record_type = str_field(input, "type")?;
    match input.get("id") {
        Some(Value::String(id)) => Some(format!("data/{record_type}/{id}")),
        Some(Value::Number(id)) => Some(format!("data/{record_type}/{id}")),
        _ => Some(format!("data/{record_type}")),
    }
}

fn record_id(input: &Value) -> Option<String> {
    match input.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn path_exists(input: &Value, ctx: &OperationContext) -> Option<bool> {
    let path = str_field(input, "path")?;
    let resolved = ctx.env.workspace.resolve(path).ok()?;
    Some(resolved.exists())
}

/// Overwriting is an update; a brand-new file is a create.
fn classify_file_write(input: &Value, ctx: &OperationContext) -> OperationRiskKind {
    match path_exists(input, ctx) {
        Some(false) => OperationRiskKind::Create,
        _ => OperationRiskKind::Update,
    }
}

/// Deleting a missing file changes nothing.
fn classify_file_delete(input: &Value, ctx: &OperationContext) -> OperationRiskKind {
    match path_exists(input, ctx) {
        Some(false) => OperationRiskKind::Read,
        _ => OperationRiskKind::Delete,
    }
}

fn classify_data_delete(input: &Value, ctx: &OperationContext) -> OperationRiskKind {
    let exists = match (str_field(input, "type"), record_id(input)) {
        (Some(record_type), Some(id)) => ctx.env.records.contains(record_type, &id),
        _ => true,
    };
    if exists {
        OperationRiskKind::Delete
    } else {
        OperationRiskKind::Read
    }
}

/// Dropping an empty type only removes a schema entry.
fn classify_data_type_delete(input: &Value, ctx: &OperationContext) -> OperationRiskKind {
    match str_field(input, "type") {
        Some(record_type) if ctx.env.records.count(record_type) == 0 => OperationRiskKind::Update,
        _ => OperationRiskKind::Delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Environment;
    use crate::operation::ChatMode;
    use crate::testsupport::TestTempDir;
    use serde_json::json;

    fn context(dir: &TestTempDir) -> OperationContext {
        OperationContext {
            chat_id: "chat".to_string(),
            mode: ChatMode::None,
            env: Environment::in_memory(dir.path()),
            max_message_chars: 200,
        }
    }

    #[test]
    fn builtin_is_shared() {
        let a = Catalog::builtin();
        let b = Catalog::builtin();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.contains("file_write"));
        assert!(a.kinds().any(|kind| kind == "output_fetch"));
    }

    #[test]
    fn unknown_kind_is_classified_as_delete() {
        let dir = TestTempDir::new("catalog-unknown");
        let ctx = context(&dir);
        let catalog = Catalog::builtin();
        assert_eq!(
            catalog.classify("launch_rockets", &json!({}), &ctx),
            OperationRiskKind::Delete
        );
    }

    #[test]
    fn file_write_depends_on_existence() {
        let dir = TestTempDir::new("catalog-write");
        let ctx = context(&dir);
        let catalog = Catalog::builtin();
        let input = json!({"path": "notes.txt", "content": "x"});
        assert_eq!(catalog.classify("file_write", &input, &ctx), OperationRiskKind::Create);

        std::fs::write(dir.path().join("notes.txt"), "old").expect("seed file");
        assert_eq!(catalog.classify("file_write", &input, &ctx), OperationRiskKind::Update);
    }

    #[test]
    fn deleting_missing_things_is_read() {
        let dir = TestTempDir::new("catalog-delete");
        let ctx = context(&dir);
        let catalog = Catalog::builtin();
        assert_eq!(
            catalog.classify("file_delete", &json!({"path": "gone.txt"}), &ctx),
            OperationRiskKind::Read
        );
        assert_eq!(
            catalog.classify("data_delete", &json!({"type": "notes", "id": "1"}), &ctx),
            OperationRiskKind::Read
        );
        assert_eq!(
            catalog.classify("data_type_delete", &json!({"type": "notes"}), &ctx),
            OperationRiskKind::Update
        );

        let id = ctx
            .env
            .records
            .insert("notes", None, json!({"title": "a"}))
            .expect("insert");
        assert_eq!(
            catalog.classify("data_delete", &json!({"type": "notes", "id": id}), &ctx),
            OperationRiskKind::Delete
        );
        assert_eq!(
            catalog.classify("data_type_delete", &json!({"type": "notes"}), &ctx),
            OperationRiskKind::Delete
        );
    }

    #[test]
    fn targets_normalize_and_nest() {
        let catalog = Catalog::builtin();
        assert_eq!(
            catalog.target("file_write", &json!({"path": "./docs//a.md"})),
            Some("file/docs/a.md".to_string())
        );
        assert_eq!(
            catalog.target("data_update", &json!({"type": "notes", "id": 3})),
            Some("data/notes/3".to_string())
        );
        assert_eq!(catalog.target("todo_add", &json!({"text": "x"})), None);

        assert!(targets_overlap("data/notes", "data/notes/3"));
        assert!(targets_overlap("file/docs/a.md", "file/docs/a.md"));
        assert!(!targets_overlap("data/notes", "data/notesx"));
        assert!(!targets_overlap("file/a", "file/b"));
    }
}
