//! Pluggable operation handlers.
//!
//! A handler implements one operation kind: it validates input, previews the
//! effect for approval prompts, and performs the work. Handlers never decide
//! whether they may run; that is the operation policy's job.

pub mod files;
pub mod records;
pub mod stash;
pub mod todos;

use crate::error::OperationError;
use crate::operation::{OperationContext, OutputStash};
use crate::types::ToolDefinition;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

pub use records::RecordStore;
pub use todos::TodoList;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Result of executing one operation.
///
/// A handler that ran but could not complete reports `error` here (or
/// returns `Err`); both fail the operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    pub output: Option<Value>,
    pub message: Option<String>,
    pub before: Option<Value>,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn done(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Operation kind this handler serves; matches the tool name.
    fn kind(&self) -> &'static str;

    /// Function definition published to the model.
    fn definition(&self) -> ToolDefinition;

    /// Reject malformed input before anything else happens.
    fn validate(&self, input: &Value) -> Result<(), OperationError>;

    /// Human-readable preview of the intended effect. Must not mutate.
    async fn analyze(&self, input: &Value, ctx: &OperationContext) -> Result<String, OperationError>;

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError>;
}

/// Deserialize handler arguments, mapping failures to `InvalidInput`.
pub(crate) fn parse_args<T: DeserializeOwned>(input: &Value) -> Result<T, OperationError> {
    serde_json::from_value(input.clone()).map_err(|e| OperationError::InvalidInput(e.to_string()))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handlers by kind. Operations whose kind has no handler fail.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Registry with every reference handler shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(files::FileReadHandler);
        registry.register(files::FileListHandler);
        registry.register(files::FileWriteHandler);
        registry.register(files::FileDeleteHandler);
        registry.register(records::DataQueryHandler);
        registry.register(records::DataInsertHandler);
        registry.register(records::DataUpdateHandler);
        registry.register(records::DataDeleteHandler);
        registry.register(records::DataTypeDeleteHandler);
        registry.register(todos::TodoAddHandler);
        registry.register(todos::TodoListHandler);
        registry.register(todos::TodoCompleteHandler);
        registry.register(stash::OutputFetchHandler);
        registry
    }

    /// Register a handler, replacing any existing one for the same kind.
    pub fn register(&mut self, handler: impl Handler + 'static) {
        self.handlers.retain(|h| h.kind() != handler.kind());
        self.handlers.push(Box::new(handler));
    }

    pub fn get(&self, kind: &str) -> Option<&dyn Handler> {
        self.handlers
            .iter()
            .find(|h| h.kind() == kind)
            .map(|h| h.as_ref())
    }

    /// Tool definitions for the API request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.handlers.iter().map(|h| h.definition()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Shared state handlers act upon. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Environment {
    pub workspace: Workspace,
    pub records: RecordStore,
    pub todos: TodoList,
    pub stash: OutputStash,
}

impl Environment {
    pub fn new(workspace: Workspace, records: RecordStore, stash: OutputStash) -> Self {
        Self {
            workspace,
            records,
            todos: TodoList::default(),
            stash,
        }
    }

    /// Workspace on disk, records and stashed output kept only in memory.
    pub fn in_memory(workspace_root: impl Into<PathBuf>) -> Self {
        Self::new(
            Workspace::new(workspace_root),
            RecordStore::in_memory(),
            OutputStash::new(),
        )
    }
}

/// Directory file operations are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path.
    ///
    /// Absolute paths and `..` components are rejected so that no operation
    /// reaches outside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, OperationError> {
        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(OperationError::InvalidInput(format!(
                        "path `{relative}` must stay inside the workspace"
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        fn kind(&self) -> &'static str {
            "echo"
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::function("echo", "echoes input back", json!({}))
        }
        fn validate(&self, _input: &Value) -> Result<(), OperationError> {
            Ok(())
        }
        async fn analyze(
            &self,
            _input: &Value,
            _ctx: &OperationContext,
        ) -> Result<String, OperationError> {
            Ok("would echo".into())
        }
        async fn execute(
            &self,
            input: &Value,
            _ctx: &OperationContext,
        ) -> Result<HandlerOutcome, OperationError> {
            Ok(HandlerOutcome::done("echoed").with_output(input.clone()))
        }
    }

    #[test]
    fn new_registry_is_empty() {
        assert!(HandlerRegistry::new().is_empty());
        assert!(HandlerRegistry::default().is_empty());
    }

    #[test]
    fn register_replaces_same_kind() {
        let mut registry = HandlerRegistry::new();
        registry.register(EchoHandler);
        registry.register(EchoHandler);
        assert_eq!(registry.definitions().len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn builtin_registry_covers_builtin_catalog() {
        let registry = HandlerRegistry::builtin();
        let catalog = crate::operation::Catalog::builtin();
        for kind in catalog.kinds() {
            assert!(registry.get(kind).is_some(), "no handler for {kind}");
        }
        for definition in registry.definitions() {
            assert!(catalog.contains(&definition.function.name));
        }
    }

    #[test]
    fn workspace_rejects_escaping_paths() {
        let workspace = Workspace::new("/srv/ws");
        assert_eq!(
            workspace.resolve("./docs/a.md").unwrap(),
            PathBuf::from("/srv/ws/docs/a.md")
        );
        assert!(workspace.resolve("../etc/passwd").is_err());
        assert!(workspace.resolve("/etc/passwd").is_err());
        assert!(workspace.resolve("docs/../../x").is_err());
    }
}
