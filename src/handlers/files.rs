//! Workspace file handlers.
//!
//! - `file_read`, `file_list`: read-only.
//! - `file_write`: create or overwrite; keeps the previous content as `before`.
//! - `file_delete`: remove a file; keeps its content as `before`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Handler, HandlerOutcome};
use crate::error::OperationError;
use crate::operation::OperationContext;
use crate::textutil::truncate_with_suffix_by_chars;
use crate::types::ToolDefinition;

/// Maximum characters of file content placed in an operation's output.
const MAX_READ_CHARS: usize = 8000;

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default = "current_dir")]
    path: String,
}

fn current_dir() -> String {
    ".".to_string()
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": description}
        },
        "required": ["path"]
    })
}

// ---------------------------------------------------------------------------
// file_read
// ---------------------------------------------------------------------------

pub struct FileReadHandler;

#[async_trait]
impl Handler for FileReadHandler {
    fn kind(&self) -> &'static str {
        "file_read"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Read a text file from the workspace.",
            path_schema("Workspace-relative path of the file"),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<PathArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, _ctx: &OperationContext) -> Result<String, OperationError> {
        let args: PathArgs = parse_args(input)?;
        Ok(format!("Read {}", args.path))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: PathArgs = parse_args(input)?;
        let path = ctx.env.workspace.resolve(&args.path)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OperationError::HandlerFailed(format!("{}: {e}", args.path)))?;
        let bytes = content.len();
        Ok(HandlerOutcome::done(format!("Read {bytes} bytes from {}", args.path)).with_output(
            json!({
                "path": args.path,
                "content": truncate_with_suffix_by_chars(&content, MAX_READ_CHARS, "...[truncated]"),
            }),
        ))
    }
}

// ---------------------------------------------------------------------------
// file_list
// ---------------------------------------------------------------------------

pub struct FileListHandler;

#[async_trait]
impl Handler for FileListHandler {
    fn kind(&self) -> &'static str {
        "file_list"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "List entries of a workspace directory. Directories end with `/`.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Workspace-relative directory (default: workspace root)"
                    }
                }
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<ListArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, _ctx: &OperationContext) -> Result<String, OperationError> {
        let args: ListArgs = parse_args(input)?;
        Ok(format!("List {}", args.path))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: ListArgs = parse_args(input)?;
        let dir = ctx.env.workspace.resolve(&args.path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| OperationError::HandlerFailed(format!("{}: {e}", args.path)))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        Ok(
            HandlerOutcome::done(format!("{} entries in {}", entries.len(), args.path))
                .with_output(json!({"path": args.path, "entries": entries})),
        )
    }
}

// ---------------------------------------------------------------------------
// file_write
// ---------------------------------------------------------------------------

pub struct FileWriteHandler;

#[async_trait]
impl Handler for FileWriteHandler {
    fn kind(&self) -> &'static str {
        "file_write"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Write content to a workspace file. Creates the file if it doesn't exist, overwrites if it does.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Workspace-relative path of the file"},
                    "content": {"type": "string", "description": "Full new content of the file"}
                },
                "required": ["path", "content"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<WriteArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, ctx: &OperationContext) -> Result<String, OperationError> {
        let args: WriteArgs = parse_args(input)?;
        let path = ctx.env.workspace.resolve(&args.path)?;
        let analysis = match tokio::fs::metadata(&path).await {
            Ok(meta) => format!(
                "Overwrite {} ({} -> {} bytes)",
                args.path,
                meta.len(),
                args.content.len()
            ),
            Err(_) => format!("Create {} ({} bytes)", args.path, args.content.len()),
        };
        Ok(analysis)
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: WriteArgs = parse_args(input)?;
        let path = ctx.env.workspace.resolve(&args.path)?;
        let previous = tokio::fs::read_to_string(&path).await.ok();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &args.content)
            .await
            .map_err(|e| OperationError::HandlerFailed(format!("{}: {e}", args.path)))?;

        let verb = if previous.is_some() { "Updated" } else { "Created" };
        let outcome = HandlerOutcome::done(format!(
            "{verb} {} ({} bytes)",
            args.path,
            args.content.len()
        ))
        .with_output(json!({"path": args.path, "bytes": args.content.len()}))
        .with_before(json!({"path": args.path, "content": previous}));
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// file_delete
// ---------------------------------------------------------------------------

pub struct FileDeleteHandler;

#[async_trait]
impl Handler for FileDeleteHandler {
    fn kind(&self) -> &'static str {
        "file_delete"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Delete a file from the workspace.",
            path_schema("Workspace-relative path of the file to delete"),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<PathArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, ctx: &OperationContext) -> Result<String, OperationError> {
        let args: PathArgs = parse_args(input)?;
        let path = ctx.env.workspace.resolve(&args.path)?;
        Ok(match tokio::fs::metadata(&path).await {
            Ok(meta) => format!("Delete {} ({} bytes)", args.path, meta.len()),
            Err(_) => format!("Nothing to delete at {}", args.path),
        })
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: PathArgs = parse_args(input)?;
        let path = ctx.env.workspace.resolve(&args.path)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HandlerOutcome::done(format!(
                    "Nothing to delete at {}",
                    args.path
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Ok(HandlerOutcome::failed(format!(
                "{} is a directory",
                args.path
            )));
        }
        let previous = tokio::fs::read(&path).await?;
        tokio::fs::remove_file(&path).await?;
        Ok(HandlerOutcome::done(format!("Deleted {}", args.path)).with_before(json!({
            "path": args.path,
            "content": String::from_utf8_lossy(&previous),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Environment;
    use crate::operation::ChatMode;
    use crate::testsupport::TestTempDir;

    fn context(dir: &TestTempDir) -> OperationContext {
        OperationContext {
            chat_id: "chat".to_string(),
            mode: ChatMode::Delete,
            env: Environment::in_memory(dir.path()),
            max_message_chars: 2_000,
        }
    }

    #[tokio::test]
    async fn write_then_overwrite_keeps_before() {
        let dir = TestTempDir::new("files-write");
        let ctx = context(&dir);
        let first = FileWriteHandler
            .execute(&json!({"path": "notes/a.txt", "content": "one"}), &ctx)
            .await
            .unwrap();
        assert_eq!(first.message.as_deref(), Some("Created notes/a.txt (3 bytes)"));
        assert_eq!(first.before.unwrap()["content"], Value::Null);

        let analysis = FileWriteHandler
            .analyze(&json!({"path": "notes/a.txt", "content": "three"}), &ctx)
            .await
            .unwrap();
        assert_eq!(analysis, "Overwrite notes/a.txt (3 -> 5 bytes)");

        let second = FileWriteHandler
            .execute(&json!({"path": "notes/a.txt", "content": "three"}), &ctx)
            .await
            .unwrap();
        assert_eq!(second.before.unwrap()["content"], "one");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes/a.txt")).unwrap(),
            "three"
        );
    }

    #[tokio::test]
    async fn read_missing_file_is_an_error() {
        let dir = TestTempDir::new("files-read-missing");
        let err = FileReadHandler
            .execute(&json!({"path": "nope.txt"}), &context(&dir))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("nope.txt:"), "got: {err}");
    }

    #[tokio::test]
    async fn list_marks_directories() {
        let dir = TestTempDir::new("files-list");
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let outcome = FileListHandler
            .execute(&json!({}), &context(&dir))
            .await
            .unwrap();
        assert_eq!(outcome.output.unwrap()["entries"], json!(["b.txt", "sub/"]));
    }

    #[tokio::test]
    async fn delete_is_noop_for_missing_and_keeps_content_otherwise() {
        let dir = TestTempDir::new("files-delete");
        let ctx = context(&dir);
        let noop = FileDeleteHandler
            .execute(&json!({"path": "a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(noop.message.as_deref(), Some("Nothing to delete at a.txt"));

        std::fs::write(dir.path().join("a.txt"), "bye").unwrap();
        let outcome = FileDeleteHandler
            .execute(&json!({"path": "a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.before.unwrap()["content"], "bye");
        assert!(!dir.path().join("a.txt").exists());
    }

    #[test]
    fn validate_requires_path() {
        assert!(FileWriteHandler.validate(&json!({"content": "x"})).is_err());
        assert!(FileReadHandler.validate(&json!({"path": "x"})).is_ok());
        assert!(FileListHandler.validate(&json!({})).is_ok());
    }
}
