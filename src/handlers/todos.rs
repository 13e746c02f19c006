//! Scratch todo list, kept in memory for the life of the process.
//!
//! These handlers are classified `local`: they never touch anything outside
//! the running assistant and so always run without approval.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use super::{parse_args, Handler, HandlerOutcome};
use crate::error::OperationError;
use crate::operation::OperationContext;
use crate::types::ToolDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TodoItem {
    pub id: u64,
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Default)]
struct TodoState {
    next_id: u64,
    items: Vec<TodoItem>,
}

#[derive(Debug, Clone, Default)]
pub struct TodoList {
    state: Arc<Mutex<TodoState>>,
}

impl TodoList {
    pub fn add(&self, text: String) -> Result<TodoItem, OperationError> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let item = TodoItem {
            id: state.next_id,
            text,
            done: false,
        };
        state.items.push(item.clone());
        Ok(item)
    }

    pub fn items(&self) -> Result<Vec<TodoItem>, OperationError> {
        Ok(self.lock()?.items.clone())
    }

    /// Mark an item done. `Ok(None)` when no such item exists.
    pub fn complete(&self, id: u64) -> Result<Option<TodoItem>, OperationError> {
        let mut state = self.lock()?;
        Ok(state.items.iter_mut().find(|item| item.id == id).map(|item| {
            item.done = true;
            item.clone()
        }))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TodoState>, OperationError> {
        self.state
            .lock()
            .map_err(|_| OperationError::HandlerFailed("todo list lock poisoned".into()))
    }
}

#[derive(Deserialize)]
struct AddArgs {
    text: String,
}

#[derive(Deserialize)]
struct CompleteArgs {
    id: u64,
}

#[derive(Deserialize)]
struct NoArgs {}

pub struct TodoAddHandler;

#[async_trait]
impl Handler for TodoAddHandler {
    fn kind(&self) -> &'static str {
        "todo_add"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Add an item to your scratch todo list for this session.",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<AddArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, _ctx: &OperationContext) -> Result<String, OperationError> {
        let args: AddArgs = parse_args(input)?;
        Ok(format!("Add todo: {}", args.text))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: AddArgs = parse_args(input)?;
        let item = ctx.env.todos.add(args.text)?;
        Ok(HandlerOutcome::done(format!("Added todo #{}: {}", item.id, item.text))
            .with_output(json!(item)))
    }
}

pub struct TodoListHandler;

#[async_trait]
impl Handler for TodoListHandler {
    fn kind(&self) -> &'static str {
        "todo_list"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Show your scratch todo list.",
            json!({"type": "object", "properties": {}}),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<NoArgs>(input).map(|_| ())
    }

    async fn analyze(&self, _input: &Value, _ctx: &OperationContext) -> Result<String, OperationError> {
        Ok("Show todo list".to_string())
    }

    async fn execute(
        &self,
        _input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let items = ctx.env.todos.items()?;
        let lines: Vec<String> = items
            .iter()
            .map(|item| {
                let mark = if item.done { "x" } else { " " };
                format!("[{mark}] #{} {}", item.id, item.text)
            })
            .collect();
        let message = if lines.is_empty() {
            "Todo list is empty".to_string()
        } else {
            lines.join("\n")
        };
        Ok(HandlerOutcome::done(message).with_output(json!({"items": items})))
    }
}

pub struct TodoCompleteHandler;

#[async_trait]
impl Handler for TodoCompleteHandler {
    fn kind(&self) -> &'static str {
        "todo_complete"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Mark a scratch todo item complete.",
            json!({
                "type": "object",
                "properties": {"id": {"type": "integer"}},
                "required": ["id"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<CompleteArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, _ctx: &OperationContext) -> Result<String, OperationError> {
        let args: CompleteArgs = parse_args(input)?;
        Ok(format!("Complete todo #{}", args.id))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: CompleteArgs = parse_args(input)?;
        match ctx.env.todos.complete(args.id)? {
            Some(item) => Ok(HandlerOutcome::done(format!("Completed todo #{}", item.id))
                .with_output(json!(item))),
            None => Err(OperationError::HandlerFailed(format!(
                "no todo item #{}",
                args.id
            ))),
        }
    }
}
