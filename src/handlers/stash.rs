//! `output_fetch`: return the full text behind a truncated operation message.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Handler, HandlerOutcome};
use crate::error::OperationError;
use crate::operation::OperationContext;
use crate::types::ToolDefinition;

#[derive(Deserialize)]
struct FetchArgs {
    key: String,
}

pub struct OutputFetchHandler;

#[async_trait]
impl Handler for OutputFetchHandler {
    fn kind(&self) -> &'static str {
        "output_fetch"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.kind(),
            "Fetch the full text of an operation message that was truncated. \
             Truncated messages end with `output_fetch key=<key>`.",
            json!({
                "type": "object",
                "properties": {"key": {"type": "string"}},
                "required": ["key"]
            }),
        )
    }

    fn validate(&self, input: &Value) -> Result<(), OperationError> {
        parse_args::<FetchArgs>(input).map(|_| ())
    }

    async fn analyze(&self, input: &Value, _ctx: &OperationContext) -> Result<String, OperationError> {
        let args: FetchArgs = parse_args(input)?;
        Ok(format!("Fetch stashed output {}", args.key))
    }

    async fn execute(
        &self,
        input: &Value,
        ctx: &OperationContext,
    ) -> Result<HandlerOutcome, OperationError> {
        let args: FetchArgs = parse_args(input)?;
        let text = ctx
            .env
            .stash
            .fetch(&ctx.chat_id, &args.key)
            .ok_or_else(|| OperationError::HandlerFailed(format!("no stashed output `{}`", args.key)))?;
        Ok(HandlerOutcome::done(format!("Fetched {} characters", text.chars().count()))
            .with_output(json!({"key": args.key, "text": text})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Environment;
    use crate::operation::{ChatMode, OutputStash};
    use crate::testsupport::TestTempDir;

    #[tokio::test]
    async fn fetches_stashed_text() {
        let ctx = OperationContext {
            chat_id: "chat".to_string(),
            mode: ChatMode::None,
            env: Environment::in_memory("."),
            max_message_chars: 2_000,
        };
        let key = ctx.env.stash.put("chat", "the full story".to_string());
        let outcome = OutputFetchHandler
            .execute(&json!({"key": key}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.output.unwrap()["text"], "the full story");

        let missing = OutputFetchHandler
            .execute(&json!({"key": "nope"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(missing.to_string(), "no stashed output `nope`");
    }

    #[tokio::test]
    async fn fetches_output_stashed_by_an_earlier_environment() {
        let dir = TestTempDir::new("fetch-persisted");
        let path = dir.path().join("stash.json");
        let earlier = OutputStash::open(&path).unwrap();
        let key = earlier.put("chat", "written before restart".to_string());

        let mut env = Environment::in_memory(dir.path());
        env.stash = OutputStash::open(&path).unwrap();
        let ctx = OperationContext {
            chat_id: "chat".to_string(),
            mode: ChatMode::None,
            env,
            max_message_chars: 2_000,
        };
        let outcome = OutputFetchHandler
            .execute(&json!({"key": key.clone()}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.output.unwrap()["text"], "written before restart");

        let other_chat = OperationContext {
            chat_id: "elsewhere".to_string(),
            ..ctx
        };
        assert!(OutputFetchHandler
            .execute(&json!({"key": key}), &other_chat)
            .await
            .is_err());
    }
}
