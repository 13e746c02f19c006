//! Stored transcript to model input.
//!
//! Operations recorded on earlier assistant messages are replayed to the model
//! as text appended to that message, built from each operation's summary line
//! so nothing is ever re-executed and raw handler output never leaks back in.

use super::{ChatMessage, ChatRole};
use crate::types::Message;

pub const OPERATION_RESULTS_HEADER: &str = "[operation results]";

/// Build the request history for a chat, optionally led by a system prompt.
pub fn model_messages(system_prompt: &str, transcript: &[ChatMessage]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(transcript.len() + 1);
    if !system_prompt.trim().is_empty() {
        messages.push(Message::system(system_prompt));
    }
    for message in transcript {
        match message.role {
            ChatRole::User => messages.push(Message::user(&message.content)),
            ChatRole::Assistant => {
                if let Some(text) = assistant_text(message) {
                    messages.push(Message::assistant(text));
                }
            }
        }
    }
    messages
}

/// Visible text of an assistant message, `None` when there is nothing to say.
fn assistant_text(message: &ChatMessage) -> Option<String> {
    let operations = message.operations();
    if operations.is_empty() {
        return (!message.content.trim().is_empty()).then(|| message.content.clone());
    }

    let mut text = message.content.trim_end().to_string();
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(OPERATION_RESULTS_HEADER);
    for (idx, op) in operations.iter().enumerate() {
        text.push_str(&format!("\n#{idx} {}", op.summary_line()));
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, OperationRequest, OperationRiskKind, OperationStatus};
    use crate::types::Role;
    use serde_json::json;

    fn operation(status: OperationStatus) -> Operation {
        let mut op = Operation::new(
            OperationRequest::new("file_read", json!({"path": "notes.md"})),
            OperationRiskKind::Read,
        );
        op.status = status;
        op
    }

    #[test]
    fn system_prompt_leads_and_blank_prompt_is_skipped() {
        let transcript = vec![ChatMessage::user(1, "hi")];
        let messages = model_messages("be brief", &transcript);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);

        assert_eq!(model_messages("  ", &transcript).len(), 1);
    }

    #[test]
    fn operations_become_summary_text_without_raw_output() {
        let mut done = operation(OperationStatus::Done);
        done.message = Some("read 12 lines".into());
        done.output = Some(json!({"content": "SECRET BODY"}));
        let mut waiting = operation(OperationStatus::Analyzed);
        waiting.analysis = Some("would read notes.md".into());

        let mut assistant = ChatMessage::assistant(2);
        assistant.content = "Looking.".into();
        assistant.operations = Some(vec![done, waiting]);

        let messages = model_messages("", &[ChatMessage::user(1, "read it"), assistant]);
        let text = messages[1].content.as_deref().unwrap();
        assert!(text.starts_with("Looking.\n\n[operation results]"));
        assert!(text.contains("#0 file_read (read) done: read 12 lines"));
        assert!(text.contains("#1 file_read (read) analyzed: would read notes.md"));
        assert!(!text.contains("SECRET BODY"));
    }

    #[test]
    fn empty_assistant_messages_are_dropped() {
        let messages = model_messages(
            "",
            &[ChatMessage::user(1, "hi"), ChatMessage::assistant(2)],
        );
        assert_eq!(messages.len(), 1);
    }
}
