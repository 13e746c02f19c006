//! Events produced while a turn runs.
//!
//! Every event is wrapped in a [`ChatEventEnvelope`] carrying a per-run
//! sequence number so consumers can detect gaps and order replays.

use super::state::TurnState;
use crate::chat::{now_unix_millis, ChatMessage};
use crate::operation::{Operation, OperationSummary};
use crate::tokens::TokenCounts;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatEvent {
    /// The user's prompt was stored.
    UserMessage { message: ChatMessage },
    /// The assistant message being streamed changed.
    PendingUpdate { message: ChatMessage },
    Tokens(TokenCounts),
    Elapsed { ms: u64 },
    /// Operations of one assistant message after its tool calls settled.
    Operations {
        created: u64,
        operations: Vec<Operation>,
        summary: OperationSummary,
    },
    Status {
        status: TurnState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Complete { message: ChatMessage },
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEventEnvelope {
    pub seq: u64,
    pub ts_unix_ms: u64,
    pub chat_id: String,
    pub event: ChatEvent,
}

/// Numbered event emitter for one chat run.
///
/// A sink without a receiver drops events, which lets callers that only
/// care about the outcome run a turn without wiring a channel.
#[derive(Debug)]
pub struct EventSink {
    chat_id: String,
    tx: Option<mpsc::UnboundedSender<ChatEventEnvelope>>,
    seq: u64,
}

impl EventSink {
    pub fn new(chat_id: impl Into<String>, tx: mpsc::UnboundedSender<ChatEventEnvelope>) -> Self {
        Self {
            chat_id: chat_id.into(),
            tx: Some(tx),
            seq: 0,
        }
    }

    pub fn discard(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            tx: None,
            seq: 0,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Emit one event. Returns false when nobody is listening.
    pub fn emit(&mut self, event: ChatEvent) -> bool {
        let envelope = ChatEventEnvelope {
            seq: self.seq,
            ts_unix_ms: now_unix_millis(),
            chat_id: self.chat_id.clone(),
            event,
        };
        self.seq = self.seq.saturating_add(1);
        self.tx.as_ref().is_some_and(|tx| tx.send(envelope).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_numbers_increase_per_emit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = EventSink::new("chat-1", tx);
        assert!(sink.emit(ChatEvent::Elapsed { ms: 1 }));
        assert!(sink.emit(ChatEvent::Error {
            error: "boom".into()
        }));
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.seq, second.seq), (0, 1));
        assert_eq!(second.chat_id, "chat-1");
    }

    #[test]
    fn discarding_sink_reports_no_listener() {
        let mut sink = EventSink::discard("chat-1");
        assert!(!sink.emit(ChatEvent::Elapsed { ms: 1 }));
    }

    #[test]
    fn events_are_tagged_by_type() {
        let value = serde_json::to_value(ChatEvent::Tokens(TokenCounts {
            prompt: 1,
            output: 2,
            reasoning: 0,
            discarded: 3,
        }))
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "tokens", "prompt": 1, "output": 2, "reasoning": 0, "discarded": 3})
        );

        let value = serde_json::to_value(ChatEvent::Status {
            status: TurnState::AwaitingApproval,
            detail: None,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "status", "status": "awaitingApproval"}));
    }
}
