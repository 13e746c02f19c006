//! Chat transcript model and its persistence.
//!
//! A chat is an ordered list of messages plus the chat's autonomy mode.
//! Assistant messages carry the operations of the turn that produced them;
//! `created` (a unique millisecond timestamp) is each message's identity.

pub mod history;
pub mod store;

use crate::operation::{ChatMode, Operation};
use crate::tokens::TokenCounts;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use store::{ChatStore, ChatSummary, ChatTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub created: u64,
    pub role: ChatRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenCounts>,
}

impl ChatMessage {
    pub fn user(created: u64, content: impl Into<String>) -> Self {
        Self {
            created,
            role: ChatRole::User,
            content: content.into(),
            reasoning: None,
            operations: None,
            tokens: None,
        }
    }

    /// Empty assistant message filled in while a turn streams.
    pub fn assistant(created: u64) -> Self {
        Self {
            role: ChatRole::Assistant,
            ..Self::user(created, String::new())
        }
    }

    pub fn operations(&self) -> &[Operation] {
        self.operations.as_deref().unwrap_or_default()
    }

    /// True when at least one operation still waits for a decision.
    pub fn awaits_approval(&self) -> bool {
        self.operations()
            .iter()
            .any(|op| op.status.awaits_approval())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatData {
    pub id: String,
    pub mode: ChatMode,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatData {
    pub fn new(id: impl Into<String>, mode: ChatMode) -> Self {
        Self {
            id: id.into(),
            mode,
            messages: Vec::new(),
        }
    }

    pub fn message(&self, created: u64) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.created == created)
    }

    pub fn message_mut(&mut self, created: u64) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.created == created)
    }

    /// A `created` key later than every existing message.
    ///
    /// Wall-clock milliseconds, bumped when two messages land in the same
    /// millisecond (or the clock steps back).
    pub fn next_created(&self) -> u64 {
        let now = now_unix_millis();
        match self.messages.iter().map(|m| m.created).max() {
            Some(last) if last >= now => last + 1,
            _ => now,
        }
    }

    /// Insert `message`, replacing any message with the same `created`.
    pub fn upsert(&mut self, message: ChatMessage) {
        match self.message_mut(message.created) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
    }

    /// Most recent assistant message that still has operations awaiting approval.
    pub fn latest_awaiting(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::Assistant && m.awaits_approval())
    }
}

pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
