//! Runtime command/event schema.
//!
//! Frontends drive the runtime actor with [`RuntimeCommand`]s and render the
//! [`RuntimeEventEnvelope`] stream it produces.

use crate::chat::now_unix_millis;
use crate::operation::{ChatMode, Resolution};
use crate::orchestrator::{ChatEventEnvelope, TurnState};
use serde::{Deserialize, Serialize};

/// Reference to one unit of work started by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub task_id: u64,
    pub chat_id: String,
}

impl TaskRef {
    pub fn new(task_id: u64, chat_id: impl Into<String>) -> Self {
        Self {
            task_id,
            chat_id: chat_id.into(),
        }
    }
}

/// Control-plane commands for a runtime actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeCommand {
    SubmitPrompt {
        chat_id: String,
        prompt: String,
    },
    /// Approve and reject operations of one stored assistant message.
    Resolve {
        chat_id: String,
        message_created: u64,
        #[serde(default)]
        approved: Vec<usize>,
        #[serde(default)]
        rejected: Vec<usize>,
        /// Run a follow-up turn once every operation has concluded.
        #[serde(default)]
        follow_up: bool,
    },
    CancelTask {
        task_id: u64,
    },
    SetMode {
        chat_id: String,
        mode: ChatMode,
    },
    Shutdown,
}

/// Monotonic envelope for runtime events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeEventEnvelope {
    pub seq: u64,
    pub ts_unix_ms: u64,
    pub event: RuntimeEvent,
}

impl RuntimeEventEnvelope {
    pub fn new(seq: u64, event: RuntimeEvent) -> Self {
        Self {
            seq,
            ts_unix_ms: now_unix_millis(),
            event,
        }
    }
}

/// Typed runtime event families.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum RuntimeEvent {
    Lifecycle(LifecycleEvent),
    Task(TaskEvent),
    /// Event from a running turn, re-sequenced into the runtime stream.
    Chat(ChatStreamEvent),
    Approval(ApprovalEvent),
    Mode(ModeEvent),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    RuntimeStarted,
    RuntimeStopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Queued {
        task: TaskRef,
        kind: String,
        details: String,
    },
    Started {
        task: TaskRef,
    },
    Cancelling {
        task: TaskRef,
    },
    /// The task ended; `state` is where the chat's last turn stopped.
    Completed {
        task: TaskRef,
        state: TurnState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_created: Option<u64>,
    },
    Failed {
        task: TaskRef,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatStreamEvent {
    pub task: TaskRef,
    pub envelope: ChatEventEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalEvent {
    Resolved {
        task: TaskRef,
        message_created: u64,
        resolution: Resolution,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModeEvent {
    Changed { chat_id: String, mode: ChatMode },
}

/// Error surfaced to frontends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskRef>,
    pub message: String,
}

impl ErrorEvent {
    pub fn untracked(message: impl Into<String>) -> Self {
        Self {
            task: None,
            message: message.into(),
        }
    }
}
