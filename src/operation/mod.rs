//! Operation lifecycle engine.
//!
//! An [`Operation`] is one audited unit of side-effecting work proposed by
//! the model. The [`catalog`] classifies it by risk, the [`policy`] decides
//! whether the chat's mode lets it run unattended, the [`manager`] drives it
//! through execution within a turn, and the [`resolver`] applies human
//! approve/reject decisions to operations left waiting.
//!
//! Status flow:
//!
//! ```text
//! analyzing -> analyzed        -> doing -> done | failed
//!           -> analyzedBlocked    (rejected from either waiting state)
//!           -> doing -> done | failed
//! ```

use crate::handlers::{Environment, HandlerOutcome, HandlerRegistry};
use crate::textutil::single_line_preview;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod catalog;
pub mod manager;
pub mod policy;
pub mod resolver;
pub mod stash;

pub use catalog::{Catalog, CatalogEntry, RiskRule};
pub use manager::OperationManager;
pub use policy::authorize;
pub use resolver::{ApprovalResolver, Resolution};
pub use stash::OutputStash;

/// Preview length used when an operation is rendered into a single line.
const SUMMARY_PREVIEW_CHARS: usize = 240;

// ---------------------------------------------------------------------------
// Risk kinds and chat modes
// ---------------------------------------------------------------------------

/// Potential impact of an operation, resolved once at classification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationRiskKind {
    Read,
    /// No externally visible side effect; always safe to run.
    Local,
    Create,
    Update,
    Delete,
}

impl OperationRiskKind {
    /// Policy rank: `read`/`local` < `create` < `update` < `delete`.
    pub fn rank(self) -> u8 {
        match self {
            Self::Read | Self::Local => 0,
            Self::Create => 1,
            Self::Update => 2,
            Self::Delete => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Local => "local",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationRiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-chat autonomy ceiling chosen by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Nothing except `local` operations runs without approval.
    #[default]
    None,
    Read,
    Create,
    Update,
    Delete,
}

impl ChatMode {
    /// Highest risk rank this mode auto-authorizes, `None` for mode `none`.
    pub fn ceiling(self) -> Option<u8> {
        match self {
            Self::None => None,
            Self::Read => Some(0),
            Self::Create => Some(1),
            Self::Update => Some(2),
            Self::Delete => Some(3),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub const ALL: [ChatMode; 5] = [
        ChatMode::None,
        ChatMode::Read,
        ChatMode::Create,
        ChatMode::Update,
        ChatMode::Delete,
    ];
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChatMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown chat mode `{s}` (expected none, read, create, update or delete)")
            })
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Analyzing,
    /// Waiting for approval; can be approved on its own.
    Analyzed,
    /// Waiting for approval, but depends on an earlier unapproved sibling.
    AnalyzedBlocked,
    Doing,
    Done,
    Rejected,
    Failed,
}

impl OperationStatus {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Analyzing | Self::Analyzed | Self::AnalyzedBlocked)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected | Self::Failed)
    }

    pub fn awaits_approval(self) -> bool {
        matches!(self, Self::Analyzed | Self::AnalyzedBlocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Analyzed => "analyzed",
            Self::AnalyzedBlocked => "analyzedBlocked",
            Self::Doing => "doing",
            Self::Done => "done",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Raw request received from a model tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    #[serde(rename = "type")]
    pub op_type: String,
    pub input: Value,
}

impl OperationRequest {
    pub fn new(op_type: impl Into<String>, input: Value) -> Self {
        Self {
            op_type: op_type.into(),
            input,
        }
    }
}

/// Mutable unit of work and its audit record.
///
/// Frozen once `status` is terminal; persisted inside the assistant message
/// of the turn that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: String,
    pub input: Value,
    pub kind: OperationRiskKind,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Outcome summary, possibly truncated with a stash key for the full text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Preview of the intended effect while awaiting approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    /// State the handler replaced or removed, kept for undo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
}

impl Operation {
    /// Create an operation in `analyzing` with its risk already resolved.
    pub fn new(request: OperationRequest, kind: OperationRiskKind) -> Self {
        Self {
            op_type: request.op_type,
            input: request.input,
            kind,
            status: OperationStatus::Analyzing,
            output: None,
            error: None,
            message: None,
            analysis: None,
            before: None,
        }
    }

    /// Claim the operation for execution.
    ///
    /// Returns false (and changes nothing) unless the operation is in
    /// `analyzing` or `analyzed`; this is the single-execution guard.
    pub fn begin(&mut self) -> bool {
        match self.status {
            OperationStatus::Analyzing | OperationStatus::Analyzed => {
                self.status = OperationStatus::Doing;
                true
            }
            _ => false,
        }
    }

    /// Record a handler outcome. Only valid while `doing`.
    fn complete(&mut self, outcome: HandlerOutcome, ctx: &OperationContext) {
        debug_assert_eq!(self.status, OperationStatus::Doing);
        self.before = outcome.before;
        self.message = outcome
            .message
            .map(|message| ctx.env.stash.shorten(&ctx.chat_id, &message, ctx.max_message_chars));
        if let Some(error) = outcome.error {
            self.status = OperationStatus::Failed;
            self.error = Some(error);
            return;
        }
        self.status = OperationStatus::Done;
        self.output = outcome.output;
    }

    /// Terminal failure, before or during execution.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = OperationStatus::Failed;
        self.output = None;
        self.error = Some(error.into());
    }

    /// Move a waiting operation to `rejected`. Returns false when not waiting.
    pub fn reject(&mut self) -> bool {
        if !self.status.awaits_approval() {
            return false;
        }
        self.status = OperationStatus::Rejected;
        self.output = None;
        self.message = Some("rejected by user".to_string());
        true
    }

    /// One-line text used for tool results and transcript continuity.
    ///
    /// Built from `message`/`analysis`/`error`, never from raw output.
    pub fn summary_line(&self) -> String {
        let detail = match self.status {
            OperationStatus::Done => self.message.as_deref().unwrap_or("completed"),
            OperationStatus::Failed => self.error.as_deref().unwrap_or("failed"),
            OperationStatus::Rejected => "rejected by user",
            OperationStatus::Analyzed => self.analysis.as_deref().unwrap_or("awaiting approval"),
            OperationStatus::AnalyzedBlocked => self
                .analysis
                .as_deref()
                .unwrap_or("blocked on an earlier operation"),
            OperationStatus::Analyzing | OperationStatus::Doing => "in progress",
        };
        format!(
            "{} ({}) {}: {}",
            self.op_type,
            self.kind,
            self.status,
            single_line_preview(detail, SUMMARY_PREVIEW_CHARS)
        )
    }
}

/// Run one operation through the guarded execution path.
///
/// Shared by the manager (auto-execution) and the resolver (approval).
/// Returns false without touching the handler when the operation was not
/// claimable.
pub(crate) async fn execute_operation(
    operation: &mut Operation,
    handlers: &HandlerRegistry,
    ctx: &OperationContext,
) -> bool {
    if !operation.begin() {
        tracing::warn!(
            op_type = %operation.op_type,
            status = %operation.status,
            "refusing to execute operation that is not pending"
        );
        return false;
    }
    run_claimed(operation, handlers, ctx).await;
    true
}

/// Run the handler of an operation already claimed with [`Operation::begin`].
///
/// Does nothing unless the operation is `doing`.
pub(crate) async fn run_claimed(
    operation: &mut Operation,
    handlers: &HandlerRegistry,
    ctx: &OperationContext,
) {
    if operation.status != OperationStatus::Doing {
        tracing::warn!(op_type = %operation.op_type, status = %operation.status, "operation was not claimed");
        return;
    }
    let Some(handler) = handlers.get(&operation.op_type) else {
        operation.fail(crate::error::OperationError::UnknownKind(operation.op_type.clone()).to_string());
        return;
    };
    tracing::debug!(op_type = %operation.op_type, kind = %operation.kind, "executing operation");
    match handler.execute(&operation.input, ctx).await {
        Ok(outcome) => operation.complete(outcome, ctx),
        Err(err) => {
            tracing::debug!(op_type = %operation.op_type, error = %err, "operation failed");
            operation.fail(err.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Context and summaries
// ---------------------------------------------------------------------------

/// Everything classification and handlers may consult for one chat.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub chat_id: String,
    pub mode: ChatMode,
    pub env: Environment,
    /// Messages longer than this are truncated and stashed.
    pub max_message_chars: usize,
}

/// Per-status counts reported with the `operations` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub rejected: usize,
    /// Waiting on a human decision (`analyzed` plus `analyzedBlocked`).
    pub need_approval: usize,
    /// Subset of `need_approval` blocked on a sibling.
    pub blocked: usize,
}

impl OperationSummary {
    pub fn from_operations(operations: &[Operation]) -> Self {
        let mut summary = Self {
            total: operations.len(),
            ..Self::default()
        };
        for op in operations {
            match op.status {
                OperationStatus::Done => summary.done += 1,
                OperationStatus::Failed => summary.failed += 1,
                OperationStatus::Rejected => summary.rejected += 1,
                OperationStatus::Analyzed => summary.need_approval += 1,
                OperationStatus::AnalyzedBlocked => {
                    summary.need_approval += 1;
                    summary.blocked += 1;
                }
                OperationStatus::Analyzing | OperationStatus::Doing => {}
            }
        }
        summary
    }
}

/// True when every operation reached `done`, `rejected` or `failed`.
pub fn all_concluded(operations: &[Operation]) -> bool {
    operations.iter().all(|op| op.status.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(status: OperationStatus) -> Operation {
        let mut op = Operation::new(
            OperationRequest::new("file_write", json!({"path": "a.txt"})),
            OperationRiskKind::Update,
        );
        op.status = status;
        op
    }

    #[test]
    fn begin_only_claims_pending_unblocked_operations() {
        assert!(sample(OperationStatus::Analyzing).begin());
        assert!(sample(OperationStatus::Analyzed).begin());
        for status in [
            OperationStatus::AnalyzedBlocked,
            OperationStatus::Doing,
            OperationStatus::Done,
            OperationStatus::Rejected,
            OperationStatus::Failed,
        ] {
            let mut op = sample(status);
            assert!(!op.begin(), "{status} must not be claimable");
            assert_eq!(op.status, status);
        }
    }

    #[test]
    fn reject_clears_output_and_only_applies_to_waiting_states() {
        let mut op = sample(OperationStatus::Analyzed);
        op.output = Some(json!({"leak": true}));
        assert!(op.reject());
        assert_eq!(op.status, OperationStatus::Rejected);
        assert!(op.output.is_none());

        let mut done = sample(OperationStatus::Done);
        assert!(!done.reject());
        assert_eq!(done.status, OperationStatus::Done);
    }

    #[test]
    fn status_serializes_in_camel_case() {
        let value = serde_json::to_value(sample(OperationStatus::AnalyzedBlocked)).expect("json");
        assert_eq!(value["status"], json!("analyzedBlocked"));
        assert_eq!(value["type"], json!("file_write"));
        assert_eq!(value["kind"], json!("update"));
        assert!(value.get("output").is_none());
    }

    #[test]
    fn chat_mode_parses_case_insensitively() {
        assert_eq!("Update".parse::<ChatMode>(), Ok(ChatMode::Update));
        assert_eq!(" none ".parse::<ChatMode>(), Ok(ChatMode::None));
        assert!("everything".parse::<ChatMode>().is_err());
    }

    #[test]
    fn summary_counts_waiting_and_terminal_states() {
        let ops = vec![
            sample(OperationStatus::Done),
            sample(OperationStatus::Analyzed),
            sample(OperationStatus::AnalyzedBlocked),
            sample(OperationStatus::Rejected),
            sample(OperationStatus::Failed),
        ];
        let summary = OperationSummary::from_operations(&ops);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.done, 1);
        assert_eq!(summary.need_approval, 2);
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.failed, 1);
        assert!(!all_concluded(&ops));

        let value = serde_json::to_value(summary).expect("json");
        assert_eq!(value["needApproval"], json!(2));
    }

    #[test]
    fn summary_line_prefers_error_for_failures() {
        let mut op = sample(OperationStatus::Doing);
        op.fail("disk full");
        assert_eq!(op.summary_line(), "file_write (update) failed: disk full");
    }
}
