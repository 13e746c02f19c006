//! Turn state machine.

use crate::error::TurnError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one logical request/response exchange.
///
/// ```text
/// idle -> running -> awaitingApproval | done | cancelled | errored
/// ```
///
/// `idle` may also end directly in `cancelled` or `errored` when the turn
/// never got as far as calling the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnState {
    Idle,
    Running,
    AwaitingApproval,
    Done,
    Cancelled,
    Errored,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingApproval => "awaitingApproval",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
        }
    }

    pub fn is_final(self) -> bool {
        !matches!(self, Self::Idle | Self::Running)
    }

    /// Move to `next`, or fail when the edge is not part of the machine.
    pub fn transition(self, next: TurnState) -> Result<TurnState, TurnError> {
        let allowed = match (self, next) {
            (Self::Idle, Self::Running | Self::Cancelled | Self::Errored) => true,
            (Self::Running, next) => next.is_final(),
            _ => false,
        };
        if !allowed {
            return Err(TurnError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            });
        }
        tracing::debug!(from = self.as_str(), to = next.as_str(), "turn transition");
        Ok(next)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
