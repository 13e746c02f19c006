//! Token accounting for one run of the orchestrator.
//!
//! Streaming providers report tokens as they go and sometimes reconcile with
//! an authoritative `usage` block at the end; both paths feed the same
//! counters. Output of a turn that the model restarts is moved to
//! `discarded` rather than lost.

use serde::{Deserialize, Serialize};

/// Snapshot sent with `tokens` events and stored on assistant messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    pub prompt: u64,
    pub output: u64,
    pub reasoning: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TokenTracker {
    totals: TokenCounts,
    turn_prompt: u64,
    turn_output: u64,
    turn_discarded: u64,
    turn_reasoning: u64,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> TokenCounts {
        self.totals
    }

    /// Start counting a new model turn.
    pub fn begin_turn(&mut self) {
        self.turn_prompt = 0;
        self.turn_output = 0;
        self.turn_discarded = 0;
        self.turn_reasoning = 0;
    }

    pub fn record_request(&mut self, count: u64) {
        self.turn_prompt = self.turn_prompt.saturating_add(count);
        self.totals.prompt = self.totals.prompt.saturating_add(count);
    }

    pub fn record_output(&mut self, count: u64) {
        self.turn_output = self.turn_output.saturating_add(count);
        self.totals.output = self.totals.output.saturating_add(count);
    }

    pub fn record_reasoning(&mut self, count: u64) {
        self.turn_reasoning = self.turn_reasoning.saturating_add(count);
        self.totals.reasoning = self.totals.reasoning.saturating_add(count);
    }

    /// Reconcile with provider-reported usage for the current turn.
    ///
    /// Counts only ever grow: a usage block smaller than what was already
    /// streamed changes nothing. Reported output covers discarded output of
    /// the same turn too.
    pub fn reconcile(&mut self, prompt: u64, output: u64, reasoning: u64) {
        if prompt > self.turn_prompt {
            self.record_request(prompt - self.turn_prompt);
        }
        let streamed = self.turn_output.saturating_add(self.turn_discarded);
        if output > streamed {
            self.record_output(output - streamed);
        }
        if reasoning > self.turn_reasoning {
            self.record_reasoning(reasoning - self.turn_reasoning);
        }
    }

    /// The model restarted its answer: move this turn's output to `discarded`.
    pub fn discard_turn_output(&mut self) {
        self.totals.output = self.totals.output.saturating_sub(self.turn_output);
        self.totals.discarded = self.totals.discarded.saturating_add(self.turn_output);
        self.turn_discarded = self.turn_discarded.saturating_add(self.turn_output);
        self.turn_output = 0;
    }
}

/// Rough token estimate for streamed text (~1 token per 4 characters).
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}
