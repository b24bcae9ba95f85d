//! Retry/escalation state machine.
//!
//! `next_phase` is a pure function of the current phase and state; `advance`
//! applies the one side effect the loop-back carries (escalation).

use serde::{Deserialize, Serialize};

use super::state::PipelineState;

/// Regenerations allowed after the first attempt.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generating,
    Describing,
    Grading,
    Terminating,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Generating => "generating",
            Phase::Describing => "describing",
            Phase::Grading => "grading",
            Phase::Terminating => "terminating",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Terminating
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Most generation attempts a session can make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// True once every allowed regeneration has been spent.
    pub fn exhausted(&self, state: &PipelineState) -> bool {
        state.retry_count >= self.max_attempts()
    }
}

/// Why a session stopped. Both reasons report the last query the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Accepted,
    RetriesExhausted,
}

pub fn next_phase(phase: Phase, state: &PipelineState, policy: &RetryPolicy) -> Phase {
    match phase {
        Phase::Generating => Phase::Describing,
        Phase::Describing => Phase::Grading,
        Phase::Grading => {
            if state.is_accepted() || policy.exhausted(state) {
                Phase::Terminating
            } else {
                Phase::Generating
            }
        }
        Phase::Terminating => Phase::Terminating,
    }
}

/// Move to the next phase, escalating on every loop back to generation.
pub fn advance(phase: Phase, state: &mut PipelineState, policy: &RetryPolicy) -> Phase {
    let next = next_phase(phase, state, policy);
    if phase == Phase::Grading && next == Phase::Generating {
        state.escalate();
    }
    next
}

pub fn termination_reason(state: &PipelineState) -> TerminationReason {
    if state.is_accepted() {
        TerminationReason::Accepted
    } else {
        TerminationReason::RetriesExhausted
    }
}
