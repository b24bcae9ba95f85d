//! Observer hook for stage transitions.
//!
//! The pipeline reports progress through a `StageObserver` so the library
//! never prints on its own; the CLI plugs in `ConsoleObserver`.

use crate::model::ModelTier;

use super::controller::{Phase, TerminationReason};
use super::stages::StageCall;

#[derive(Debug)]
pub enum PipelineEvent<'a> {
    /// A stage is about to call its model.
    PhaseStarted {
        session_id: &'a str,
        phase: Phase,
        attempt: u32,
        tier: ModelTier,
        model: &'a str,
    },
    StageCompleted {
        session_id: &'a str,
        call: &'a StageCall,
    },
    /// Grading rejected the query; the next generation uses the higher-power model.
    Escalated { session_id: &'a str, next_attempt: u32 },
    Terminated {
        session_id: &'a str,
        reason: TerminationReason,
        sql_query: &'a str,
        attempts: u32,
    },
}

pub trait StageObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent<'_>);
}

/// Prints one progress line per transition to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleObserver;

impl StageObserver for ConsoleObserver {
    fn on_event(&self, event: &PipelineEvent<'_>) {
        match event {
            PipelineEvent::PhaseStarted {
                phase,
                attempt,
                model,
                ..
            } => match phase {
                Phase::Generating => {
                    eprintln!("[pipeline] generating sql query (attempt {attempt}, {model})")
                }
                Phase::Describing => eprintln!("[pipeline] describing sql query ({model})"),
                Phase::Grading => eprintln!("[pipeline] grading sql query ({model})"),
                Phase::Terminating => {}
            },
            PipelineEvent::StageCompleted { call, .. } => {
                if let Some(grade) = call.grade {
                    eprintln!("[pipeline] grade: {}", grade.as_str());
                }
            }
            PipelineEvent::Escalated { next_attempt, .. } => {
                eprintln!(
                    "[pipeline] answer is not good, escalating to the higher-power model for attempt {next_attempt}"
                );
            }
            PipelineEvent::Terminated {
                reason, attempts, ..
            } => match reason {
                TerminationReason::Accepted => {
                    eprintln!("[pipeline] answer looks fine after {attempts} attempt(s)")
                }
                TerminationReason::RetriesExhausted => eprintln!(
                    "[pipeline] retries exhausted after {attempts} attempt(s); reporting last query"
                ),
            },
        }
    }
}
