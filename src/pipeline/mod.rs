//! NL-to-SQL pipeline: generate, describe, grade, and loop back with
//! escalation until the grade accepts or the retry budget runs out.
//!
//! ```ignore
//! let pipeline = Pipeline::new(client, store, schema)
//!     .with_policy(RetryPolicy::default())
//!     .with_observer(Arc::new(ConsoleObserver));
//! let outcome = pipeline.run("1", "show total contributions by donor").await?;
//! println!("{}", outcome.sql_query);
//! ```

pub mod controller;
pub mod hooks;
pub mod stages;
pub mod state;
pub mod trace;

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{ModelClient, ModelTier, ModelUnavailableError};
use crate::prompts::{PromptError, Stage};
use crate::store::{SessionRecord, SessionStore, StoreError};

use controller::{Phase, RetryPolicy, TerminationReason};
use hooks::{PipelineEvent, StageObserver};
use stages::{StageCall, StageContext};
use state::{PipelineState, StateViolation};
use trace::{now_epoch_ms, StageTrace, TraceSink};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    MissingVariable(#[from] PromptError),
    #[error(transparent)]
    ModelUnavailable(#[from] ModelUnavailableError),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("session `{session_id}` has invalid state: {violation}")]
    InvalidState {
        session_id: String,
        violation: StateViolation,
    },
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub session_id: String,
    pub run_id: Uuid,
    /// Last generated query, reported the same way however the session ended.
    pub sql_query: String,
    pub reason: TerminationReason,
    pub attempts: u32,
    pub state: PipelineState,
}

pub struct Pipeline {
    client: Arc<dyn ModelClient>,
    store: Arc<dyn SessionStore>,
    schema: String,
    policy: RetryPolicy,
    observer: Option<Arc<dyn StageObserver>>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn ModelClient>,
        store: Arc<dyn SessionStore>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            schema: schema.into(),
            policy: RetryPolicy::default(),
            observer: None,
            trace: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start a fresh session for `question`, replacing any record stored
    /// under the same key.
    pub async fn run(
        &self,
        session_id: &str,
        question: &str,
    ) -> Result<PipelineOutcome, PipelineError> {
        let record = SessionRecord::new(session_id, question);
        self.store.put(&record).await?;
        info!(session_id, "session started");
        self.drive(record).await
    }

    /// Continue a stored session from its last completed stage.
    pub async fn resume(&self, session_id: &str) -> Result<PipelineOutcome, PipelineError> {
        let record = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;
        record
            .state
            .validate()
            .map_err(|violation| PipelineError::InvalidState {
                session_id: session_id.to_string(),
                violation,
            })?;
        info!(
            session_id,
            phase = record.phase.as_str(),
            retry_count = record.state.retry_count,
            "session resumed"
        );
        self.drive(record).await
    }

    async fn drive(&self, mut record: SessionRecord) -> Result<PipelineOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let session_id = record.session_id.clone();
        let ctx = StageContext {
            client: self.client.as_ref(),
            schema: &self.schema,
            session_id: &session_id,
            run_id,
        };

        while !record.phase.is_terminal() {
            let phase = record.phase;
            let (stage, tier, attempt) = match phase {
                Phase::Generating => (
                    Stage::Generate,
                    ModelTier::from_escalate(record.state.escalate),
                    record.state.retry_count + 1,
                ),
                Phase::Describing => (Stage::Describe, ModelTier::Default, record.state.retry_count),
                Phase::Grading => (Stage::Grade, ModelTier::Default, record.state.retry_count),
                Phase::Terminating => break,
            };
            let model = self.client.model_name(tier).to_string();

            info!(
                session_id = %session_id,
                phase = phase.as_str(),
                attempt,
                tier = tier.as_str(),
                model = %model,
                "stage started"
            );
            self.emit(&PipelineEvent::PhaseStarted {
                session_id: &session_id,
                phase,
                attempt,
                tier,
                model: &model,
            });

            let prev = record.state.clone();
            let result = match phase {
                Phase::Generating => stages::generate(&ctx, &mut record.state).await,
                Phase::Describing => stages::describe(&ctx, &mut record.state).await,
                _ => stages::grade(&ctx, &mut record.state).await,
            };
            let call = match result {
                Ok(call) => call,
                Err(err) => {
                    warn!(session_id = %session_id, phase = phase.as_str(), error = %err, "stage failed");
                    self.record_trace(StageTrace {
                        timestamp_ms: now_epoch_ms(),
                        run_id,
                        session_id: session_id.clone(),
                        stage,
                        attempt,
                        tier,
                        model,
                        prompt_template_slug: None,
                        output: None,
                        grade: None,
                        input_tokens: 0,
                        output_tokens: 0,
                        cost_nanodollars: 0,
                        latency_ms: 0,
                        error: Some(err.to_string()),
                    });
                    return Err(err);
                }
            };

            record
                .state
                .check_progress(&prev)
                .map_err(|violation| PipelineError::InvalidState {
                    session_id: session_id.clone(),
                    violation,
                })?;

            debug!(
                session_id = %session_id,
                stage = %call.stage,
                output = %call.completion.text,
                "stage output"
            );
            self.record_trace(stage_trace(run_id, &session_id, attempt, &call));
            self.emit(&PipelineEvent::StageCompleted {
                session_id: &session_id,
                call: &call,
            });

            let next = controller::advance(phase, &mut record.state, &self.policy);
            if phase == Phase::Grading && next == Phase::Generating {
                warn!(
                    session_id = %session_id,
                    attempt,
                    "grade rejected; escalating to higher-power model"
                );
                self.emit(&PipelineEvent::Escalated {
                    session_id: &session_id,
                    next_attempt: record.state.retry_count + 1,
                });
            }

            record.phase = next;
            record.touch();
            self.store.put(&record).await?;
        }

        let reason = controller::termination_reason(&record.state);
        let sql_query = record.state.sql_query.clone().unwrap_or_default();
        let attempts = record.state.retry_count;

        info!(
            session_id = %session_id,
            attempts,
            reason = ?reason,
            "session terminated"
        );
        self.emit(&PipelineEvent::Terminated {
            session_id: &session_id,
            reason,
            sql_query: &sql_query,
            attempts,
        });

        Ok(PipelineOutcome {
            session_id,
            run_id,
            sql_query,
            reason,
            attempts,
            state: record.state,
        })
    }

    fn emit(&self, event: &PipelineEvent<'_>) {
        if let Some(observer) = &self.observer {
            observer.on_event(event);
        }
    }

    fn record_trace(&self, event: StageTrace) {
        if let Some(trace) = &self.trace {
            if let Err(err) = trace.record(event) {
                warn!(error = %err, "failed to record stage trace");
            }
        }
    }
}

fn stage_trace(run_id: Uuid, session_id: &str, attempt: u32, call: &StageCall) -> StageTrace {
    StageTrace {
        timestamp_ms: now_epoch_ms(),
        run_id,
        session_id: session_id.to_string(),
        stage: call.stage,
        attempt,
        tier: call.tier,
        model: call.completion.model.clone(),
        prompt_template_slug: Some(call.template_slug.to_string()),
        output: Some(call.completion.text.clone()),
        grade: call.grade,
        input_tokens: call.completion.input_tokens,
        output_tokens: call.completion.output_tokens,
        cost_nanodollars: call.completion.cost_nanodollars,
        latency_ms: call.completion.latency.as_millis() as u64,
        error: None,
    }
}
