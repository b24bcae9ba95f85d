#![forbid(unsafe_code)]

//! # nl2sql-harness
//!
//! Turns a natural-language question plus a table description into a SQL
//! query, then checks its own work: a second model call describes what the
//! query does, and a third grades whether that description answers the
//! question. Rejected queries are regenerated on a higher-power model, up to
//! a fixed retry budget.
//!
//! Every session is keyed by an id and its state is persisted after each
//! completed stage, so an aborted run can be inspected or resumed.

pub mod config;
pub mod gateway;
pub mod inputs;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod store;

pub use config::ModelClientConfig;
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use inputs::{read_input_file, InputError};
pub use model::{Completion, GatewayModelClient, ModelClient, ModelTier, ModelUnavailableError};
pub use pipeline::controller::{next_phase, Phase, RetryPolicy, TerminationReason, MAX_RETRIES};
pub use pipeline::hooks::{ConsoleObserver, PipelineEvent, StageObserver};
pub use pipeline::state::{Grade, PipelineState, StateViolation};
pub use pipeline::trace::{JsonlTraceSink, StageTrace, TraceError, TraceSink, TraceWorker};
pub use pipeline::{Pipeline, PipelineError, PipelineOutcome};
pub use prompts::{build_prompt, PromptError, PromptInstance, Stage};
pub use store::{
    MemorySessionStore, SessionRecord, SessionStore, SqliteSessionStore, StoreError,
    DEFAULT_SESSION_ID,
};
