//! Per-attempt usage records.
//!
//! The gateway reports every transport attempt, successful or not, to a
//! `UsageSink`. The CLI discards them or prints them with `--usage`; tests
//! collect them in memory.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::ProviderError;
use super::types::{ChatRequest, ChatResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: &'static str,
    pub model: String,
    pub caller: &'static str,
    pub run_id: Option<Uuid>,
    pub session_id: Option<String>,
    /// Zero-based transport attempt within one gateway call.
    pub attempt: u32,
    pub status: CallStatus,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub upstream_cost_nanodollars: Option<i64>,
    pub latency_ms: u64,
    pub error_code: Option<&'static str>,
    pub request_id: Option<String>,
}

impl ProviderCallRecord {
    pub fn for_attempt(
        req: &ChatRequest,
        attempt: u32,
        latency: Duration,
        outcome: Result<&ChatResponse, &ProviderError>,
    ) -> Self {
        let mut record = Self {
            timestamp: Utc::now(),
            provider: req.model.provider(),
            model: req.model.model_id().to_string(),
            caller: req.attribution.caller,
            run_id: req.attribution.run_id,
            session_id: req.attribution.session_id.clone(),
            attempt,
            status: CallStatus::Success,
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency_ms: latency.as_millis() as u64,
            error_code: None,
            request_id: None,
        };

        match outcome {
            Ok(resp) => {
                record.input_tokens = resp.input_tokens;
                record.output_tokens = resp.output_tokens;
                record.cost_nanodollars = resp.cost_nanodollars;
                record.upstream_cost_nanodollars = resp.upstream_cost_nanodollars;
            }
            Err(err) => {
                record.status = CallStatus::Error;
                record.error_code = Some(err.code());
                record.request_id = err.request_id().map(str::to_string);
            }
        }
        record
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Fire-and-forget; a sink never fails the call it describes.
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// One JSON line per record on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => eprintln!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize usage record"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProviderCallRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match self.records.lock() {
            Ok(mut guard) => guard.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::{Attribution, ChatModel, Message};
    use crate::gateway::ErrorContext;

    fn request() -> ChatRequest {
        ChatRequest::new(
            ChatModel::openrouter("google/gemini-2.0-flash-001"),
            vec![Message::user("q")],
            Attribution::new("pipeline::generate").with_session("7"),
        )
    }

    #[test]
    fn failed_attempt_carries_code_and_request_id() {
        let ctx = ErrorContext::new().with_status(503).with_request_id("r-1");
        let err = ProviderError::from_status(503, "down", ctx);
        let record =
            ProviderCallRecord::for_attempt(&request(), 2, Duration::from_millis(40), Err(&err));

        assert_eq!(record.status, CallStatus::Error);
        assert_eq!(record.error_code, Some("upstream_error"));
        assert_eq!(record.request_id.as_deref(), Some("r-1"));
        assert_eq!(record.attempt, 2);
        assert_eq!(record.latency_ms, 40);
        assert_eq!(record.session_id.as_deref(), Some("7"));
        assert_eq!(record.caller, "pipeline::generate");
    }
}
