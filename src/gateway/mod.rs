//! Chat gateway: an OpenAI-compatible adapter behind a transport retry loop
//! that reports every attempt to a `UsageSink`.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use pricing::*;
pub use types::*;
pub use usage::{MemoryUsageSink, NoopUsageSink, StderrUsageSink, UsageSink};

#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Retries for flaky HTTP. Answer quality is handled by the pipeline's own
/// regeneration loop, not here.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl GatewayConfig {
    /// First failure goes straight back to the caller.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<P = OpenRouterAdapter> {
    provider: P,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

impl<P: ChatProvider> ProviderGateway<P> {
    pub fn new(provider: P, usage_sink: Arc<dyn UsageSink>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }
}

#[async_trait]
impl<P: ChatProvider> ChatGateway for ProviderGateway<P> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let outcome = self.provider.chat(&req).await;
            let record =
                ProviderCallRecord::for_attempt(&req, attempt, started.elapsed(), outcome.as_ref());
            self.usage_sink.record(record).await;

            let err = match outcome {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.config.max_retries {
                return Err(err);
            }

            let delay = backoff_delay(self.config.retry_base_delay, attempt);
            tracing::warn!(
                model = req.model.model_id(),
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "transport error; retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// `base * 2^attempt`, with the exponent capped at 5.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << attempt.min(5))
}
