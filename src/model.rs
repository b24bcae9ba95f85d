//! Model client: one `complete` call over a default and a higher-power backend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ModelClientConfig;
use crate::gateway::openrouter::OpenRouterAdapter;
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, GatewayConfig, ProviderError,
    ProviderGateway, UsageSink,
};
use crate::prompts::PromptInstance;

/// Which backend a call goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Default,
    HigherPower,
}

impl ModelTier {
    pub fn from_escalate(escalate: bool) -> Self {
        if escalate {
            ModelTier::HigherPower
        } else {
            ModelTier::Default
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Default => "default",
            ModelTier::HigherPower => "higher_power",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text returned by a backend, with the bookkeeping the trace wants.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub latency: Duration,
}

impl Completion {
    /// Completion with no usage figures, for clients that do not report them.
    pub fn text_only(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            latency: Duration::ZERO,
        }
    }
}

/// The backend could not produce a completion.
#[derive(Debug, thiserror::Error)]
#[error("model `{model}` ({tier}) unavailable: {source}")]
pub struct ModelUnavailableError {
    pub tier: ModelTier,
    pub model: String,
    #[source]
    pub source: ProviderError,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send `prompt` to the backend for `tier` and return its text.
    async fn complete(
        &self,
        prompt: &PromptInstance,
        tier: ModelTier,
        attribution: Attribution,
    ) -> Result<Completion, ModelUnavailableError>;

    /// Model name behind `tier`, for logs and traces.
    fn model_name(&self, tier: ModelTier) -> &str;
}

struct Backend {
    model: ChatModel,
    gateway: Arc<dyn ChatGateway>,
}

/// `ModelClient` over two chat gateways.
pub struct GatewayModelClient {
    default: Backend,
    higher_power: Backend,
}

impl GatewayModelClient {
    pub fn new(
        default_model: ChatModel,
        default_gateway: Arc<dyn ChatGateway>,
        fallback_model: ChatModel,
        fallback_gateway: Arc<dyn ChatGateway>,
    ) -> Self {
        Self {
            default: Backend {
                model: default_model,
                gateway: default_gateway,
            },
            higher_power: Backend {
                model: fallback_model,
                gateway: fallback_gateway,
            },
        }
    }

    /// Build both backends from configuration. The default backend gets no
    /// transport retries; the higher-power one gets `transport_retries`.
    pub fn from_config(
        config: &ModelClientConfig,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Result<Self, ProviderError> {
        let default_adapter =
            OpenRouterAdapter::with_config(&config.api_key, &config.base_url, config.timeout)?;
        let fallback_adapter = OpenRouterAdapter::with_config(
            config.fallback_api_key(),
            config.fallback_base_url(),
            config.timeout,
        )?;

        let default_gateway =
            ProviderGateway::new(default_adapter, usage_sink.clone(), GatewayConfig::no_retries());
        let fallback_gateway = ProviderGateway::new(
            fallback_adapter,
            usage_sink,
            GatewayConfig::with_retries(config.transport_retries),
        );

        Ok(Self::new(
            ChatModel::openrouter(&config.default_model_name),
            Arc::new(default_gateway),
            ChatModel::openrouter(&config.fallback_model_name),
            Arc::new(fallback_gateway),
        ))
    }

    fn backend(&self, tier: ModelTier) -> &Backend {
        match tier {
            ModelTier::Default => &self.default,
            ModelTier::HigherPower => &self.higher_power,
        }
    }
}

#[async_trait]
impl ModelClient for GatewayModelClient {
    async fn complete(
        &self,
        prompt: &PromptInstance,
        tier: ModelTier,
        attribution: Attribution,
    ) -> Result<Completion, ModelUnavailableError> {
        let backend = self.backend(tier);
        tracing::debug!(
            model = backend.model.model_id(),
            template = prompt.template_slug,
            system = %prompt.system,
            user = %prompt.user,
            "sending prompt"
        );
        let req = ChatRequest::new(backend.model.clone(), prompt.to_messages(), attribution);

        let resp = backend
            .gateway
            .chat(req)
            .await
            .map_err(|source| ModelUnavailableError {
                tier,
                model: backend.model.model_id().to_string(),
                source,
            })?;

        Ok(Completion {
            text: resp.content,
            model: backend.model.model_id().to_string(),
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            cost_nanodollars: resp.cost_nanodollars,
            latency: resp.latency,
        })
    }

    fn model_name(&self, tier: ModelTier) -> &str {
        self.backend(tier).model.model_id()
    }
}
