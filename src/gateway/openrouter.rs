//! OpenAI-compatible `/chat/completions` adapter, OpenRouter by default.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::chat_cost;
use super::types::{ChatRequest, ChatResponse, FinishReason, Message};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Stage prompts are small; anything near this is a schema pasted by mistake.
const MAX_INPUT_CHARS: usize = 500_000;
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// SQL generation and grading want the most likely answer, not variety.
const TEMPERATURE: f32 = 0.0;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    chat_url: String,
}

impl OpenRouterAdapter {
    pub fn with_config(
        api_key: impl AsRef<str>,
        base_url: impl AsRef<str>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key.as_ref()))
            .map_err(|_| ProviderError::config("API key contains invalid header characters"))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert("X-Title", HeaderValue::from_static("nl2sql-harness"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            chat_url: format!("{}/chat/completions", base_url.as_ref().trim_end_matches('/')),
        })
    }

    /// Refusals arrive in the error body of an otherwise-200 response.
    /// Ordinary completion text is never inspected: a grade like "I cannot
    /// tell" is an answer, not a failure.
    fn is_refusal(message: &str) -> bool {
        let lower = message.trim_start().to_lowercase();
        let first_line = lower.lines().next().unwrap_or("");
        ["refus", "i cannot", "i can't", "i won't", "unable to comply"]
            .iter()
            .any(|p| first_line.starts_with(p))
            || lower.contains("content policy")
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    usage: Option<ReplyUsage>,
    error: Option<ReplyError>,
}

#[derive(Deserialize)]
struct ReplyChoice {
    message: Option<ReplyMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ReplyUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    cost_details: Option<ReplyCost>,
}

#[derive(Deserialize)]
struct ReplyCost {
    upstream_inference_cost: Option<f64>,
}

#[derive(Deserialize)]
struct ReplyError {
    #[serde(default)]
    message: String,
    /// OpenRouter sends numbers, other compatible servers send strings.
    code: Option<serde_json::Value>,
}

impl ReplyError {
    fn code(&self) -> Option<String> {
        match self.code.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn into_error(self, context: ErrorContext) -> ProviderError {
        let context = match self.code() {
            Some(code) => context.with_code(code),
            None => context,
        };
        if OpenRouterAdapter::is_refusal(&self.message) {
            ProviderError::Refused {
                message: self.message,
                context,
            }
        } else {
            ProviderError::Upstream {
                message: self.message,
                retryable: false,
                context,
            }
        }
    }
}

fn usd_to_nanodollars(usd: f64) -> i64 {
    ((usd * 1e9).round() as i64).max(0)
}

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let input_chars = req.input_chars();
        if input_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::InvalidRequest(format!(
                "prompt is {input_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let started = Instant::now();
        let body = CompletionBody {
            model: req.model.model_id(),
            messages: &req.messages,
            temperature: TEMPERATURE,
        };
        let mut response = self.client.post(&self.chat_url).json(&body).send().await?;

        let status = response.status().as_u16();
        let mut context = ErrorContext::new().with_status(status);
        if let Some(id) = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
        {
            context = context.with_request_id(id);
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(ProviderError::Upstream {
                    message: format!("response exceeds {MAX_RESPONSE_BYTES} bytes"),
                    retryable: false,
                    context,
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        let reply = serde_json::from_slice::<CompletionReply>(&bytes);

        if !(200..300).contains(&status) {
            return Err(match reply.ok().and_then(|r| r.error) {
                Some(err) => {
                    let context = match err.code() {
                        Some(code) => context.with_code(code),
                        None => context,
                    };
                    ProviderError::from_status(status, err.message, context)
                }
                None => ProviderError::from_status(status, format!("HTTP {status}"), context),
            });
        }

        let reply = reply.map_err(|e| ProviderError::Upstream {
            message: format!("malformed completion body: {e}"),
            retryable: false,
            context: context.clone(),
        })?;
        if let Some(err) = reply.error {
            return Err(err.into_error(context));
        }

        let choice = reply.choices.into_iter().next().ok_or_else(|| {
            ProviderError::Upstream {
                message: "completion has no choices".to_string(),
                retryable: false,
                context: context.clone(),
            }
        })?;
        let content = choice.message.and_then(|m| m.content).unwrap_or_default();

        // Missing usage is reported as zero tokens rather than an error.
        let (input_tokens, output_tokens, upstream_cost_nanodollars) = match reply.usage {
            Some(u) => (
                u.prompt_tokens,
                u.completion_tokens,
                u.cost_details
                    .and_then(|c| c.upstream_inference_cost)
                    .map(usd_to_nanodollars),
            ),
            None => (0, 0, None),
        };

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            cost_nanodollars: chat_cost(req.model.model_id(), input_tokens, output_tokens),
            upstream_cost_nanodollars,
            latency: started.elapsed(),
            finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
        })
    }
}
