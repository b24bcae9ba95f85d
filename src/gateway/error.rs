//! Errors raised by the chat gateway.

use std::time::Duration;
use thiserror::Error;

/// How long to wait after a 429 that carries no usable hint.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// What the provider told us about a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider error code, string or numeric, e.g. "rate_limit_exceeded".
    pub provider_code: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited by provider, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: ErrorContext,
    },

    /// Rejected locally before anything was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The provider reported a policy refusal in its error body.
    #[error("refused: {message}")]
    Refused {
        message: String,
        context: ErrorContext,
    },

    #[error("upstream error: {message}")]
    Upstream {
        message: String,
        retryable: bool,
        context: ErrorContext,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn upstream(message: impl Into<String>, retryable: bool) -> Self {
        Self::Upstream {
            message: message.into(),
            retryable,
            context: ErrorContext::default(),
        }
    }

    /// Classify a non-success HTTP status. 429 is a rate limit, 5xx is
    /// transient, anything else is permanent.
    pub fn from_status(status: u16, message: impl Into<String>, context: ErrorContext) -> Self {
        match status {
            429 => Self::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER,
                context,
            },
            _ => Self::Upstream {
                message: message.into(),
                retryable: status >= 500,
                context,
            },
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the transport layer may try the same request again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Upstream { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest(_) | Self::Refused { .. } | Self::Config(_) => false,
        }
    }

    /// Short error code for usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Upstream { .. } => "upstream_error",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::Refused { context, .. }
            | Self::Upstream { context, .. } => Some(context),
            Self::InvalidRequest(_) | Self::Http(_) | Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let ctx = ErrorContext::new().with_status(429);
        assert!(matches!(
            ProviderError::from_status(429, "slow down", ctx),
            ProviderError::RateLimited { retry_after, .. } if retry_after == DEFAULT_RETRY_AFTER
        ));
        assert!(ProviderError::from_status(503, "down", ErrorContext::new()).is_retryable());
        assert!(!ProviderError::from_status(401, "no auth", ErrorContext::new()).is_retryable());
        assert!(!ProviderError::InvalidRequest("too big".into()).is_retryable());
        assert!(!ProviderError::config("missing key").is_retryable());
    }

    #[test]
    fn request_id_comes_from_context() {
        let ctx = ErrorContext::new().with_status(502).with_request_id("req-9");
        let err = ProviderError::from_status(502, "HTTP 502", ctx);
        assert_eq!(err.request_id(), Some("req-9"));
        assert_eq!(err.code(), "upstream_error");
        assert_eq!(ProviderError::config("x").request_id(), None);
    }
}
