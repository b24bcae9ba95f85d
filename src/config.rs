//! Model client configuration.
//!
//! Built once at startup and handed to the model client explicitly; nothing
//! below the binary reads the environment.

use std::time::Duration;

use crate::gateway::openrouter::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::gateway::ProviderError;

pub const DEFAULT_MODEL: &str = "meta-llama/llama-3-70b-instruct";
pub const DEFAULT_FALLBACK_MODEL: &str = "google/gemini-2.0-flash-001";
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 2;

/// Settings for the two completion backends.
#[derive(Debug, Clone)]
pub struct ModelClientConfig {
    pub api_key: String,
    pub base_url: String,
    /// Low-latency model used by every stage unless escalated.
    pub default_model_name: String,
    /// Higher-power model used by generation once the session escalates.
    pub fallback_model_name: String,
    /// HTTP-level retries for the higher-power backend only.
    pub transport_retries: u32,
    pub timeout: Duration,
    /// Separate credentials when the fallback lives on another provider.
    pub fallback_api_key: Option<String>,
    pub fallback_base_url: Option<String>,
}

impl ModelClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model_name: DEFAULT_MODEL.to_string(),
            fallback_model_name: DEFAULT_FALLBACK_MODEL.to_string(),
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            fallback_api_key: None,
            fallback_base_url: None,
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("OPENROUTER_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::config("OPENROUTER_API_KEY not set"))?;

        let mut config = Self::new(api_key);

        if let Some(url) = lookup("OPENROUTER_BASE_URL") {
            config.base_url = url;
        }
        if let Some(model) = lookup("NL2SQL_DEFAULT_MODEL") {
            config.default_model_name = model;
        }
        if let Some(model) = lookup("NL2SQL_FALLBACK_MODEL") {
            config.fallback_model_name = model;
        }
        if let Some(raw) = lookup("NL2SQL_TRANSPORT_RETRIES") {
            config.transport_retries = raw.trim().parse().map_err(|_| {
                ProviderError::config(format!("NL2SQL_TRANSPORT_RETRIES is not a number: {raw}"))
            })?;
        }
        if let Some(secs) = lookup("NL2SQL_TIMEOUT_SECONDS").and_then(|s| s.trim().parse().ok()) {
            config.timeout = Duration::from_secs(secs);
        }
        config.fallback_api_key = lookup("NL2SQL_FALLBACK_API_KEY");
        config.fallback_base_url = lookup("NL2SQL_FALLBACK_BASE_URL");

        Ok(config)
    }

    pub fn fallback_api_key(&self) -> &str {
        self.fallback_api_key.as_deref().unwrap_or(&self.api_key)
    }

    pub fn fallback_base_url(&self) -> &str {
        self.fallback_base_url.as_deref().unwrap_or(&self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let err = ModelClientConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let config =
            ModelClientConfig::from_lookup(lookup_from(&[("OPENROUTER_API_KEY", "sk-1")])).unwrap();
        assert_eq!(config.default_model_name, DEFAULT_MODEL);
        assert_eq!(config.fallback_model_name, DEFAULT_FALLBACK_MODEL);
        assert_eq!(config.transport_retries, 2);
        assert_eq!(config.fallback_api_key(), "sk-1");
        assert_eq!(config.fallback_base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn overrides_are_read() {
        let config = ModelClientConfig::from_lookup(lookup_from(&[
            ("OPENROUTER_API_KEY", "sk-1"),
            ("NL2SQL_DEFAULT_MODEL", "groq/llama"),
            ("NL2SQL_FALLBACK_MODEL", "google/gemini-2.5-pro"),
            ("NL2SQL_TRANSPORT_RETRIES", "5"),
            ("NL2SQL_FALLBACK_API_KEY", "sk-2"),
        ]))
        .unwrap();
        assert_eq!(config.default_model_name, "groq/llama");
        assert_eq!(config.fallback_model_name, "google/gemini-2.5-pro");
        assert_eq!(config.transport_retries, 5);
        assert_eq!(config.fallback_api_key(), "sk-2");
    }

    #[test]
    fn bad_retry_count_is_rejected() {
        let err = ModelClientConfig::from_lookup(lookup_from(&[
            ("OPENROUTER_API_KEY", "sk-1"),
            ("NL2SQL_TRANSPORT_RETRIES", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("NL2SQL_TRANSPORT_RETRIES"));
    }
}
