//! Configuration for the chat pipeline
//!
//! [`ChatOptions`] is built once and injected into the client and pipeline;
//! nothing here is process-global. Endpoint, model and credential can also be
//! resolved from the environment.

use crate::retry::RetryConfig;
use crate::usage::Pricing;
use crate::{Error, Result};
use std::env;
use std::time::Duration;

pub const ENDPOINT_ENV: &str = "CHAT_PIPELINE_ENDPOINT";
pub const MODEL_ENV: &str = "CHAT_PIPELINE_MODEL";
pub const API_KEY_ENV: &str = "CHAT_PIPELINE_API_KEY";

/// Completion length requested from the model.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Token budget for the outbound message list.
pub const DEFAULT_CONTEXT_BUDGET: usize = 12_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Well-known OpenAI-compatible endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    OpenRouter,
    LMStudio,
    Ollama,
}

impl Provider {
    /// Get the default base URL for this provider
    pub fn default_url(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::LMStudio => "http://localhost:1234/v1",
            Provider::Ollama => "http://localhost:11434/v1",
        }
    }

    /// Parse a provider from a string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAI),
            "openrouter" | "open-router" => Some(Provider::OpenRouter),
            "lmstudio" | "lm-studio" | "lm_studio" => Some(Provider::LMStudio),
            "ollama" => Some(Provider::Ollama),
            _ => None,
        }
    }
}

/// Get the endpoint from environment variable or provider default
///
/// Priority:
/// 1. `CHAT_PIPELINE_ENDPOINT` environment variable
/// 2. Provider default URL (if provider is Some)
/// 3. fallback parameter, then the OpenAI default
pub fn get_endpoint(provider: Option<Provider>, fallback: Option<&str>) -> String {
    resolve_endpoint(env::var(ENDPOINT_ENV).ok(), provider, fallback)
}

fn resolve_endpoint(
    from_env: Option<String>,
    provider: Option<Provider>,
    fallback: Option<&str>,
) -> String {
    if let Some(url) = from_env.filter(|u| !u.is_empty()) {
        return url;
    }
    if let Some(p) = provider {
        return p.default_url().to_string();
    }
    fallback
        .unwrap_or(Provider::OpenAI.default_url())
        .to_string()
}

/// Get the model name from environment variable or fallback
pub fn get_model(fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    resolve_model(env::var(MODEL_ENV).ok(), fallback, prefer_env)
}

fn resolve_model(
    from_env: Option<String>,
    fallback: Option<&str>,
    prefer_env: bool,
) -> Option<String> {
    if prefer_env {
        if let Some(model) = from_env.filter(|m| !m.is_empty()) {
            return Some(model);
        }
    }
    fallback.map(|s| s.to_string())
}

/// Credential from `CHAT_PIPELINE_API_KEY`. Absent is valid: a relay may
/// inject the credential server-side.
pub fn get_api_key() -> Option<String> {
    env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}

/// Options shared by [`ChatClient`](crate::ChatClient) and
/// [`ChatPipeline`](crate::ChatPipeline).
#[derive(Clone)]
pub struct ChatOptions {
    /// Model name (e.g., "gpt-4o-mini")
    pub model: String,

    /// Chat-completions URL or OpenAI-compatible base URL
    pub endpoint: String,

    /// Bearer credential; `None` sends no Authorization header
    pub api_key: Option<String>,

    /// Completion tokens requested per call
    pub max_tokens: u32,

    /// Sampling temperature (0.0 to 2.0)
    pub temperature: f32,

    /// Bound on each individual attempt
    pub timeout: Duration,

    /// Token budget applied by the message builder
    pub context_budget: usize,

    pub retry: RetryConfig,

    pub pricing: Pricing,
}

impl std::fmt::Debug for ChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOptions")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .field("context_budget", &self.context_budget)
            .field("retry", &self.retry)
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl ChatOptions {
    /// Create a new builder for ChatOptions
    pub fn builder() -> ChatOptionsBuilder {
        ChatOptionsBuilder::default()
    }

    /// Options resolved entirely from the environment.
    pub fn from_env() -> Result<Self> {
        let model = get_model(None, true)
            .ok_or_else(|| Error::config(format!("{} is not set", MODEL_ENV)))?;
        let mut builder = Self::builder()
            .model(model)
            .endpoint(get_endpoint(None, None));
        if let Some(key) = get_api_key() {
            builder = builder.api_key(key);
        }
        builder.build()
    }
}

/// Builder for ChatOptions
#[derive(Debug, Default)]
pub struct ChatOptionsBuilder {
    model: Option<String>,
    endpoint: Option<String>,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout: Option<Duration>,
    context_budget: Option<usize>,
    retry: Option<RetryConfig>,
    pricing: Option<Pricing>,
}

impl ChatOptionsBuilder {
    /// Set the model name (required)
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the endpoint base URL or full `/chat/completions` URL (required)
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Set the API key; omit for endpoints that need none
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set max tokens for completion
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Set sampling temperature
    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    /// Set the per-attempt request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the token budget for outbound messages
    pub fn context_budget(mut self, tokens: usize) -> Self {
        self.context_budget = Some(tokens);
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set per-1k token pricing for the usage ledger
    pub fn pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Build the options, validating required fields
    pub fn build(self) -> Result<ChatOptions> {
        let model = self
            .model
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::config("model is required"))?;

        let endpoint = self
            .endpoint
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::config("endpoint is required"))?;

        let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::config(format!(
                "temperature must be within 0.0..=2.0, got {}",
                temperature
            )));
        }

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            return Err(Error::config("timeout must be non-zero"));
        }

        Ok(ChatOptions {
            model,
            endpoint,
            api_key: self.api_key.filter(|k| !k.is_empty()),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature,
            timeout,
            context_budget: self.context_budget.unwrap_or(DEFAULT_CONTEXT_BUDGET),
            retry: self.retry.unwrap_or_default(),
            pricing: self.pricing.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_default_urls() {
        assert_eq!(Provider::OpenAI.default_url(), "https://api.openai.com/v1");
        assert_eq!(Provider::LMStudio.default_url(), "http://localhost:1234/v1");
        assert_eq!(Provider::Ollama.default_url(), "http://localhost:11434/v1");
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(Provider::parse("OpenAI"), Some(Provider::OpenAI));
        assert_eq!(Provider::parse("open-router"), Some(Provider::OpenRouter));
        assert_eq!(Provider::parse("LM-Studio"), Some(Provider::LMStudio));
        assert_eq!(Provider::parse("unknown"), None);
    }

    #[test]
    fn test_resolve_endpoint_priority() {
        assert_eq!(
            resolve_endpoint(Some("http://relay/api".into()), Some(Provider::Ollama), None),
            "http://relay/api"
        );
        assert_eq!(
            resolve_endpoint(None, Some(Provider::Ollama), Some("http://x")),
            "http://localhost:11434/v1"
        );
        assert_eq!(
            resolve_endpoint(Some(String::new()), None, Some("http://custom:8080/v1")),
            "http://custom:8080/v1"
        );
        assert_eq!(resolve_endpoint(None, None, None), "https://api.openai.com/v1");
    }

    #[test]
    fn test_resolve_model() {
        assert_eq!(
            resolve_model(Some("env-model".into()), Some("fallback"), true).as_deref(),
            Some("env-model")
        );
        assert_eq!(
            resolve_model(Some("env-model".into()), Some("fallback"), false).as_deref(),
            Some("fallback")
        );
        assert_eq!(resolve_model(None, None, true), None);
    }

    #[test]
    fn test_builder_defaults() {
        let options = ChatOptions::builder()
            .model("gpt-4o-mini")
            .endpoint("http://localhost:1234/v1")
            .build()
            .unwrap();

        assert_eq!(options.api_key, None);
        assert_eq!(options.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(options.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(options.timeout, DEFAULT_TIMEOUT);
        assert_eq!(options.context_budget, DEFAULT_CONTEXT_BUDGET);
        assert_eq!(options.retry.max_retries, 3);
    }

    #[test]
    fn test_builder_missing_required() {
        assert!(ChatOptions::builder().endpoint("http://x").build().is_err());
        assert!(ChatOptions::builder().model("m").build().is_err());
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        let base = || ChatOptions::builder().model("m").endpoint("http://x");
        assert!(base().temperature(3.5).build().is_err());
        assert!(base().timeout(Duration::ZERO).build().is_err());
    }

    #[test]
    fn test_empty_api_key_is_absent() {
        let options = ChatOptions::builder()
            .model("m")
            .endpoint("http://x")
            .api_key("")
            .build()
            .unwrap();
        assert!(options.api_key.is_none());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let options = ChatOptions::builder()
            .model("m")
            .endpoint("http://x")
            .api_key("sk-secret")
            .build()
            .unwrap();
        let debug = format!("{:?}", options);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("***"));
    }
}
