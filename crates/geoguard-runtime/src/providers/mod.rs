//! LLM provider abstractions for geoguard-runtime.
//!
//! A provider turns chat messages into a completion. The oracle layer sits
//! on top and is responsible for extracting and validating JSON.
//!
//! ## Security
//!
//! Providers hold API keys as [`ApiCredential`], which never prints its
//! value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod secrets;

#[cfg(feature = "gemini")]
mod gemini;

pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "gemini")]
pub use gemini::{response_schema, GeminiProvider, GEMINI_API_KEY_ENV};

/// Failures surfaced by a provider backend.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError(_) | Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::ApiError { status, .. } => *status >= 500,
            Self::ParseError(_) | Self::AuthError | Self::NotConfigured(_) => false,
        }
    }
}

/// Per-request model and sampling settings.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub model: String,

    /// Output token ceiling
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Nucleus sampling cutoff
    pub top_p: Option<f32>,

    /// Top-k sampling cutoff
    pub top_k: Option<u32>,

    /// Request timeout
    pub timeout: Duration,

    /// JSON schema the response must follow, for providers that support
    /// constrained decoding
    pub response_schema: Option<serde_json::Value>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            max_tokens: 2048,
            temperature: 0.0,
            top_p: Some(0.8),
            top_k: Some(40),
            timeout: Duration::from_secs(20),
            response_schema: None,
        }
    }
}

/// One turn of a chat exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Text and accounting returned for one completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    /// Model version that actually answered
    pub model: String,
    /// Backend finish reason, e.g. `STOP` or `MAX_TOKENS`
    pub finish_reason: Option<String>,
}

/// Prompt and completion token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A chat-completion backend.
///
/// Only [`crate::oracle::LlmOracle`] calls this; deterministic stages never do.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Name used in logs and audit metadata.
    fn name(&self) -> &str;
}

/// Stand-in provider used when no backend is compiled in or configured.
///
/// Every call fails with [`ProviderError::NotConfigured`], so scans that
/// reach the oracle degrade to `REVIEW`.
#[derive(Debug, Clone)]
pub struct UnconfiguredProvider {
    reason: String,
}

impl UnconfiguredProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for UnconfiguredProvider {
    async fn complete(
        &self,
        _messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        Err(ProviderError::NotConfigured(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}
