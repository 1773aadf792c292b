use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;

use geoguard_core::{validate_stage_output, Stage};

use super::{Oracle, OracleError, OracleReply, OracleRequest};
use crate::providers::{CompletionConfig, LlmProvider, ProviderError, TokenUsage};

lazy_static! {
    static ref FENCED: Regex = Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").unwrap();
    static ref OBJECT: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

/// Pull a JSON object out of model text.
///
/// Accepts bare JSON, a fenced code block, or prose around a single object.
pub fn extract_json(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    let body = FENCED
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    let parse = |s: &str| {
        serde_json::from_str::<serde_json::Value>(s)
            .ok()
            .filter(|v| v.is_object())
    };

    parse(body).or_else(|| OBJECT.find(body).and_then(|m| parse(m.as_str())))
}

/// Extract and schema-check a stage reply from raw oracle text.
pub(crate) fn conform(stage: Stage, raw: String, usage: TokenUsage) -> Result<OracleReply, OracleError> {
    let Some(value) = extract_json(&raw) else {
        return Err(OracleError::Validation {
            raw,
            errors: vec!["response does not contain a JSON object".to_string()],
        });
    };

    if let Err(errors) = validate_stage_output(stage, &value) {
        return Err(OracleError::Validation { raw, errors });
    }

    Ok(OracleReply { value, raw, usage })
}

fn classify(error: ProviderError) -> OracleError {
    match error {
        ProviderError::Timeout(d) => OracleError::Timeout(d),
        e if e.is_transient() => OracleError::Transport(e.to_string()),
        e @ ProviderError::ParseError(_) => OracleError::Transport(e.to_string()),
        e => OracleError::Unavailable(e.to_string()),
    }
}

/// Oracle backed by an LLM provider.
pub struct LlmOracle {
    provider: Arc<dyn LlmProvider>,
    completion: CompletionConfig,
}

impl LlmOracle {
    /// `completion` supplies model, token limit and sampling cutoffs;
    /// temperature and schema are set per request.
    pub fn new(provider: Arc<dyn LlmProvider>, completion: CompletionConfig) -> Self {
        Self {
            provider,
            completion,
        }
    }
}

#[async_trait]
impl Oracle for LlmOracle {
    async fn request(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        let config = CompletionConfig {
            temperature: request.temperature,
            response_schema: Some(request.schema.clone()),
            ..self.completion.clone()
        };

        let response = self
            .provider
            .complete(request.messages, &config)
            .await
            .map_err(classify)?;
        tracing::debug!(
            stage = %request.stage,
            model = %response.model,
            finish_reason = response.finish_reason.as_deref().unwrap_or("unknown"),
            tokens = response.usage.total(),
            "Oracle reply"
        );

        conform(request.stage, response.content, response.usage)
    }

    fn name(&self) -> &str {
        self.provider.name()
    }
}
