//! The reasoning oracle behind the decision head.
//!
//! An oracle takes a stage's messages and target schema and returns either
//! a JSON value or an error. It is non-deterministic; everything it returns
//! is validated and grounded by the stage runner before use.

mod llm;
mod scripted;

pub use llm::{extract_json, LlmOracle};
pub use scripted::{ScriptError, ScriptStep, ScriptedFailure, ScriptedOracle};

use async_trait::async_trait;
use geoguard_core::Stage;
use std::time::Duration;
use thiserror::Error;

use crate::providers::{ChatMessage, TokenUsage};

/// Errors from an oracle call.
#[derive(Error, Debug, Clone)]
pub enum OracleError {
    /// The oracle answered, but not with schema-conformant JSON
    #[error("Output failed validation: {}", errors.join("; "))]
    Validation { raw: String, errors: Vec<String> },

    /// Network or server failure; a retry may succeed
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Oracle call timed out after {0:?}")]
    Timeout(Duration),

    /// Not configured, unauthorized or otherwise unusable
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
}

impl OracleError {
    /// Whether backoff-and-retry applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// One structured exchange with the oracle.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub stage: Stage,
    pub messages: Vec<ChatMessage>,
    /// JSON schema the reply must satisfy
    pub schema: serde_json::Value,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct OracleReply {
    pub value: serde_json::Value,
    /// Raw text as the oracle produced it
    pub raw: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn request(&self, request: OracleRequest) -> Result<OracleReply, OracleError>;

    /// Name for logs.
    fn name(&self) -> &str;
}
