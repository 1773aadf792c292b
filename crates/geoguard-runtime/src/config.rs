//! Runtime configuration: oracle timeouts, retries and batch limits.
//!
//! The deterministic pipeline settings live in [`GeoguardConfig`] and are
//! flattened into the same YAML document:
//!
//! ```yaml
//! router:
//!   threshold: 0.8
//! calibration:
//!   samples: 3
//! oracle:
//!   timeout: 20s
//!   max_retries: 3
//! batch:
//!   concurrency: 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use geoguard_core::{ConfigError, GeoguardConfig};

use crate::providers::CompletionConfig;

/// Serde adapter for human-readable durations such as `"200ms"` or `"20s"`.
mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub model: String,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,

    /// Temperature for the Detector and Policy Mapper; the Arbiter uses
    /// the calibration temperature
    pub stage_temperature: f32,

    /// Per-call timeout
    #[serde(with = "duration")]
    pub timeout: Duration,

    /// Backoff retries for transport failures and timeouts
    pub max_retries: usize,

    #[serde(with = "duration")]
    pub min_backoff: Duration,

    #[serde(with = "duration")]
    pub max_backoff: Duration,

    /// Re-requests after a schema or grounding violation
    pub max_schema_retries: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        let completion = CompletionConfig::default();
        Self {
            model: completion.model,
            max_tokens: completion.max_tokens,
            top_p: completion.top_p,
            top_k: completion.top_k,
            stage_temperature: 0.0,
            timeout: Duration::from_secs(20),
            max_retries: 3,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            max_schema_retries: 2,
        }
    }
}

impl OracleConfig {
    /// Provider settings for an [`crate::oracle::LlmOracle`].
    pub fn to_completion_config(&self) -> CompletionConfig {
        CompletionConfig {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.stage_temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            timeout: self.timeout,
            response_schema: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Features classified concurrently
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(flatten)]
    pub pipeline: GeoguardConfig,
    pub oracle: OracleConfig,
    pub batch: BatchConfig,
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;

        let oracle = &self.oracle;
        if oracle.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "oracle.timeout must be positive".to_string(),
            ));
        }
        if oracle.min_backoff > oracle.max_backoff {
            return Err(ConfigError::Invalid(format!(
                "oracle.min_backoff {:?} exceeds oracle.max_backoff {:?}",
                oracle.min_backoff, oracle.max_backoff
            )));
        }
        if !(0.0..=2.0).contains(&oracle.stage_temperature) {
            return Err(ConfigError::Invalid(format!(
                "oracle.stage_temperature {} is outside [0, 2]",
                oracle.stage_temperature
            )));
        }
        if oracle.max_tokens == 0 {
            return Err(ConfigError::Invalid(
                "oracle.max_tokens must be at least 1".to_string(),
            ));
        }
        if self.batch.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "batch.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
