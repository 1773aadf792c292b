//! Pipeline configuration for the deterministic stages.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::calibration::CalibrationConfig;
use crate::retrieval::RetrievalConfig;
use crate::router::DEFAULT_THRESHOLD;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Business probability above which a feature short-circuits to NO
    pub threshold: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Optional overrides for the embedded reference data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferencePaths {
    pub glossary: Option<PathBuf>,
    pub geo: Option<PathBuf>,
    pub cues: Option<PathBuf>,
    pub router_model: Option<PathBuf>,
    pub corpus: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSONL audit log location
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("audit/audit.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoguardConfig {
    pub router: RouterConfig,
    pub retrieval: RetrievalConfig,
    pub calibration: CalibrationConfig,
    pub reference: ReferencePaths,
    pub audit: AuditConfig,
}

impl GeoguardConfig {
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
        if !(0.0..=1.0).contains(&self.router.threshold) {
            return Err(ConfigError::Invalid(format!(
                "router.threshold {} is outside [0, 1]",
                self.router.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.retrieval.lexical_weight) {
            return Err(ConfigError::Invalid(format!(
                "retrieval.lexical_weight {} is outside [0, 1]",
                self.retrieval.lexical_weight
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_score) {
            return Err(ConfigError::Invalid(format!(
                "retrieval.min_score {} is outside [0, 1]",
                self.retrieval.min_score
            )));
        }
        self.calibration.validate()
    }
}
