//! # geoguard-runtime
//!
//! Oracle-backed decision head for GeoGuard.
//!
//! `geoguard-core` holds every deterministic stage. This crate adds the
//! parts that talk to a reasoning oracle:
//! - Stage runner: Detector, Policy Mapper and Arbiter exchanges with a
//!   bounded schema-retry state machine
//! - Calibrator sampling: concurrent Arbiter samples fed to the vote
//! - Pipeline: control flow, degradation on oracle outages, batches
//!
//! ## Important
//!
//! The oracle is untrusted. Every reply is schema-checked and every quote is
//! grounded against the feature text or a retrieved regulation section
//! before it can reach a decision. A transport outage degrades the scan to
//! `REVIEW`; repeated invalid output fails it. Neither fabricates a decision.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use geoguard_core::{FeatureArtifact, MemoryAuditLog, ReferenceData, ReferenceHandle};
//! use geoguard_runtime::{Pipeline, RuntimeConfig, ScriptedOracle};
//!
//! let oracle = Arc::new(ScriptedOracle::from_yaml_file("script.yaml")?);
//! let reference = Arc::new(ReferenceHandle::new(ReferenceData::embedded()?));
//! let pipeline = Pipeline::new(oracle, reference, Arc::new(MemoryAuditLog::new()), RuntimeConfig::default());
//!
//! let feature = FeatureArtifact::new("F-1", "Curfew", "Utah minors get a login curfew.");
//! let decision = pipeline.classify(&feature).await?;
//! println!("{} ({:.2})", decision.decision, decision.confidence);
//! ```

pub mod calibrator;
pub mod config;
pub mod oracle;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod stages;

pub use calibrator::{sample_and_calibrate, ArbiterInputs, SampleOutcome};
pub use config::{BatchConfig, OracleConfig, RuntimeConfig};
pub use oracle::{
    LlmOracle, Oracle, OracleError, OracleReply, OracleRequest, ScriptError, ScriptStep,
    ScriptedFailure, ScriptedOracle,
};
pub use pipeline::{Pipeline, PipelineError};
pub use prompts::PROMPT_VERSION;
pub use providers::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError, TokenUsage,
    UnconfiguredProvider,
};
pub use stages::{StageError, StageRun, StageRunner};

#[cfg(feature = "gemini")]
pub use providers::GeminiProvider;
