//! # geoguard-core
//!
//! Deterministic stages of the GeoGuard geo-compliance classifier.
//!
//! GeoGuard answers one question per feature artifact: does this feature
//! need geo-specific logic because a law requires it (`YES`), for business
//! reasons only (`NO`), or is it unclear (`REVIEW`)?
//!
//! This crate holds everything that runs without an oracle:
//! - Normalizer: markup cleanup, glossary expansion, geo tagging, clauses
//! - Router: cue lists plus a logistic business-geofence model
//! - Retriever: hybrid lexical/semantic search over clauses and regulations
//! - Decision protocol: stage output contracts, grounding, reconciliation
//! - Calibrator: vote tally, recalibration, low-confidence triage
//! - Auditor: append-only hash-chained log
//! - Evaluation: accuracy and YES-class metrics over labeled features
//!
//! ## Key Guarantees
//!
//! 1. **Grounded**: every emitted quote is a verbatim substring of its source
//! 2. **Deterministic**: routing, retrieval and calibration are pure functions
//! 3. **Auditable**: every scan appends exactly one chained record
//!
//! ## Example
//!
//! ```rust,ignore
//! use geoguard_core::{FeatureArtifact, ReferenceData};
//!
//! let reference = ReferenceData::embedded()?;
//! let feature = FeatureArtifact::new("F-1", "Curfew", "Utah minors get a login curfew.");
//! let normalized = reference.normalizer.normalize(&feature.id, &feature.full_text());
//! let verdict = reference.router.route(&normalized);
//! println!("short-circuit: {}", verdict.short_circuit);
//! ```

pub mod audit;
pub mod calibration;
pub mod config;
pub mod evaluation;
pub mod export;
pub mod feature;
pub mod normalizer;
pub mod protocol;
pub mod reference;
pub mod retrieval;
pub mod router;
pub mod schema;
pub mod types;

// Re-export main types at crate root
pub use audit::{
    record_correction, verify_chain, AuditDraft, AuditError, AuditOutcome, AuditRecord,
    AuditStore, ChainBreak, ChainReport, JsonlAuditLog, MemoryAuditLog, StageTrail,
};
pub use calibration::{finalize, CalibrationConfig, Calibrated, Recalibration, Vote, VoteTally};
pub use config::{ConfigError, GeoguardConfig, ReferencePaths};
pub use evaluation::{
    parse_labeled_jsonl, CaseResult, ClassMetrics, EvaluationError, EvaluationReport,
    LabeledFeature,
};
pub use feature::FeatureArtifact;
pub use normalizer::{Clause, NormalizedFeature, Normalizer};
pub use protocol::{
    accept, reconcile, ArbiterOutput, DetectorOutput, Framing, GroundingContext,
    PolicyMapperOutput, Provisional, ReconcileSignals, ReviewReason, ScanState, Stage,
    StageOutput,
};
pub use reference::{ReferenceData, ReferenceError, ReferenceHandle};
pub use retrieval::{ClauseIndex, RegulationIndex, RetrievalConfig, RetrievalResult};
pub use router::{Router, RouterVerdict};
pub use schema::{validate_decision, validate_stage_output, SchemaError};
pub use types::{
    ControlType, Decision, DecisionError, DecisionLabel, DecisionMetadata, Evidence,
    RegSnippet, Regulation, RetrievalIds, RuntimeInfo, PIPELINE_VERSION,
};
