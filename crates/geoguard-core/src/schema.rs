//! JSON Schema validation for stage outputs and decisions.
//!
//! Schemas live in `schemas/` and are embedded at compile time. Each is
//! compiled once on first use and reused for every validation.

use std::sync::OnceLock;
use thiserror::Error;

use crate::protocol::Stage;

const DETECTOR_SCHEMA_JSON: &str = include_str!("../../../schemas/detector.schema.json");
const POLICY_MAPPER_SCHEMA_JSON: &str = include_str!("../../../schemas/policy_mapper.schema.json");
const ARBITER_SCHEMA_JSON: &str = include_str!("../../../schemas/arbiter.schema.json");
const DECISION_SCHEMA_JSON: &str = include_str!("../../../schemas/decision.schema.json");

/// Errors from schema loading.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),
}

struct SchemaSlot {
    source: &'static str,
    compiled: OnceLock<Result<jsonschema::Validator, String>>,
}

impl SchemaSlot {
    const fn new(source: &'static str) -> Self {
        Self {
            source,
            compiled: OnceLock::new(),
        }
    }

    fn validator(&self) -> Result<&jsonschema::Validator, SchemaError> {
        let result = self.compiled.get_or_init(|| {
            let schema_value: serde_json::Value = match serde_json::from_str(self.source) {
                Ok(v) => v,
                Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
            };

            match jsonschema::options().build(&schema_value) {
                Ok(v) => Ok(v),
                Err(e) => Err(format!("Failed to compile schema: {}", e)),
            }
        });

        match result {
            Ok(v) => Ok(v),
            Err(e) => Err(SchemaError::LoadError(e.clone())),
        }
    }

    fn validate(&self, value: &serde_json::Value) -> Result<(), Vec<String>> {
        let validator = self.validator().map_err(|e| vec![e.to_string()])?;

        let errors: Vec<String> = validator
            .iter_errors(value)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

static DETECTOR: SchemaSlot = SchemaSlot::new(DETECTOR_SCHEMA_JSON);
static POLICY_MAPPER: SchemaSlot = SchemaSlot::new(POLICY_MAPPER_SCHEMA_JSON);
static ARBITER: SchemaSlot = SchemaSlot::new(ARBITER_SCHEMA_JSON);
static DECISION: SchemaSlot = SchemaSlot::new(DECISION_SCHEMA_JSON);

fn slot(stage: Stage) -> &'static SchemaSlot {
    match stage {
        Stage::Detector => &DETECTOR,
        Stage::PolicyMapper => &POLICY_MAPPER,
        Stage::Arbiter => &ARBITER,
    }
}

/// Validate one stage's structured output.
///
/// Returns the list of violation messages on failure; these are fed back
/// to the oracle in the retry follow-up.
pub fn validate_stage_output(stage: Stage, value: &serde_json::Value) -> Result<(), Vec<String>> {
    slot(stage).validate(value)
}

/// Validate a final decision against the published decision schema.
pub fn validate_decision(value: &serde_json::Value) -> Result<(), Vec<String>> {
    DECISION.validate(value)
}

/// The JSON schema sent to the oracle as the response contract for `stage`.
pub fn stage_schema(stage: Stage) -> Result<serde_json::Value, SchemaError> {
    serde_json::from_str(slot(stage).source)
        .map_err(|e| SchemaError::LoadError(format!("Invalid schema JSON: {}", e)))
}
