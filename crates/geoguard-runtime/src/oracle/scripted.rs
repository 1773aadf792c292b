//! Oracle that replays a fixed script per stage.
//!
//! Used by tests and by `geoguard --script` for offline runs. Replies pass
//! through the same JSON extraction and schema check as a live oracle.

use async_trait::async_trait;
use geoguard_core::Stage;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::llm::conform;
use super::{Oracle, OracleError, OracleReply, OracleRequest};
use crate::providers::TokenUsage;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Failed to read script: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse script: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Step {index} for {stage} needs exactly one of reply, raw or error")]
    InvalidStep { stage: Stage, index: usize },
}

/// A failure the script injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedFailure {
    Transport,
    Timeout,
    Unavailable,
}

/// One scripted oracle answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Structured reply
    Reply(serde_json::Value),
    /// Raw text, as a model might produce it
    Raw(String),
    Error(ScriptedFailure),
}

/// File form of a step: exactly one of `reply`, `raw` or `error`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StepSpec {
    reply: Option<serde_json::Value>,
    raw: Option<String>,
    error: Option<ScriptedFailure>,
}

impl StepSpec {
    fn into_step(self, stage: Stage, index: usize) -> Result<ScriptStep, ScriptError> {
        match (self.reply, self.raw, self.error) {
            (Some(v), None, None) => Ok(ScriptStep::Reply(v)),
            (None, Some(r), None) => Ok(ScriptStep::Raw(r)),
            (None, None, Some(e)) => Ok(ScriptStep::Error(e)),
            _ => Err(ScriptError::InvalidStep { stage, index }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScriptFile {
    detector: Vec<StepSpec>,
    policy_mapper: Vec<StepSpec>,
    arbiter: Vec<StepSpec>,
}

/// Replays queued steps per stage, in order.
///
/// When a stage's queue runs dry the last step repeats if `repeat_last`
/// is set; otherwise the call fails as unavailable.
#[derive(Default)]
pub struct ScriptedOracle {
    queues: Mutex<HashMap<Stage, VecDeque<ScriptStep>>>,
    last: Mutex<HashMap<Stage, ScriptStep>>,
    repeat_last: bool,
    requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ScriptError> {
        let file: ScriptFile = serde_yaml::from_str(yaml)?;
        let oracle = Self::new().repeating();
        for (stage, steps) in [
            (Stage::Detector, file.detector),
            (Stage::PolicyMapper, file.policy_mapper),
            (Stage::Arbiter, file.arbiter),
        ] {
            for (index, spec) in steps.into_iter().enumerate() {
                oracle.push(stage, spec.into_step(stage, index)?);
            }
        }
        Ok(oracle)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Repeat each stage's last step once its queue is empty.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn push(&self, stage: Stage, step: ScriptStep) -> &Self {
        self.queues.lock().entry(stage).or_default().push_back(step);
        self
    }

    pub fn reply(&self, stage: Stage, value: serde_json::Value) -> &Self {
        self.push(stage, ScriptStep::Reply(value))
    }

    pub fn fail(&self, stage: Stage, failure: ScriptedFailure) -> &Self {
        self.push(stage, ScriptStep::Error(failure))
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self, stage: Stage) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.stage == stage)
            .count()
    }

    fn next_step(&self, stage: Stage) -> Option<ScriptStep> {
        let popped = self
            .queues
            .lock()
            .get_mut(&stage)
            .and_then(|q| q.pop_front());
        match popped {
            Some(step) => {
                self.last.lock().insert(stage, step.clone());
                Some(step)
            }
            None if self.repeat_last => self.last.lock().get(&stage).cloned(),
            None => None,
        }
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn request(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        let stage = request.stage;
        self.requests.lock().push(request);

        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
        };
        match self.next_step(stage) {
            Some(ScriptStep::Reply(value)) => conform(stage, value.to_string(), usage),
            Some(ScriptStep::Raw(raw)) => conform(stage, raw, usage),
            Some(ScriptStep::Error(ScriptedFailure::Transport)) => {
                Err(OracleError::Transport("scripted transport failure".to_string()))
            }
            Some(ScriptStep::Error(ScriptedFailure::Timeout)) => {
                Err(OracleError::Timeout(Duration::from_secs(20)))
            }
            Some(ScriptStep::Error(ScriptedFailure::Unavailable)) => {
                Err(OracleError::Unavailable("scripted outage".to_string()))
            }
            None => Err(OracleError::Unavailable(format!(
                "script has no reply for {}",
                stage
            ))),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
