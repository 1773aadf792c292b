//! Decision-head stage runner.
//!
//! One stage call is a small state machine:
//!
//! ```text
//! Request ──ok──────────────► Accepted
//!    │  ▲
//!    │  └── SchemaRetry ◄── violation (attempt <= max_schema_retries)
//!    │
//!    ├── violation, ceiling reached ──► Failed(SchemaExhausted)
//!    └── oracle unavailable ──────────► Failed(Unavailable)
//! ```
//!
//! Transport failures and timeouts never reach the state machine as
//! violations: they are retried underneath with exponential backoff, and
//! only surface once the backoff budget is spent.

use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use thiserror::Error;

use geoguard_core::audit::{Attempt, StageOutcome, StageRecord, StageTrail, UsageTotals};
use geoguard_core::schema::stage_schema;
use geoguard_core::{accept, GroundingContext, ScanState, SchemaError, Stage, StageOutput};

use crate::config::OracleConfig;
use crate::oracle::{Oracle, OracleError, OracleReply, OracleRequest};
use crate::prompts::schema_retry_follow_up;
use crate::providers::ChatMessage;

/// Errors from a single stage call.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{stage} output failed validation after {attempts} attempts: {}", violations.join("; "))]
    SchemaExhausted {
        stage: Stage,
        attempts: u32,
        violations: Vec<String>,
    },

    #[error("{stage} oracle unavailable: {source}")]
    Unavailable {
        stage: Stage,
        #[source]
        source: OracleError,
    },

    #[error("Stage schema error: {0}")]
    Schema(#[from] SchemaError),
}

impl StageError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::SchemaExhausted { stage, .. } | Self::Unavailable { stage, .. } => Some(*stage),
            Self::Schema(_) => None,
        }
    }
}

/// Everything one stage call produced, successful or not.
#[derive(Debug)]
pub struct StageRun<T> {
    pub result: Result<T, StageError>,
    pub record: StageRecord,
    pub transitions: Vec<ScanState>,
    pub usage: UsageTotals,
}

impl<T> StageRun<T> {
    /// Move the audit side of this run into `trail` and return the result.
    pub fn record_into(self, trail: &mut StageTrail) -> Result<T, StageError> {
        trail.stages.push(self.record);
        trail.transitions.extend(self.transitions);
        trail.usage += self.usage;
        self.result
    }
}

enum State<T> {
    Request,
    SchemaRetry { raw: String, violations: Vec<String> },
    Accepted { output: T, value: serde_json::Value },
    Failed(StageError),
}

fn accepted_state(stage: Stage, sample: Option<usize>) -> ScanState {
    match stage {
        Stage::Detector => ScanState::Detected,
        Stage::PolicyMapper => ScanState::PolicyMapped,
        Stage::Arbiter => ScanState::Arbitrated {
            sample: sample.unwrap_or(0),
        },
    }
}

/// Runs stages against an oracle with the configured retry policy.
pub struct StageRunner<'a> {
    oracle: &'a dyn Oracle,
    config: &'a OracleConfig,
}

impl<'a> StageRunner<'a> {
    pub fn new(oracle: &'a dyn Oracle, config: &'a OracleConfig) -> Self {
        Self { oracle, config }
    }

    /// Run one stage to acceptance or failure.
    ///
    /// `messages` is the opening exchange; on a schema or grounding
    /// violation the rejected reply and a follow-up listing the violations
    /// are appended before the next attempt.
    pub async fn run<T: StageOutput>(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        ctx: &GroundingContext<'_>,
        sample: Option<usize>,
    ) -> StageRun<T> {
        let stage = T::STAGE;
        let mut record = StageRecord {
            stage,
            sample,
            attempts: Vec::new(),
            outcome: StageOutcome::SchemaExhausted,
        };
        let mut transitions = Vec::new();
        let mut usage = UsageTotals::default();

        let schema = match stage_schema(stage) {
            Ok(schema) => schema,
            Err(e) => {
                let error = StageError::from(e);
                record.outcome = StageOutcome::Unavailable {
                    error: error.to_string(),
                };
                return StageRun {
                    result: Err(error),
                    record,
                    transitions,
                    usage,
                };
            }
        };

        let mut messages = messages;
        let mut attempt: u32 = 0;
        let mut state = State::Request;

        let result = loop {
            state = match state {
                State::Request => {
                    attempt += 1;
                    let request = OracleRequest {
                        stage,
                        messages: messages.clone(),
                        schema: schema.clone(),
                        temperature,
                    };
                    let (reply, calls) = self.call(request).await;
                    usage.oracle_calls += calls;

                    match reply {
                        Ok(reply) => {
                            usage.input_tokens += u64::from(reply.usage.prompt_tokens);
                            usage.output_tokens += u64::from(reply.usage.completion_tokens);
                            match accept::<T>(&reply.value, ctx) {
                                Ok(output) => {
                                    record.attempts.push(Attempt {
                                        attempt,
                                        raw: reply.raw,
                                        violations: Vec::new(),
                                    });
                                    State::Accepted {
                                        output,
                                        value: reply.value,
                                    }
                                }
                                Err(violations) => State::SchemaRetry {
                                    raw: reply.raw,
                                    violations,
                                },
                            }
                        }
                        Err(OracleError::Validation { raw, errors }) => State::SchemaRetry {
                            raw,
                            violations: errors,
                        },
                        Err(source) => {
                            tracing::warn!(
                                stage = %stage,
                                attempt,
                                error = %source,
                                "Oracle unavailable"
                            );
                            record.outcome = StageOutcome::Unavailable {
                                error: source.to_string(),
                            };
                            State::Failed(StageError::Unavailable { stage, source })
                        }
                    }
                }
                State::SchemaRetry { raw, violations } => {
                    record.attempts.push(Attempt {
                        attempt,
                        raw: raw.clone(),
                        violations: violations.clone(),
                    });

                    if attempt > self.config.max_schema_retries {
                        tracing::warn!(
                            stage = %stage,
                            attempts = attempt,
                            "Schema retries exhausted"
                        );
                        record.outcome = StageOutcome::SchemaExhausted;
                        transitions.push(ScanState::Failed { stage });
                        State::Failed(StageError::SchemaExhausted {
                            stage,
                            attempts: attempt,
                            violations,
                        })
                    } else {
                        tracing::debug!(
                            stage = %stage,
                            attempt,
                            violations = violations.len(),
                            "Output rejected, re-requesting"
                        );
                        transitions.push(ScanState::SchemaRetry { stage, attempt });
                        messages.push(ChatMessage::assistant(raw));
                        messages.push(schema_retry_follow_up(&violations));
                        State::Request
                    }
                }
                State::Accepted { output, value } => {
                    record.outcome = StageOutcome::Accepted { output: value };
                    transitions.push(accepted_state(stage, sample));
                    break Ok(output);
                }
                State::Failed(error) => break Err(error),
            };
        };

        StageRun {
            result,
            record,
            transitions,
            usage,
        }
    }

    /// One logical oracle call: per-call timeout, with backoff retries for
    /// transient failures. Returns the outcome and the number of calls made.
    async fn call(&self, request: OracleRequest) -> (Result<OracleReply, OracleError>, u32) {
        let oracle = self.oracle;
        let timeout = self.config.timeout;
        let stage = request.stage;
        let mut calls: u32 = 0;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.min_backoff)
            .with_max_delay(self.config.max_backoff)
            .with_max_times(self.config.max_retries);

        let attempt = || {
            calls += 1;
            let request = request.clone();
            async move {
                match tokio::time::timeout(timeout, oracle.request(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(OracleError::Timeout(timeout)),
                }
            }
        };

        let result = attempt
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(OracleError::is_transient)
            .notify(|error: &OracleError, delay: Duration| {
                tracing::warn!(
                    stage = %stage,
                    error = %error,
                    delay = ?delay,
                    "Transient oracle failure, backing off"
                );
            })
            .await;

        (result, calls)
    }
}
