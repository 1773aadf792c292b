//! End-to-end classification of feature artifacts.
//!
//! Normalizer → Router → Retriever → Detector → Policy Mapper → Arbiter ×N
//! → Calibrator → Auditor. Every scan appends exactly one audit record,
//! whatever its outcome.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;

use geoguard_core::audit::{AuditDraft, AuditOutcome, AuditStore, StageTrail};
use geoguard_core::retrieval::RegulationSection;
use geoguard_core::{
    validate_decision, AuditError, CaseResult, Clause, ClauseIndex, Decision, DecisionLabel,
    DecisionMetadata, DetectorOutput, EvaluationReport, Evidence, FeatureArtifact,
    GroundingContext, LabeledFeature, PolicyMapperOutput, Provisional, ReconcileSignals,
    ReferenceHandle, RetrievalIds, RuntimeInfo, ScanState,
};

use crate::calibrator::{sample_and_calibrate, ArbiterInputs, SampleOutcome};
use crate::config::RuntimeConfig;
use crate::oracle::Oracle;
use crate::prompts::{self, PROMPT_VERSION};
use crate::stages::{StageError, StageRunner};

pub const NO_TEXT_REASONING: &str = "No feature text available; nothing to classify.";

/// Errors that end a scan without a decision.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage kept producing invalid output past the retry ceiling
    #[error("Stage failed: {0}")]
    Stage(#[from] StageError),

    #[error("Decision failed validation: {}", .0.join("; "))]
    InvalidDecision(Vec<String>),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What one scan settled on before validation and audit.
enum Settled {
    Decided(Decision),
    Failed(PipelineError),
}

/// Per-scan values threaded through the stages.
struct Scan<'a> {
    feature: &'a FeatureArtifact,
    retrieval: RetrievalIds,
    runtime: RuntimeInfo,
    trail: StageTrail,
}

impl Scan<'_> {
    fn decision(&self, label: DecisionLabel, confidence: f64, reasoning: String) -> Decision {
        Decision {
            feature_id: self.feature.id.clone(),
            decision: label,
            confidence,
            reasoning_summary: reasoning,
            evidence: Evidence::default(),
            regulations: Vec::new(),
            control_type: Vec::new(),
            metadata: DecisionMetadata {
                retrieval: self.retrieval.clone(),
                runtime: self.runtime.clone(),
            },
        }
    }

    fn from_provisional(&self, provisional: Provisional) -> Decision {
        Decision {
            feature_id: self.feature.id.clone(),
            decision: provisional.decision,
            confidence: provisional.confidence,
            reasoning_summary: provisional.reasoning_summary,
            evidence: provisional.evidence,
            regulations: provisional.regulations,
            control_type: provisional.control_type,
            metadata: DecisionMetadata {
                retrieval: self.retrieval.clone(),
                runtime: self.runtime.clone(),
            },
        }
    }

    /// `REVIEW` after the oracle became unusable, keeping whatever
    /// feature evidence the Detector already grounded.
    fn degraded(&mut self, error: &StageError, detector: Option<&DetectorOutput>) -> Decision {
        self.trail.transitions.push(ScanState::Degraded);
        let mut decision = self.decision(
            DecisionLabel::Review,
            0.0,
            format!("Oracle unavailable: insufficient evidence to decide ({}).", error),
        );
        if let Some(detector) = detector {
            decision.evidence.feature_spans = detector.feature_spans.clone();
        }
        decision
    }

    /// Outages degrade; anything else fails the scan.
    fn stage_failed(&mut self, error: StageError, detector: Option<&DetectorOutput>) -> Settled {
        match error {
            StageError::Unavailable { .. } => Settled::Decided(self.degraded(&error, detector)),
            other => Settled::Failed(PipelineError::Stage(other)),
        }
    }
}

/// Classifies features against the current reference data and records
/// every scan in the audit store.
pub struct Pipeline {
    oracle: Arc<dyn Oracle>,
    reference: Arc<ReferenceHandle>,
    audit: Arc<dyn AuditStore>,
    config: RuntimeConfig,
}

impl Pipeline {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        reference: Arc<ReferenceHandle>,
        audit: Arc<dyn AuditStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            oracle,
            reference,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn reference(&self) -> &Arc<ReferenceHandle> {
        &self.reference
    }

    /// Classify one feature.
    ///
    /// Returns a schema-valid decision, or an error when a stage exhausted
    /// its schema retries or the decision failed final validation. Oracle
    /// outages degrade to `REVIEW` instead of failing.
    pub async fn classify(&self, feature: &FeatureArtifact) -> Result<Decision, PipelineError> {
        let span = tracing::info_span!("classify", feature_id = %feature.id);
        self.run_scan(feature).instrument(span).await
    }

    async fn run_scan(&self, feature: &FeatureArtifact) -> Result<Decision, PipelineError> {
        let reference = self.reference.snapshot();
        let retrieval_config = &self.config.pipeline.retrieval;
        let feature_text = feature.full_text();

        let mut scan = Scan {
            feature,
            retrieval: RetrievalIds::default(),
            runtime: RuntimeInfo::now(
                PROMPT_VERSION,
                reference.regulations.version(),
                reference.router.model_version(),
            ),
            trail: StageTrail::default(),
        };

        let normalized = reference.normalizer.normalize(&feature.id, &feature_text);
        scan.trail.transitions.push(ScanState::Normalized);

        if normalized.is_empty() {
            tracing::info!("No usable feature text");
            let decision = scan.decision(DecisionLabel::Review, 0.0, NO_TEXT_REASONING.to_string());
            return self.emit(scan, Settled::Decided(decision), None);
        }

        let verdict = reference.router.route(&normalized);
        scan.trail.transitions.push(ScanState::Routed {
            short_circuit: verdict.short_circuit,
        });
        scan.trail.router = Some(verdict.clone());

        if verdict.short_circuit {
            tracing::info!(
                probability = verdict.probability,
                "Router short-circuit to NO"
            );
            let decision = scan.decision(DecisionLabel::No, verdict.probability, verdict.reasoning());
            return self.emit(scan, Settled::Decided(decision), None);
        }

        let clause_index = ClauseIndex::build(&normalized, reference.embedder.clone());
        let salient = clause_index.salient(&normalized, retrieval_config);
        let reg_hits = reference
            .regulations
            .search(&normalized.joined_text(), retrieval_config);
        scan.retrieval = RetrievalIds {
            feature_clause_ids: salient.ids(),
            reg_section_ids: reg_hits.ids(),
        };
        scan.trail.transitions.push(ScanState::Retrieved);

        let clauses: Vec<&Clause> = salient
            .hits
            .iter()
            .filter_map(|hit| normalized.clause(&hit.id))
            .collect();
        let sections: Vec<&RegulationSection> = reg_hits
            .hits
            .iter()
            .filter_map(|hit| reference.regulations.section(&hit.id))
            .collect();
        tracing::debug!(
            clauses = clauses.len(),
            sections = sections.len(),
            "Retrieved evidence"
        );

        let ctx = GroundingContext::new(&feature_text, sections.clone());
        let runner = StageRunner::new(self.oracle.as_ref(), &self.config.oracle);
        let temperature = self.config.oracle.stage_temperature;

        let detector = match runner
            .run::<DetectorOutput>(
                prompts::detector_messages(&feature.name, &clauses),
                temperature,
                &ctx,
                None,
            )
            .await
            .record_into(&mut scan.trail)
        {
            Ok(output) => output,
            Err(error) => {
                let settled = scan.stage_failed(error, None);
                return self.emit(scan, settled, Some(&ctx));
            }
        };

        let mapper = match runner
            .run::<PolicyMapperOutput>(
                prompts::policy_mapper_messages(&detector, &sections),
                temperature,
                &ctx,
                None,
            )
            .await
            .record_into(&mut scan.trail)
        {
            Ok(output) => output,
            Err(error) => {
                let settled = scan.stage_failed(error, Some(&detector));
                return self.emit(scan, settled, Some(&ctx));
            }
        };

        let messages = prompts::arbiter_messages(&detector, &mapper, &clauses, &sections);
        let inputs = ArbiterInputs {
            messages: &messages,
            detector: &detector,
            mapper: &mapper,
            signals: ReconcileSignals {
                geo_tagged: normalized.has_geo(),
                regulation_hits: reg_hits.len(),
            },
        };
        let outcome = sample_and_calibrate(
            &runner,
            inputs,
            &ctx,
            &self.config.pipeline.calibration,
            &mut scan.trail,
        )
        .await;

        let settled = match outcome {
            SampleOutcome::Calibrated(calibrated) => {
                if calibrated.triaged {
                    tracing::info!(
                        confidence = calibrated.result.confidence,
                        "Low confidence, triaged to REVIEW"
                    );
                }
                Settled::Decided(scan.from_provisional(calibrated.result))
            }
            SampleOutcome::Exhausted(error) => Settled::Failed(PipelineError::Stage(error)),
            SampleOutcome::Unavailable(error) => {
                Settled::Decided(scan.degraded(&error, Some(&detector)))
            }
        };
        self.emit(scan, settled, Some(&ctx))
    }

    /// Classify many features, at most `batch.concurrency` at a time.
    ///
    /// Results come back in input order; one failure does not stop the rest.
    pub async fn classify_batch(
        &self,
        features: Vec<FeatureArtifact>,
    ) -> Vec<Result<Decision, PipelineError>> {
        let concurrency = self.config.batch.concurrency.max(1);
        tracing::info!(features = features.len(), concurrency, "Starting batch");

        stream::iter(features)
            .map(|feature| async move { self.classify(&feature).await })
            .buffered(concurrency)
            .collect()
            .await
    }

    /// Classify a labeled set through [`Pipeline::classify_batch`] and score
    /// the decisions against the labels.
    pub async fn evaluate(&self, labeled: Vec<LabeledFeature>) -> EvaluationReport {
        let expected: Vec<(String, DecisionLabel)> = labeled
            .iter()
            .map(|l| (l.feature.id.clone(), l.ground_truth))
            .collect();
        let results = self
            .classify_batch(labeled.into_iter().map(|l| l.feature).collect())
            .await;

        let cases = expected
            .into_iter()
            .zip(results)
            .map(|((feature_id, expected), result)| {
                let predicted = match result {
                    Ok(decision) => Some(decision.decision),
                    Err(error) => {
                        tracing::warn!(%feature_id, error = %error, "Labeled feature failed");
                        None
                    }
                };
                CaseResult {
                    feature_id,
                    expected,
                    predicted,
                }
            })
            .collect();

        let report = EvaluationReport::from_cases(cases);
        tracing::info!(
            total = report.total,
            accuracy = report.accuracy,
            yes_f1 = report.yes.f1,
            "Evaluation complete"
        );
        report
    }

    /// Validate, audit and return the scan's outcome.
    fn emit(
        &self,
        scan: Scan<'_>,
        settled: Settled,
        ctx: Option<&GroundingContext<'_>>,
    ) -> Result<Decision, PipelineError> {
        let settled = match settled {
            Settled::Decided(decision) => match check_decision(&decision, ctx) {
                Ok(()) => Settled::Decided(decision),
                Err(error) => Settled::Failed(error),
            },
            failed => failed,
        };

        let outcome = match &settled {
            Settled::Decided(decision) => AuditOutcome::Decided {
                decision: decision.clone(),
            },
            Settled::Failed(error) => AuditOutcome::Failed {
                error: error.to_string(),
            },
        };

        let record = self.audit.append(AuditDraft {
            feature: scan.feature.clone(),
            retrieval: scan.retrieval,
            trail: scan.trail,
            outcome,
            correction: None,
        })?;

        match settled {
            Settled::Decided(decision) => {
                tracing::info!(
                    decision = %decision.decision,
                    confidence = decision.confidence,
                    audit_sequence = record.sequence,
                    "Classified feature"
                );
                Ok(decision)
            }
            Settled::Failed(error) => {
                tracing::error!(
                    error = %error,
                    audit_sequence = record.sequence,
                    "Classification failed"
                );
                Err(error)
            }
        }
    }
}

/// Final gate: structural invariants, the Decision schema, and grounding
/// of every quote against the texts the scan retrieved.
fn check_decision(
    decision: &Decision,
    ctx: Option<&GroundingContext<'_>>,
) -> Result<(), PipelineError> {
    decision
        .check_invariants()
        .map_err(|e| PipelineError::InvalidDecision(vec![e.to_string()]))?;

    validate_decision(&serde_json::to_value(decision)?).map_err(PipelineError::InvalidDecision)?;

    let evidence = &decision.evidence;
    match ctx {
        Some(ctx) => {
            let mut violations = Vec::new();
            if let Err(v) = ctx.ground_feature_spans(&evidence.feature_spans) {
                violations.extend(v);
            }
            if let Err(v) = ctx.ground_reg_snippets(&evidence.reg_snippets) {
                violations.extend(v);
            }
            if violations.is_empty() {
                Ok(())
            } else {
                Err(PipelineError::InvalidDecision(violations))
            }
        }
        None if evidence.is_empty() => Ok(()),
        None => Err(PipelineError::InvalidDecision(vec![
            "decision carries evidence but no source texts were retrieved".to_string(),
        ])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{ScriptedFailure, ScriptedOracle};
    use geoguard_core::{MemoryAuditLog, ReferenceData, Stage};

    fn pipeline(oracle: Arc<ScriptedOracle>) -> (Pipeline, Arc<MemoryAuditLog>) {
        let reference = Arc::new(ReferenceHandle::new(ReferenceData::embedded().unwrap()));
        let audit = Arc::new(MemoryAuditLog::new());
        let mut config = RuntimeConfig::default();
        config.oracle.min_backoff = std::time::Duration::from_millis(1);
        config.oracle.max_backoff = std::time::Duration::from_millis(2);
        let pipeline = Pipeline::new(oracle, reference, audit.clone(), config);
        (pipeline, audit)
    }

    #[tokio::test]
    async fn test_empty_text_reviews_without_oracle() {
        let oracle = Arc::new(ScriptedOracle::new());
        let (pipeline, audit) = pipeline(oracle.clone());
        let feature = FeatureArtifact::new("F-0", "Blank", "<p> </p>");

        let decision = pipeline.classify(&feature).await.unwrap();
        assert_eq!(decision.decision, DecisionLabel::Review);
        assert_eq!(decision.confidence, 0.0);
        assert_eq!(decision.reasoning_summary, NO_TEXT_REASONING);
        assert!(oracle.requests().is_empty());
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_detector_outage_degrades_to_review() {
        let oracle = Arc::new(ScriptedOracle::new().repeating());
        oracle.fail(Stage::Detector, ScriptedFailure::Unavailable);
        let (pipeline, audit) = pipeline(oracle.clone());
        let feature = FeatureArtifact::new(
            "F-9",
            "Curfew",
            "To comply with the Utah Social Media Regulation Act, minors in Utah cannot log in \
             between 10:30 p.m. and 6:30 a.m.",
        );

        let decision = pipeline.classify(&feature).await.unwrap();
        assert_eq!(decision.decision, DecisionLabel::Review);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.reasoning_summary.contains("Oracle unavailable"));
        assert_eq!(oracle.calls(Stage::PolicyMapper), 0);

        let records = audit.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].trail.transitions.last(),
            Some(&ScanState::Degraded)
        );
    }

    #[test]
    fn test_check_decision_rejects_ungrounded_evidence() {
        let feature = FeatureArtifact::new("F-1", "x", "Utah minors get a curfew.");
        let text = feature.full_text();
        let ctx = GroundingContext::new(&text, vec![]);
        let scan = Scan {
            feature: &feature,
            retrieval: RetrievalIds::default(),
            runtime: RuntimeInfo::now(PROMPT_VERSION, "idx", "router"),
            trail: StageTrail::default(),
        };
        let mut decision = scan.decision(DecisionLabel::Review, 0.5, "r".to_string());
        assert!(check_decision(&decision, Some(&ctx)).is_ok());

        decision.evidence.feature_spans = vec!["Texas minors".to_string()];
        assert!(matches!(
            check_decision(&decision, Some(&ctx)),
            Err(PipelineError::InvalidDecision(_))
        ));
        assert!(check_decision(&decision, None).is_err());
    }
}
