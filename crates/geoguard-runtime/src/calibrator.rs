//! Arbiter sampling for the calibrator.
//!
//! Runs the Arbiter `samples` times concurrently at the calibration
//! temperature, reconciles each grounded sample, and hands them to
//! [`geoguard_core::finalize`] for the vote and recalibration. A sample that
//! exhausts its schema retries fails the whole scan. A sample lost to an
//! oracle outage abstains.

use futures::future::join_all;

use geoguard_core::audit::StageTrail;
use geoguard_core::{
    finalize, reconcile, ArbiterOutput, CalibrationConfig, Calibrated, DetectorOutput,
    GroundingContext, PolicyMapperOutput, ReconcileSignals, ScanState, Stage,
};

use crate::oracle::OracleError;
use crate::providers::ChatMessage;
use crate::stages::{StageError, StageRunner};

/// How sampling ended.
#[derive(Debug)]
pub enum SampleOutcome {
    Calibrated(Calibrated),
    /// At least one sample exhausted its schema retries
    Exhausted(StageError),
    /// Every sample failed because the oracle was unavailable
    Unavailable(StageError),
}

/// Inputs shared by every Arbiter sample.
pub struct ArbiterInputs<'a> {
    pub messages: &'a [ChatMessage],
    pub detector: &'a DetectorOutput,
    pub mapper: &'a PolicyMapperOutput,
    pub signals: ReconcileSignals,
}

/// Sample, reconcile and calibrate. Stage records, transitions and usage
/// land in `trail` in sample order.
pub async fn sample_and_calibrate(
    runner: &StageRunner<'_>,
    inputs: ArbiterInputs<'_>,
    ctx: &GroundingContext<'_>,
    config: &CalibrationConfig,
    trail: &mut StageTrail,
) -> SampleOutcome {
    let temperature = config.temperature as f32;
    let runs = join_all((0..config.samples).map(|sample| {
        runner.run::<ArbiterOutput>(inputs.messages.to_vec(), temperature, ctx, Some(sample))
    }))
    .await;

    let mut provisionals = Vec::with_capacity(runs.len());
    let mut exhausted = None;
    let mut unavailable = None;

    for (sample, run) in runs.into_iter().enumerate() {
        match run.record_into(trail) {
            Ok(arbiter) => {
                provisionals.push(reconcile(
                    inputs.detector,
                    inputs.mapper,
                    arbiter,
                    inputs.signals,
                ));
            }
            Err(error @ StageError::SchemaExhausted { .. }) => {
                tracing::warn!(sample, error = %error, "Arbiter sample exhausted schema retries");
                exhausted.get_or_insert(error);
            }
            Err(error) => {
                tracing::warn!(sample, error = %error, "Arbiter sample abstains");
                unavailable.get_or_insert(error);
            }
        }
    }

    if let Some(error) = exhausted {
        return SampleOutcome::Exhausted(error);
    }

    if let Some(calibrated) = finalize(provisionals, config) {
        trail.vote = Some(calibrated.tally.clone());
        trail.transitions.push(ScanState::Calibrated);
        return SampleOutcome::Calibrated(calibrated);
    }

    SampleOutcome::Unavailable(unavailable.unwrap_or_else(|| StageError::Unavailable {
        stage: Stage::Arbiter,
        source: OracleError::Unavailable("no Arbiter samples were requested".to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleConfig;
    use crate::oracle::{ScriptedFailure, ScriptedOracle};
    use geoguard_core::retrieval::RegulationSection;
    use geoguard_core::{ControlType, DecisionLabel, Framing, RegSnippet, Regulation};
    use serde_json::json;
    use std::time::Duration;

    const FEATURE: &str = "Utah minors are blocked from logging in overnight.";

    fn section() -> RegulationSection {
        RegulationSection {
            section_id: "ut-smra:13-63-105".to_string(),
            regulation: Regulation::UtSmra,
            heading: vec![],
            text: "during the hours of 10:30 p.m. to 6:30 a.m.".to_string(),
        }
    }

    fn detector() -> DetectorOutput {
        DetectorOutput {
            label: Framing::Legal,
            reason: "Utah".to_string(),
            feature_spans: vec!["Utah minors are blocked".to_string()],
        }
    }

    fn mapper() -> PolicyMapperOutput {
        PolicyMapperOutput {
            framing: Framing::Legal,
            control_type: vec![ControlType::AgeGating],
            regulations: vec![Regulation::UtSmra],
            reg_snippets: vec![RegSnippet::new(
                "ut-smra:13-63-105",
                "10:30 p.m. to 6:30 a.m.",
            )],
            reason: "curfew".to_string(),
        }
    }

    fn arbiter(decision: &str, confidence: f64) -> serde_json::Value {
        json!({
            "decision": decision,
            "confidence": confidence,
            "reasoning_summary": "Utah curfew for minors.",
            "feature_spans": ["Utah minors are blocked"],
            "reg_snippets": [{"section_id": "ut-smra:13-63-105", "quote": "10:30 p.m. to 6:30 a.m."}],
            "regulations": ["UT-SMRA"],
            "control_type": ["age_gating"]
        })
    }

    fn oracle_config() -> OracleConfig {
        OracleConfig {
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_retries: 1,
            ..OracleConfig::default()
        }
    }

    async fn run(oracle: &ScriptedOracle, trail: &mut StageTrail) -> SampleOutcome {
        let config = oracle_config();
        let runner = StageRunner::new(oracle, &config);
        let s = section();
        let ctx = GroundingContext::new(FEATURE, vec![&s]);
        let det = detector();
        let map = mapper();
        let messages = vec![ChatMessage::user("decide")];
        let inputs = ArbiterInputs {
            messages: &messages,
            detector: &det,
            mapper: &map,
            signals: ReconcileSignals {
                geo_tagged: true,
                regulation_hits: 1,
            },
        };
        sample_and_calibrate(&runner, inputs, &ctx, &CalibrationConfig::default(), trail).await
    }

    #[tokio::test]
    async fn test_majority_with_review_dissent() {
        let oracle = ScriptedOracle::new();
        oracle
            .reply(Stage::Arbiter, arbiter("YES", 0.9))
            .reply(Stage::Arbiter, arbiter("YES", 0.8))
            .reply(Stage::Arbiter, arbiter("REVIEW", 0.4));
        let mut trail = StageTrail::default();

        let SampleOutcome::Calibrated(calibrated) = run(&oracle, &mut trail).await else {
            panic!("expected calibrated outcome");
        };
        assert_eq!(calibrated.result.decision, DecisionLabel::Yes);
        assert!((calibrated.tally.mean_confidence - 0.85).abs() < 1e-9);
        assert_eq!(trail.stages.len(), 3);
        assert_eq!(trail.vote.as_ref().map(|v| v.yes), Some(2));
        assert_eq!(trail.transitions.last(), Some(&ScanState::Calibrated));
        assert!(oracle
            .requests()
            .iter()
            .all(|r| (r.temperature - 0.2).abs() < 1e-6));
    }

    #[tokio::test]
    async fn test_failed_sample_abstains() {
        let oracle = ScriptedOracle::new();
        oracle
            .reply(Stage::Arbiter, arbiter("YES", 0.9))
            .fail(Stage::Arbiter, ScriptedFailure::Unavailable)
            .reply(Stage::Arbiter, arbiter("YES", 0.7));
        let mut trail = StageTrail::default();

        let SampleOutcome::Calibrated(calibrated) = run(&oracle, &mut trail).await else {
            panic!("expected calibrated outcome");
        };
        assert_eq!(calibrated.tally.votes.len(), 2);
        assert_eq!(calibrated.result.decision, DecisionLabel::Yes);
    }

    #[tokio::test]
    async fn test_all_unavailable() {
        let oracle = ScriptedOracle::new().repeating();
        oracle.fail(Stage::Arbiter, ScriptedFailure::Unavailable);
        let mut trail = StageTrail::default();

        assert!(matches!(
            run(&oracle, &mut trail).await,
            SampleOutcome::Unavailable(_)
        ));
        assert!(trail.vote.is_none());
    }

    #[tokio::test]
    async fn test_one_exhausted_sample_fails_the_vote() {
        let oracle = ScriptedOracle::new();
        oracle.reply(Stage::Arbiter, arbiter("YES", 0.9));
        for _ in 0..10 {
            oracle.push(
                Stage::Arbiter,
                crate::oracle::ScriptStep::Raw("YES, definitely".to_string()),
            );
        }
        let mut trail = StageTrail::default();

        let outcome = run(&oracle, &mut trail).await;
        assert!(
            matches!(outcome, SampleOutcome::Exhausted(StageError::SchemaExhausted { .. })),
            "got {:?}",
            outcome
        );
        assert!(trail.vote.is_none());
        assert_ne!(trail.transitions.last(), Some(&ScanState::Calibrated));
        assert_eq!(trail.stages.len(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_outranks_outage() {
        let oracle = ScriptedOracle::new();
        oracle
            .reply(Stage::Arbiter, arbiter("YES", 0.9))
            .fail(Stage::Arbiter, ScriptedFailure::Unavailable);
        for _ in 0..10 {
            oracle.push(
                Stage::Arbiter,
                crate::oracle::ScriptStep::Raw("not json".to_string()),
            );
        }
        let mut trail = StageTrail::default();

        assert!(matches!(
            run(&oracle, &mut trail).await,
            SampleOutcome::Exhausted(_)
        ));
    }

    #[tokio::test]
    async fn test_all_exhausted() {
        let oracle = ScriptedOracle::new().repeating();
        oracle.push(
            Stage::Arbiter,
            crate::oracle::ScriptStep::Raw("YES, definitely".to_string()),
        );
        let mut trail = StageTrail::default();

        assert!(matches!(
            run(&oracle, &mut trail).await,
            SampleOutcome::Exhausted(StageError::SchemaExhausted { .. })
        ));
        assert_eq!(trail.stages.len(), 3);
    }
}
