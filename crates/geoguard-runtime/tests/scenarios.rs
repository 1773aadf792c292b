//! End-to-end scenarios against a scripted oracle.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use geoguard_core::{
    parse_labeled_jsonl, AuditOutcome, AuditStore, ControlType, DecisionLabel, FeatureArtifact,
    JsonlAuditLog, LabeledFeature, MemoryAuditLog, ReferenceData, ReferenceHandle, Regulation,
    ScanState, Stage,
};
use geoguard_runtime::{
    Pipeline, PipelineError, RuntimeConfig, ScriptStep, ScriptedFailure, ScriptedOracle,
    StageError,
};

const UTAH_CURFEW: &str = "To comply with the Utah Social Media Regulation Act, we implement a \
                           curfew-based login restriction for minors.";
const KOREA_AB_TEST: &str = "A/B test dark theme accessibility for users in South Korea. \
                             Rollout is limited via GH and monitored with FR flags.";
const ALL_BUT_KOREA: &str =
    "Feature is available in all regions except Korea; no legal rationale stated.";

const CURFEW_SECTION: &str = "ut-smra:13-63-105";
const CURFEW_QUOTE: &str = "during the hours of 10:30 p.m. to 6:30 a.m.";

fn config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.oracle.min_backoff = Duration::from_millis(1);
    config.oracle.max_backoff = Duration::from_millis(2);
    config
}

fn pipeline_with(oracle: Arc<ScriptedOracle>, audit: Arc<dyn AuditStore>) -> Pipeline {
    let reference = Arc::new(ReferenceHandle::new(ReferenceData::embedded().unwrap()));
    Pipeline::new(oracle, reference, audit, config())
}

fn pipeline(oracle: Arc<ScriptedOracle>) -> (Pipeline, Arc<MemoryAuditLog>) {
    let audit = Arc::new(MemoryAuditLog::new());
    (pipeline_with(oracle, audit.clone()), audit)
}

fn utah_detector() -> Value {
    json!({
        "label": "LEGAL",
        "reason": "The feature exists to comply with a Utah statute.",
        "feature_spans": ["curfew-based login restriction for minors"]
    })
}

fn utah_mapper() -> Value {
    json!({
        "framing": "LEGAL",
        "control_type": ["age_gating"],
        "regulations": ["UT-SMRA"],
        "reg_snippets": [{"section_id": CURFEW_SECTION, "quote": CURFEW_QUOTE}],
        "reason": "Utah requires a curfew for minor accounts."
    })
}

fn utah_arbiter(decision: &str, confidence: f64) -> Value {
    json!({
        "decision": decision,
        "confidence": confidence,
        "reasoning_summary": "The login curfew for minors implements the Utah curfew requirement.",
        "feature_spans": ["curfew-based login restriction for minors"],
        "reg_snippets": [{"section_id": CURFEW_SECTION, "quote": CURFEW_QUOTE}],
        "regulations": ["UT-SMRA"],
        "control_type": ["age_gating"]
    })
}

fn script_utah(oracle: &ScriptedOracle, arbiter: &[(&str, f64)]) {
    oracle
        .reply(Stage::Detector, utah_detector())
        .reply(Stage::PolicyMapper, utah_mapper());
    for (decision, confidence) in arbiter {
        oracle.reply(Stage::Arbiter, utah_arbiter(decision, *confidence));
    }
}

fn utah_feature() -> FeatureArtifact {
    FeatureArtifact::new("F-UT-1", "Curfew login blocker", UTAH_CURFEW)
}

#[tokio::test]
async fn utah_curfew_is_yes_under_ut_smra() {
    let oracle = Arc::new(ScriptedOracle::new());
    script_utah(&oracle, &[("YES", 0.9), ("YES", 0.85), ("YES", 0.8)]);
    let (pipeline, audit) = pipeline(oracle.clone());

    let decision = pipeline.classify(&utah_feature()).await.unwrap();

    assert_eq!(decision.decision, DecisionLabel::Yes);
    assert_eq!(decision.regulations, vec![Regulation::UtSmra]);
    assert!(decision.control_type.contains(&ControlType::AgeGating));
    assert!((decision.confidence - 0.85).abs() < 1e-9);

    let snippet = &decision.evidence.reg_snippets[0];
    assert_eq!(snippet.section_id, CURFEW_SECTION);
    assert!(UTAH_CURFEW.contains(&decision.evidence.feature_spans[0]));
    assert!(decision
        .metadata
        .retrieval
        .reg_section_ids
        .contains(&CURFEW_SECTION.to_string()));

    assert_eq!(oracle.calls(Stage::Detector), 1);
    assert_eq!(oracle.calls(Stage::PolicyMapper), 1);
    assert_eq!(oracle.calls(Stage::Arbiter), 3);

    let records = audit.records().unwrap();
    assert_eq!(records.len(), 1);
    let trail = &records[0].trail;
    assert_eq!(trail.stages.len(), 5);
    assert_eq!(trail.transitions.first(), Some(&ScanState::Normalized));
    assert_eq!(trail.transitions.last(), Some(&ScanState::Calibrated));
    assert_eq!(trail.usage.oracle_calls, 5);
}

#[tokio::test]
async fn detector_never_sees_regulation_text() {
    let oracle = Arc::new(ScriptedOracle::new());
    script_utah(&oracle, &[("YES", 0.9), ("YES", 0.9), ("YES", 0.9)]);
    let (pipeline, _) = pipeline(oracle.clone());

    pipeline.classify(&utah_feature()).await.unwrap();

    let detector = oracle
        .requests()
        .into_iter()
        .find(|r| r.stage == Stage::Detector)
        .unwrap();
    assert!(detector.messages.iter().all(|m| !m.content.contains("10:30 p.m.")));
}

#[tokio::test]
async fn korea_ab_test_short_circuits_without_oracle() {
    let oracle = Arc::new(ScriptedOracle::new());
    let (pipeline, audit) = pipeline(oracle.clone());
    let feature = FeatureArtifact::new("F-KR-1", "Dark theme test", KOREA_AB_TEST);

    let decision = pipeline.classify(&feature).await.unwrap();

    assert_eq!(decision.decision, DecisionLabel::No);
    assert!(decision.confidence > 0.9);
    assert!(decision.evidence.is_empty());
    assert!(decision.reasoning_summary.contains("A/B test"));
    assert!(oracle.requests().is_empty());

    let records = audit.records().unwrap();
    assert!(records[0].trail.router.as_ref().unwrap().short_circuit);
}

#[tokio::test]
async fn region_exclusion_without_rationale_needs_review() {
    let oracle = Arc::new(ScriptedOracle::new().repeating());
    oracle
        .reply(
            Stage::Detector,
            json!({
                "label": "BUSINESS",
                "reason": "No law is cited.",
                "feature_spans": ["available in all regions except Korea"]
            }),
        )
        .reply(
            Stage::PolicyMapper,
            json!({
                "framing": "BUSINESS",
                "control_type": [],
                "regulations": [],
                "reg_snippets": [],
                "reason": "No section was retrieved."
            }),
        )
        .reply(
            Stage::Arbiter,
            json!({
                "decision": "NO",
                "confidence": 0.7,
                "reasoning_summary": "Looks like a market decision.",
                "feature_spans": ["available in all regions except Korea"],
                "reg_snippets": [],
                "regulations": [],
                "control_type": []
            }),
        );
    let (pipeline, _) = pipeline(oracle);
    let feature = FeatureArtifact::new("F-KR-2", "Region launch", ALL_BUT_KOREA);

    let decision = pipeline.classify(&feature).await.unwrap();

    assert_eq!(decision.decision, DecisionLabel::Review);
    assert!(decision.metadata.retrieval.reg_section_ids.is_empty());
    assert!(decision
        .reasoning_summary
        .contains("no regulation section matched"));
}

#[tokio::test]
async fn review_dissent_loses_the_vote() {
    let oracle = Arc::new(ScriptedOracle::new());
    script_utah(&oracle, &[("YES", 0.9), ("REVIEW", 0.3), ("YES", 0.7)]);
    let (pipeline, audit) = pipeline(oracle);

    let decision = pipeline.classify(&utah_feature()).await.unwrap();

    assert_eq!(decision.decision, DecisionLabel::Yes);
    assert!((decision.confidence - 0.8).abs() < 1e-9);
    let vote = audit.records().unwrap()[0].trail.vote.clone().unwrap();
    assert_eq!((vote.yes, vote.review), (2, 1));
}

#[tokio::test]
async fn low_confidence_is_triaged_to_review() {
    let oracle = Arc::new(ScriptedOracle::new());
    script_utah(&oracle, &[("YES", 0.6), ("YES", 0.5), ("YES", 0.55)]);
    let (pipeline, _) = pipeline(oracle);

    let decision = pipeline.classify(&utah_feature()).await.unwrap();

    assert_eq!(decision.decision, DecisionLabel::Review);
    assert!(!decision.evidence.reg_snippets.is_empty());
    assert!(decision.reasoning_summary.contains("below the review threshold"));
}

#[tokio::test]
async fn fabricated_snippet_is_retried_then_accepted() {
    let oracle = Arc::new(ScriptedOracle::new());
    oracle.reply(Stage::Detector, utah_detector()).reply(
        Stage::PolicyMapper,
        json!({
            "framing": "LEGAL",
            "control_type": ["age_gating"],
            "regulations": ["UT-SMRA"],
            "reg_snippets": [{"section_id": CURFEW_SECTION, "quote": "between 9 p.m. and 5 a.m."}],
            "reason": "curfew"
        }),
    );
    oracle.reply(Stage::PolicyMapper, utah_mapper());
    for _ in 0..3 {
        oracle.reply(Stage::Arbiter, utah_arbiter("YES", 0.9));
    }
    let (pipeline, audit) = pipeline(oracle.clone());

    let decision = pipeline.classify(&utah_feature()).await.unwrap();

    assert_eq!(decision.decision, DecisionLabel::Yes);
    assert_eq!(oracle.calls(Stage::PolicyMapper), 2);
    let trail = &audit.records().unwrap()[0].trail;
    assert!(trail.transitions.contains(&ScanState::SchemaRetry {
        stage: Stage::PolicyMapper,
        attempt: 1
    }));
}

#[tokio::test]
async fn persistent_invalid_output_fails_and_is_audited() {
    let oracle = Arc::new(ScriptedOracle::new().repeating());
    oracle.push(
        Stage::Detector,
        ScriptStep::Raw("It is probably legal.".to_string()),
    );
    let (pipeline, audit) = pipeline(oracle.clone());

    let error = pipeline.classify(&utah_feature()).await.unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Stage(StageError::SchemaExhausted {
            stage: Stage::Detector,
            attempts: 3,
            ..
        })
    ));
    assert_eq!(oracle.calls(Stage::PolicyMapper), 0);

    let records = audit.records().unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].outcome, AuditOutcome::Failed { .. }));
    assert_eq!(records[0].trail.stages[0].attempts.len(), 3);
}

#[tokio::test]
async fn one_malformed_arbiter_sample_fails_the_scan() {
    let oracle = Arc::new(ScriptedOracle::new());
    script_utah(&oracle, &[("YES", 0.9), ("YES", 0.85)]);
    for _ in 0..3 {
        oracle.push(Stage::Arbiter, ScriptStep::Raw("YES, definitely".to_string()));
    }
    let (pipeline, audit) = pipeline(oracle.clone());

    let error = pipeline.classify(&utah_feature()).await.unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Stage(StageError::SchemaExhausted {
            stage: Stage::Arbiter,
            attempts: 3,
            ..
        })
    ));
    assert_eq!(oracle.calls(Stage::Arbiter), 5);

    let records = audit.records().unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].outcome, AuditOutcome::Failed { .. }));
    assert!(records[0].trail.vote.is_none());
}

#[tokio::test]
async fn arbiter_sample_outage_abstains_from_the_vote() {
    let oracle = Arc::new(ScriptedOracle::new());
    script_utah(&oracle, &[("YES", 0.9)]);
    oracle
        .fail(Stage::Arbiter, ScriptedFailure::Unavailable)
        .reply(Stage::Arbiter, utah_arbiter("YES", 0.7));
    let (pipeline, audit) = pipeline(oracle);

    let decision = pipeline.classify(&utah_feature()).await.unwrap();

    assert_eq!(decision.decision, DecisionLabel::Yes);
    assert!((decision.confidence - 0.8).abs() < 1e-9);
    let records = audit.records().unwrap();
    assert_eq!(records[0].trail.vote.as_ref().map(|v| v.votes.len()), Some(2));
}

#[tokio::test]
async fn arbiter_outage_degrades_keeping_detector_spans() {
    let oracle = Arc::new(ScriptedOracle::new().repeating());
    oracle
        .reply(Stage::Detector, utah_detector())
        .reply(Stage::PolicyMapper, utah_mapper())
        .fail(Stage::Arbiter, ScriptedFailure::Transport);
    let (pipeline, audit) = pipeline(oracle);

    let decision = pipeline.classify(&utah_feature()).await.unwrap();

    assert_eq!(decision.decision, DecisionLabel::Review);
    assert_eq!(decision.confidence, 0.0);
    assert!(decision.reasoning_summary.contains("Oracle unavailable"));
    assert_eq!(
        decision.evidence.feature_spans,
        vec!["curfew-based login restriction for minors".to_string()]
    );
    let records = audit.records().unwrap();
    assert_eq!(
        records[0].trail.transitions.last(),
        Some(&ScanState::Degraded)
    );
}

#[tokio::test]
async fn batch_preserves_order_and_isolates_failures() {
    let oracle = Arc::new(ScriptedOracle::new());
    let (pipeline, audit) = pipeline(oracle);
    let features = vec![
        FeatureArtifact::new("F-1", "Dark theme test", KOREA_AB_TEST),
        FeatureArtifact::new("F-2", "Blank", "   "),
        FeatureArtifact::new("F-3", "Curfew", UTAH_CURFEW),
        FeatureArtifact::new("F-4", "Dark theme again", KOREA_AB_TEST),
    ];

    let results = pipeline.classify_batch(features).await;

    assert_eq!(results.len(), 4);
    let ids: Vec<&str> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|d| d.feature_id.as_str())
        .collect();
    assert_eq!(ids, vec!["F-1", "F-2", "F-3", "F-4"]);

    // The empty script leaves F-3 without an oracle: degraded, not failed.
    let third = results[2].as_ref().unwrap();
    assert_eq!(third.decision, DecisionLabel::Review);
    assert_eq!(audit.len(), 4);
}

#[tokio::test]
async fn rescans_append_and_chain_verifies_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit").join("audit.jsonl");

    {
        let oracle = Arc::new(ScriptedOracle::new().repeating());
        script_utah(&oracle, &[("YES", 0.9)]);
        let store: Arc<dyn AuditStore> = Arc::new(JsonlAuditLog::open(&path).unwrap());
        let pipeline = pipeline_with(oracle, store);
        pipeline.classify(&utah_feature()).await.unwrap();
        pipeline.classify(&utah_feature()).await.unwrap();
    }

    let store = JsonlAuditLog::open(&path).unwrap();
    let first = store.records().unwrap();
    assert_eq!(first.len(), 2);

    let oracle = Arc::new(ScriptedOracle::new());
    let store: Arc<dyn AuditStore> = Arc::new(store);
    let pipeline = pipeline_with(oracle, store.clone());
    let feature = FeatureArtifact::new("F-KR-1", "Dark theme test", KOREA_AB_TEST);
    pipeline.classify(&feature).await.unwrap();

    let records = store.records().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(&records[..2], &first[..]);
    assert_eq!(store.by_feature("F-UT-1").unwrap().len(), 2);

    let report = store.verify().unwrap();
    assert!(report.is_intact());
    assert_eq!(report.records, 3);
}

#[tokio::test]
async fn labeled_set_is_scored_against_ground_truth() {
    let oracle = Arc::new(ScriptedOracle::new());
    script_utah(&oracle, &[("YES", 0.9), ("YES", 0.85), ("YES", 0.8)]);
    let (pipeline, audit) = pipeline(oracle);

    let labeled = vec![
        LabeledFeature {
            feature: FeatureArtifact::new("F-KR", "Dark theme test", KOREA_AB_TEST),
            ground_truth: DecisionLabel::No,
        },
        LabeledFeature {
            feature: utah_feature(),
            ground_truth: DecisionLabel::Yes,
        },
        LabeledFeature {
            feature: FeatureArtifact::new("F-BLANK", "Blank", "  "),
            ground_truth: DecisionLabel::No,
        },
    ];

    let report = pipeline.evaluate(labeled).await;

    assert_eq!(report.total, 3);
    assert_eq!(report.correct, 2);
    assert_eq!(report.failed, 0);
    assert!((report.accuracy - 2.0 / 3.0).abs() < 1e-12);
    assert_eq!(report.yes.true_positives, 1);
    assert_eq!(report.yes.f1, 1.0);
    let misses: Vec<&str> = report.misses().map(|c| c.feature_id.as_str()).collect();
    assert_eq!(misses, vec!["F-BLANK"]);
    assert_eq!(audit.len(), 3);
}

#[tokio::test]
async fn labeled_failures_count_as_misses() {
    let oracle = Arc::new(ScriptedOracle::new().repeating());
    oracle.push(Stage::Detector, ScriptStep::Raw("legal, probably".to_string()));
    let (pipeline, _audit) = pipeline(oracle);

    let input = format!(
        "{}\n",
        json!({
            "id": "F-UT-1",
            "name": "Curfew login blocker",
            "description": UTAH_CURFEW,
            "ground_truth": "YES"
        })
    );
    let labeled = parse_labeled_jsonl(&input).unwrap();

    let report = pipeline.evaluate(labeled).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.accuracy, 0.0);
    assert_eq!(report.yes.false_negatives, 1);
    assert_eq!(report.cases[0].predicted, None);
}
