//! Scoring decisions against labeled features.
//!
//! A labeled set is a list of feature artifacts, each with a
//! `ground_truth` label. The report gives overall accuracy and
//! precision, recall and F1 for the `YES` class. A feature that failed to
//! classify counts as a miss: wrong for accuracy, and a false negative when
//! its label is `YES`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feature::FeatureArtifact;
use crate::types::DecisionLabel;

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("labeled set is empty")]
    Empty,
}

/// A feature artifact with its expected decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledFeature {
    #[serde(flatten)]
    pub feature: FeatureArtifact,
    pub ground_truth: DecisionLabel,
}

/// Parse one labeled feature per line. Blank lines are skipped.
pub fn parse_labeled_jsonl(input: &str) -> Result<Vec<LabeledFeature>, EvaluationError> {
    let labeled = input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|source| EvaluationError::Line {
                line: index + 1,
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if labeled.is_empty() {
        return Err(EvaluationError::Empty);
    }
    Ok(labeled)
}

/// One scored feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub feature_id: String,
    pub expected: DecisionLabel,
    /// `None` when classification failed
    pub predicted: Option<DecisionLabel>,
}

impl CaseResult {
    pub fn is_correct(&self) -> bool {
        self.predicted == Some(self.expected)
    }
}

/// Precision, recall and F1 for one label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl ClassMetrics {
    /// Zero when a ratio has no denominator.
    pub fn for_label(cases: &[CaseResult], label: DecisionLabel) -> Self {
        let mut tp = 0;
        let mut fp = 0;
        let mut fn_ = 0;
        for case in cases {
            let predicted = case.predicted == Some(label);
            match (case.expected == label, predicted) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                (false, false) => {}
            }
        }

        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
            precision,
            recall,
            f1,
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Accuracy and `YES`-class metrics over a labeled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub total: usize,
    pub correct: usize,
    pub failed: usize,
    pub accuracy: f64,
    pub yes: ClassMetrics,
    pub cases: Vec<CaseResult>,
}

impl EvaluationReport {
    pub fn from_cases(cases: Vec<CaseResult>) -> Self {
        let correct = cases.iter().filter(|c| c.is_correct()).count();
        let failed = cases.iter().filter(|c| c.predicted.is_none()).count();
        Self {
            total: cases.len(),
            correct,
            failed,
            accuracy: ratio(correct, cases.len()),
            yes: ClassMetrics::for_label(&cases, DecisionLabel::Yes),
            cases,
        }
    }

    /// Cases whose prediction differs from the label.
    pub fn misses(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases.iter().filter(|c| !c.is_correct())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn case(id: &str, expected: DecisionLabel, predicted: Option<DecisionLabel>) -> CaseResult {
        CaseResult {
            feature_id: id.to_string(),
            expected,
            predicted,
        }
    }

    #[test]
    fn test_parse_flattens_feature_fields() {
        let input = r#"
{"id": "F-1", "name": "Curfew", "description": "Utah minors curfew.", "ground_truth": "YES"}

{"id": "F-2", "name": "Theme", "description": "Dark theme A/B.", "prd": "Korea only.", "ground_truth": "NO"}
"#;
        let labeled = parse_labeled_jsonl(input).unwrap();
        assert_eq!(labeled.len(), 2);
        assert_eq!(labeled[0].feature.id, "F-1");
        assert_eq!(labeled[0].ground_truth, DecisionLabel::Yes);
        assert_eq!(labeled[1].feature.prd.as_deref(), Some("Korea only."));
    }

    #[test]
    fn test_parse_reports_line_number() {
        let input = "{\"id\": \"F-1\", \"name\": \"A\", \"ground_truth\": \"YES\"}\n\
                     {\"id\": \"F-2\", \"name\": \"B\", \"ground_truth\": \"MAYBE\"}\n";
        match parse_labeled_jsonl(input) {
            Err(EvaluationError::Line { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected a line error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_empty_set() {
        assert!(matches!(
            parse_labeled_jsonl("\n  \n"),
            Err(EvaluationError::Empty)
        ));
    }

    #[test]
    fn test_report_metrics() {
        use DecisionLabel::*;
        let report = EvaluationReport::from_cases(vec![
            case("F-1", Yes, Some(Yes)),
            case("F-2", Yes, Some(Review)),
            case("F-3", No, Some(Yes)),
            case("F-4", No, Some(No)),
            case("F-5", Review, Some(Review)),
        ]);

        assert_eq!(report.total, 5);
        assert_eq!(report.correct, 3);
        assert!((report.accuracy - 0.6).abs() < 1e-12);
        assert_eq!(report.yes.true_positives, 1);
        assert_eq!(report.yes.false_positives, 1);
        assert_eq!(report.yes.false_negatives, 1);
        assert!((report.yes.precision - 0.5).abs() < 1e-12);
        assert!((report.yes.recall - 0.5).abs() < 1e-12);
        assert!((report.yes.f1 - 0.5).abs() < 1e-12);

        let misses: Vec<&str> = report.misses().map(|c| c.feature_id.as_str()).collect();
        assert_eq!(misses, vec!["F-2", "F-3"]);
    }

    #[test]
    fn test_failed_case_is_a_miss() {
        let report = EvaluationReport::from_cases(vec![
            case("F-1", DecisionLabel::Yes, None),
            case("F-2", DecisionLabel::No, Some(DecisionLabel::No)),
        ]);
        assert_eq!(report.failed, 1);
        assert_eq!(report.correct, 1);
        assert_eq!(report.yes.false_negatives, 1);
        assert_eq!(report.yes.f1, 0.0);
    }

    #[test]
    fn test_no_yes_predictions_gives_zero_not_nan() {
        let report = EvaluationReport::from_cases(vec![case(
            "F-1",
            DecisionLabel::No,
            Some(DecisionLabel::No),
        )]);
        assert_eq!(report.yes.precision, 0.0);
        assert_eq!(report.yes.recall, 0.0);
        assert_eq!(report.accuracy, 1.0);
    }

    fn label() -> impl Strategy<Value = DecisionLabel> {
        prop_oneof![
            Just(DecisionLabel::Yes),
            Just(DecisionLabel::No),
            Just(DecisionLabel::Review),
        ]
    }

    proptest! {
        #[test]
        fn prop_metrics_stay_in_unit_interval(
            pairs in prop::collection::vec((label(), prop::option::of(label())), 0..40)
        ) {
            let cases: Vec<CaseResult> = pairs
                .into_iter()
                .enumerate()
                .map(|(i, (expected, predicted))| case(&format!("F-{i}"), expected, predicted))
                .collect();
            let report = EvaluationReport::from_cases(cases);

            for value in [report.accuracy, report.yes.precision, report.yes.recall, report.yes.f1] {
                prop_assert!((0.0..=1.0).contains(&value));
            }
            prop_assert!(report.yes.f1 <= report.yes.precision.max(report.yes.recall) + 1e-12);
            prop_assert_eq!(report.correct + report.misses().count(), report.total);
        }
    }
}
