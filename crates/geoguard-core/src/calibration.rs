//! Calibrator: merges Arbiter samples into one decision.
//!
//! Rules, applied in order:
//! 1. Plurality vote over labels. A tie for first place yields `REVIEW`.
//! 2. Confidence is the mean over the votes agreeing with the result, or
//!    over all votes when none agree.
//! 3. The configured recalibration curve maps that mean to the final
//!    confidence.
//! 4. A final confidence below the review threshold forces `REVIEW`.
//!
//! This is the only place a decision's confidence is finalized.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::protocol::Provisional;
use crate::types::DecisionLabel;

/// One Arbiter sample's vote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub label: DecisionLabel,
    pub confidence: f64,
}

/// Explicit vote counts and the label they resolve to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub votes: Vec<Vote>,
    pub yes: usize,
    pub no: usize,
    pub review: usize,
    pub winner: DecisionLabel,
    pub tied: bool,
    /// Mean confidence before recalibration
    pub mean_confidence: f64,
}

impl VoteTally {
    pub fn count(&self, label: DecisionLabel) -> usize {
        match label {
            DecisionLabel::Yes => self.yes,
            DecisionLabel::No => self.no,
            DecisionLabel::Review => self.review,
        }
    }

    /// Count votes. Returns `None` when there are no votes.
    pub fn from_votes(votes: Vec<Vote>) -> Option<Self> {
        if votes.is_empty() {
            return None;
        }

        let count = |label| votes.iter().filter(|v| v.label == label).count();
        let (yes, no, review) = (
            count(DecisionLabel::Yes),
            count(DecisionLabel::No),
            count(DecisionLabel::Review),
        );

        let top = yes.max(no).max(review);
        let leaders: Vec<DecisionLabel> = DecisionLabel::ALL
            .into_iter()
            .filter(|l| match l {
                DecisionLabel::Yes => yes == top,
                DecisionLabel::No => no == top,
                DecisionLabel::Review => review == top,
            })
            .collect();
        let tied = leaders.len() > 1;
        let winner = if tied {
            DecisionLabel::Review
        } else {
            leaders[0]
        };

        let agreeing: Vec<f64> = votes
            .iter()
            .filter(|v| v.label == winner)
            .map(|v| v.confidence)
            .collect();
        let mean_confidence = if agreeing.is_empty() {
            mean(votes.iter().map(|v| v.confidence))
        } else {
            mean(agreeing.into_iter())
        };

        Some(Self {
            votes,
            yes,
            no,
            review,
            winner,
            tied,
            mean_confidence,
        })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Monotone map from raw to calibrated confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recalibration {
    Identity,
    /// `sigmoid(a * logit(p) + b)`
    Platt { a: f64, b: f64 },
    /// Linear interpolation between `[x, y]` points
    Piecewise { points: Vec<[f64; 2]> },
}

impl Default for Recalibration {
    fn default() -> Self {
        Self::Platt { a: 1.0, b: 0.0 }
    }
}

const LOGIT_EPSILON: f64 = 1e-6;

impl Recalibration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Identity => Ok(()),
            Self::Platt { a, b } => {
                if !a.is_finite() || !b.is_finite() || *a <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "platt recalibration needs finite a > 0, got a={} b={}",
                        a, b
                    )));
                }
                Ok(())
            }
            Self::Piecewise { points } => {
                if points.len() < 2 {
                    return Err(ConfigError::Invalid(
                        "piecewise recalibration needs at least two points".to_string(),
                    ));
                }
                for [x, y] in points {
                    if !(0.0..=1.0).contains(x) || !(0.0..=1.0).contains(y) {
                        return Err(ConfigError::Invalid(format!(
                            "piecewise point [{}, {}] is outside the unit square",
                            x, y
                        )));
                    }
                }
                for pair in points.windows(2) {
                    if pair[1][0] <= pair[0][0] || pair[1][1] < pair[0][1] {
                        return Err(ConfigError::Invalid(
                            "piecewise points must have increasing x and non-decreasing y"
                                .to_string(),
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    /// Map `p` through the curve. Output is always within [0, 1].
    pub fn apply(&self, p: f64) -> f64 {
        let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        let out = match self {
            Self::Identity => p,
            Self::Platt { a, b } => {
                let q = p.clamp(LOGIT_EPSILON, 1.0 - LOGIT_EPSILON);
                let logit = (q / (1.0 - q)).ln();
                1.0 / (1.0 + (-(a * logit + b)).exp())
            }
            Self::Piecewise { points } => interpolate(points, p),
        };
        out.clamp(0.0, 1.0)
    }
}

fn interpolate(points: &[[f64; 2]], p: f64) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return p;
    };
    if p <= first[0] {
        return first[1];
    }
    if p >= last[0] {
        return last[1];
    }
    for pair in points.windows(2) {
        let ([x0, y0], [x1, y1]) = (pair[0], pair[1]);
        if p <= x1 {
            let t = (p - x0) / (x1 - x0);
            return y0 + t * (y1 - y0);
        }
    }
    last[1]
}

/// Calibrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Arbiter samples per scan
    pub samples: usize,
    /// Sampling temperature for Arbiter calls
    pub temperature: f64,
    /// Final confidence below this forces REVIEW
    pub review_threshold: f64,
    pub recalibration: Recalibration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            samples: 3,
            temperature: 0.2,
            review_threshold: 0.65,
            recalibration: Recalibration::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.samples == 0 {
            return Err(ConfigError::Invalid(
                "calibration.samples must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "calibration.temperature {} is outside [0, 2]",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.review_threshold) {
            return Err(ConfigError::Invalid(format!(
                "calibration.review_threshold {} is outside [0, 1]",
                self.review_threshold
            )));
        }
        self.recalibration.validate()
    }
}

/// The merged result of all Arbiter samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibrated {
    /// Representative sample with final label and confidence applied
    pub result: Provisional,
    pub tally: VoteTally,
    /// True when low confidence forced REVIEW
    pub triaged: bool,
}

/// Merge reconciled samples into one decision.
///
/// Evidence and reasoning come from the first sample agreeing with the
/// vote, or the first sample when none agree. Returns `None` for an empty
/// sample set.
pub fn finalize(samples: Vec<Provisional>, config: &CalibrationConfig) -> Option<Calibrated> {
    let votes = samples
        .iter()
        .map(|s| Vote {
            label: s.decision,
            confidence: s.confidence,
        })
        .collect();
    let tally = VoteTally::from_votes(votes)?;

    let representative = samples
        .iter()
        .position(|s| s.decision == tally.winner)
        .unwrap_or(0);
    let mut result = samples.into_iter().nth(representative)?;

    let confidence = config.recalibration.apply(tally.mean_confidence);
    result.decision = tally.winner;
    result.confidence = confidence;

    let mut notes = Vec::new();
    if tally.tied {
        notes.push(format!(
            "Arbiter samples split (YES {}, NO {}, REVIEW {}).",
            tally.yes, tally.no, tally.review
        ));
    }

    let triaged = confidence < config.review_threshold && result.decision != DecisionLabel::Review;
    if triaged {
        notes.push(format!(
            "Confidence {:.2} is below the review threshold {:.2}.",
            confidence, config.review_threshold
        ));
        result.decision = DecisionLabel::Review;
    }

    for note in notes {
        if !result.reasoning_summary.is_empty() {
            result.reasoning_summary.push(' ');
        }
        result.reasoning_summary.push_str(&note);
    }

    tracing::debug!(
        winner = %tally.winner,
        yes = tally.yes,
        no = tally.no,
        review = tally.review,
        mean = tally.mean_confidence,
        confidence,
        triaged,
        "Calibrated arbiter samples"
    );

    Some(Calibrated {
        result,
        tally,
        triaged,
    })
}
