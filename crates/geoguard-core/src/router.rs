//! Short-circuit router.
//!
//! A logistic model over distinct lowercase tokens and phrase cues scores
//! how likely a feature is a business-driven geofence. When that
//! probability clears the threshold and no legal cue is present, the
//! feature is decided `NO` without calling the oracle. The router never
//! emits `YES` or `REVIEW`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::normalizer::NormalizedFeature;
use crate::reference::ReferenceError;

/// Default business-geofence probability above which the router may
/// short-circuit.
pub const DEFAULT_THRESHOLD: f64 = 0.80;

/// Trained logistic model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterModel {
    pub version: String,
    pub bias: f64,
    /// Added once per matched legal cue
    pub positive_cue_weight: f64,
    /// Added once per matched business cue
    pub negative_cue_weight: f64,
    #[serde(default)]
    pub token_weights: BTreeMap<String, f64>,
}

impl RouterModel {
    pub fn from_json(json: &str) -> Result<Self, ReferenceError> {
        let model: Self = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ReferenceError> {
        let finite = self.bias.is_finite()
            && self.positive_cue_weight.is_finite()
            && self.negative_cue_weight.is_finite()
            && self.token_weights.values().all(|w| w.is_finite());
        if !finite {
            return Err(ReferenceError::Invalid(format!(
                "router model '{}' has non-finite weights",
                self.version
            )));
        }
        Ok(())
    }
}

/// Legal and business phrase lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CueLists {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

impl CueLists {
    pub fn from_yaml(yaml: &str) -> Result<Self, ReferenceError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[derive(Debug, Clone)]
struct Cue {
    phrase: String,
    pattern: Regex,
}

impl Cue {
    fn compile(phrase: &str) -> Result<Self, ReferenceError> {
        // `\b` only applies next to word characters, so cues such as
        // "A/B test" still anchor on their alphanumeric ends.
        let escaped = regex::escape(phrase.trim());
        let lead = if phrase.trim().starts_with(|c: char| c.is_alphanumeric()) {
            r"\b"
        } else {
            ""
        };
        let tail = if phrase.trim().ends_with(|c: char| c.is_alphanumeric()) {
            r"\b"
        } else {
            ""
        };
        Ok(Self {
            phrase: phrase.trim().to_string(),
            pattern: Regex::new(&format!("(?i){}{}{}", lead, escaped, tail))?,
        })
    }
}

/// What the router saw and decided for one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterVerdict {
    /// Business-geofence probability from the model
    pub probability: f64,
    pub threshold: f64,
    pub positive_cues: Vec<String>,
    pub negative_cues: Vec<String>,
    pub short_circuit: bool,
    pub model_version: String,
}

impl RouterVerdict {
    /// Reasoning text for a short-circuit `NO`.
    pub fn reasoning(&self) -> String {
        let cues = if self.negative_cues.is_empty() {
            "no explicit business cue".to_string()
        } else {
            format!("business cues: {}", self.negative_cues.join(", "))
        };
        format!(
            "Router short-circuit: business-geofence probability {:.2} exceeds {:.2} with no legal cue present ({}).",
            self.probability, self.threshold, cues
        )
    }
}

pub struct Router {
    model: RouterModel,
    positive: Vec<Cue>,
    negative: Vec<Cue>,
    threshold: f64,
}

impl Router {
    pub fn new(model: RouterModel, cues: &CueLists, threshold: f64) -> Result<Self, ReferenceError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ReferenceError::Invalid(format!(
                "router threshold {} is outside [0, 1]",
                threshold
            )));
        }
        let positive = cues
            .positive
            .iter()
            .map(|p| Cue::compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let negative = cues
            .negative
            .iter()
            .map(|p| Cue::compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            model,
            positive,
            negative,
            threshold,
        })
    }

    pub fn model_version(&self) -> &str {
        &self.model.version
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score a normalized feature.
    ///
    /// Cues are matched against both the expanded clause text and the
    /// original quotes, so a cue written with an abbreviation still
    /// matches after glossary expansion.
    pub fn route(&self, feature: &NormalizedFeature) -> RouterVerdict {
        let expanded = feature.joined_text();
        let original = feature.joined_quotes();
        let matches = |cues: &[Cue]| -> Vec<String> {
            cues.iter()
                .filter(|c| c.pattern.is_match(&expanded) || c.pattern.is_match(&original))
                .map(|c| c.phrase.clone())
                .collect()
        };
        let positive_cues = matches(&self.positive);
        let negative_cues = matches(&self.negative);

        let mut z = self.model.bias;
        z += self.model.positive_cue_weight * positive_cues.len() as f64;
        z += self.model.negative_cue_weight * negative_cues.len() as f64;
        for token in tokens(&expanded) {
            if let Some(w) = self.model.token_weights.get(&token) {
                z += w;
            }
        }
        let probability = sigmoid(z);
        let short_circuit =
            !feature.is_empty() && probability > self.threshold && positive_cues.is_empty();

        tracing::debug!(
            feature_id = %feature.feature_id,
            probability,
            short_circuit,
            positive = ?positive_cues,
            negative = ?negative_cues,
            "Router scored feature"
        );

        RouterVerdict {
            probability,
            threshold: self.threshold,
            positive_cues,
            negative_cues,
            short_circuit,
            model_version: self.model.version.clone(),
        }
    }
}

/// Distinct lowercase alphanumeric tokens. `A/B` collapses to `ab`.
fn tokens(text: &str) -> BTreeSet<String> {
    let lowered = text.to_lowercase().replace("a/b", "ab");
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceData;
    use proptest::prelude::*;

    fn route(text: &str) -> RouterVerdict {
        let reference = ReferenceData::embedded().unwrap();
        let normalized = reference.normalizer.normalize("F-t", text);
        reference.router.route(&normalized)
    }

    #[test]
    fn test_ab_test_short_circuits() {
        let verdict = route(
            "A/B test dark theme accessibility for users in South Korea. \
             Rollout is limited via GH and monitored with FR flags.",
        );
        assert!(verdict.short_circuit);
        assert!(verdict.probability > 0.9);
        assert_eq!(verdict.negative_cues, vec!["A/B test".to_string()]);
        assert!(verdict.positive_cues.is_empty());
        assert!(verdict.reasoning().contains("A/B test"));
    }

    #[test]
    fn test_legal_cue_blocks_short_circuit() {
        let verdict = route("A/B test the login curfew for minors in Utah.");
        assert!(!verdict.short_circuit);
        assert_eq!(verdict.positive_cues, vec!["minors".to_string()]);
    }

    #[test]
    fn test_legal_text_forwarded() {
        let verdict = route(
            "To comply with the Utah Social Media Regulation Act, we implement a \
             curfew-based login restriction for minors.",
        );
        assert!(!verdict.short_circuit);
        assert!(verdict.probability < 0.1);
    }

    #[test]
    fn test_ambiguous_text_forwarded() {
        let verdict = route("Feature is available in all regions except Korea; no legal rationale stated.");
        assert!(!verdict.short_circuit);
    }

    #[test]
    fn test_empty_feature_never_short_circuits() {
        let verdict = route("");
        assert!(!verdict.short_circuit);
    }

    #[test]
    fn test_cue_matches_original_abbreviation() {
        // "mood-based PF" only appears before glossary expansion.
        let verdict = route("Launch mood-based PF for all users.");
        assert!(verdict.negative_cues.contains(&"mood-based PF".to_string()));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let model = RouterModel::from_json(crate::reference::ROUTER_MODEL_JSON).unwrap();
        assert!(Router::new(model, &CueLists::default(), 1.5).is_err());
    }

    #[test]
    fn test_tokens_distinct_and_lowercase() {
        let t = tokens("Test TEST A/B test-run");
        assert_eq!(
            t.into_iter().collect::<Vec<_>>(),
            vec!["ab".to_string(), "run".to_string(), "test".to_string()]
        );
    }

    proptest! {
        #[test]
        fn prop_route_is_deterministic(text in "[a-zA-Z /.]{0,80}") {
            let reference = ReferenceData::embedded().unwrap();
            let normalized = reference.normalizer.normalize("F-p", &text);
            let a = reference.router.route(&normalized);
            let b = reference.router.route(&normalized);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_probability_in_unit_interval(text in "\\PC{0,80}") {
            let verdict = route(&text);
            prop_assert!((0.0..=1.0).contains(&verdict.probability));
        }
    }
}
