//! The three-stage decision protocol.
//!
//! Defines what each oracle stage must return, how returned quotes are
//! grounded against source text, and the reconciliation rules that turn an
//! Arbiter sample into a provisional decision.
//!
//! ## Grounding
//!
//! A stage output is only accepted if every quote it makes can be found in
//! the text it was shown:
//! - feature spans in the original feature text,
//! - regulation snippets in the retrieved section they name.
//!
//! Matching tolerates whitespace differences, but accepted quotes are
//! replaced by the exact source slice, so emitted evidence is always a
//! verbatim substring.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use unicode_normalization::UnicodeNormalization;

use crate::retrieval::RegulationSection;
use crate::schema::validate_stage_output;
use crate::types::{canonical_set, ControlType, DecisionLabel, Evidence, RegSnippet, Regulation};

/// The oracle-backed stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detector,
    PolicyMapper,
    Arbiter,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Self::Detector, Self::PolicyMapper, Self::Arbiter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detector => "detector",
            Self::PolicyMapper => "policy_mapper",
            Self::Arbiter => "arbiter",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of one scan.
///
/// ```text
/// Normalized -> Routed{short_circuit: true}                      [terminal]
/// Normalized -> Routed -> Retrieved -> Detected -> PolicyMapped
///            -> Arbitrated{sample}... -> Calibrated              [terminal]
/// any stage  -> SchemaRetry{stage} -> same stage (bounded)
/// any stage  -> Failed{stage} | Degraded                         [terminal]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanState {
    Normalized,
    Routed { short_circuit: bool },
    Retrieved,
    Detected,
    PolicyMapped,
    Arbitrated { sample: usize },
    SchemaRetry { stage: Stage, attempt: u32 },
    Calibrated,
    Degraded,
    Failed { stage: Stage },
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Routed {
                short_circuit: true
            } | Self::Calibrated
                | Self::Degraded
                | Self::Failed { .. }
        )
    }
}

/// Legal-vs-business framing shared by the Detector and Policy Mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Framing {
    Legal,
    Business,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legal => "LEGAL",
            Self::Business => "BUSINESS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorOutput {
    pub label: Framing,
    pub reason: String,
    pub feature_spans: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMapperOutput {
    pub framing: Framing,
    pub control_type: Vec<ControlType>,
    pub regulations: Vec<Regulation>,
    pub reg_snippets: Vec<RegSnippet>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterOutput {
    pub decision: DecisionLabel,
    pub confidence: f64,
    pub reasoning_summary: String,
    pub feature_spans: Vec<String>,
    pub reg_snippets: Vec<RegSnippet>,
    pub regulations: Vec<Regulation>,
    pub control_type: Vec<ControlType>,
}

/// The texts a stage is allowed to quote from.
pub struct GroundingContext<'a> {
    feature_text: &'a str,
    sections: Vec<&'a RegulationSection>,
}

impl<'a> GroundingContext<'a> {
    /// `sections` must be exactly the retrieved regulation sections.
    pub fn new(feature_text: &'a str, sections: Vec<&'a RegulationSection>) -> Self {
        Self {
            feature_text,
            sections,
        }
    }

    pub fn feature_text(&self) -> &str {
        self.feature_text
    }

    pub fn sections(&self) -> &[&'a RegulationSection] {
        &self.sections
    }

    /// Regulations whose sections were retrieved.
    pub fn retrieved_regulations(&self) -> BTreeSet<Regulation> {
        self.sections.iter().map(|s| s.regulation).collect()
    }

    /// Ground feature spans, returning the exact source slices.
    pub fn ground_feature_spans(&self, spans: &[String]) -> Result<Vec<String>, Vec<String>> {
        let mut grounded = Vec::new();
        let mut violations = Vec::new();
        for span in spans {
            match anchor(self.feature_text, span) {
                Some(exact) => {
                    if !grounded.iter().any(|g: &String| g == exact) {
                        grounded.push(exact.to_string());
                    }
                }
                None => violations.push(format!(
                    "feature_spans entry \"{}\" is not a verbatim quote of the feature text",
                    truncate(span, 120)
                )),
            }
        }
        if violations.is_empty() {
            Ok(grounded)
        } else {
            Err(violations)
        }
    }

    /// Ground regulation snippets against the section each one names.
    pub fn ground_reg_snippets(
        &self,
        snippets: &[RegSnippet],
    ) -> Result<Vec<RegSnippet>, Vec<String>> {
        let mut grounded: Vec<RegSnippet> = Vec::new();
        let mut violations = Vec::new();
        for snippet in snippets {
            let Some(section) = self
                .sections
                .iter()
                .find(|s| s.section_id == snippet.section_id)
            else {
                violations.push(format!(
                    "reg_snippets cites section '{}' which was not retrieved; cite only the provided sections",
                    snippet.section_id
                ));
                continue;
            };
            match anchor(&section.text, &snippet.quote) {
                Some(exact) => {
                    let candidate = RegSnippet::new(&section.section_id, exact);
                    if !grounded.contains(&candidate) {
                        grounded.push(candidate);
                    }
                }
                None => violations.push(format!(
                    "reg_snippets quote \"{}\" does not appear verbatim in section '{}'",
                    truncate(&snippet.quote, 120),
                    snippet.section_id
                )),
            }
        }
        if violations.is_empty() {
            Ok(grounded)
        } else {
            Err(violations)
        }
    }

    /// Every cited regulation must have at least one retrieved section.
    pub fn check_regulations(&self, regulations: &[Regulation]) -> Result<(), Vec<String>> {
        let retrieved = self.retrieved_regulations();
        let violations: Vec<String> = regulations
            .iter()
            .filter(|r| !retrieved.contains(r))
            .map(|r| {
                format!(
                    "regulation {} has no retrieved section; cite only regulations of the provided sections",
                    r
                )
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Locate `needle` in `haystack` and return the exact matching slice of
/// `haystack`.
///
/// Any whitespace run matches any other, and a precomposed character matches
/// its canonical decomposition in either direction.
pub fn anchor<'h>(haystack: &'h str, needle: &str) -> Option<&'h str> {
    if needle.trim().is_empty() {
        return None;
    }
    if let Some(pos) = haystack.find(needle) {
        return Some(&haystack[pos..pos + needle.len()]);
    }
    let composed: String = needle.nfc().collect();
    let pattern = composed
        .split_whitespace()
        .map(canonical_word_pattern)
        .collect::<Vec<_>>()
        .join(r"\s+");
    let re = Regex::new(&pattern).ok()?;
    re.find(haystack).map(|m| m.as_str())
}

fn canonical_word_pattern(word: &str) -> String {
    let mut pattern = String::with_capacity(word.len());
    for c in word.chars() {
        let single = c.to_string();
        let decomposed: String = single.nfd().collect();
        if decomposed == single {
            pattern.push_str(&regex::escape(&single));
        } else {
            pattern.push_str(&format!(
                "(?:{}|{})",
                regex::escape(&single),
                regex::escape(&decomposed)
            ));
        }
    }
    pattern
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

/// A structured stage output that can be schema-checked and grounded.
pub trait StageOutput: DeserializeOwned + Serialize + Send + 'static {
    const STAGE: Stage;

    /// Check and rewrite quotes against the grounding context.
    fn ground(self, ctx: &GroundingContext<'_>) -> Result<Self, Vec<String>>;
}

impl StageOutput for DetectorOutput {
    const STAGE: Stage = Stage::Detector;

    fn ground(mut self, ctx: &GroundingContext<'_>) -> Result<Self, Vec<String>> {
        self.feature_spans = ctx.ground_feature_spans(&self.feature_spans)?;
        Ok(self)
    }
}

impl StageOutput for PolicyMapperOutput {
    const STAGE: Stage = Stage::PolicyMapper;

    fn ground(mut self, ctx: &GroundingContext<'_>) -> Result<Self, Vec<String>> {
        let mut violations = Vec::new();
        match ctx.ground_reg_snippets(&self.reg_snippets) {
            Ok(snippets) => self.reg_snippets = snippets,
            Err(v) => violations.extend(v),
        }
        if let Err(v) = ctx.check_regulations(&self.regulations) {
            violations.extend(v);
        }
        if !violations.is_empty() {
            return Err(violations);
        }
        self.regulations = canonical_set(self.regulations);
        self.control_type = canonical_set(self.control_type);
        Ok(self)
    }
}

impl StageOutput for ArbiterOutput {
    const STAGE: Stage = Stage::Arbiter;

    fn ground(mut self, ctx: &GroundingContext<'_>) -> Result<Self, Vec<String>> {
        let mut violations = Vec::new();
        match ctx.ground_feature_spans(&self.feature_spans) {
            Ok(spans) => self.feature_spans = spans,
            Err(v) => violations.extend(v),
        }
        match ctx.ground_reg_snippets(&self.reg_snippets) {
            Ok(snippets) => self.reg_snippets = snippets,
            Err(v) => violations.extend(v),
        }
        if let Err(v) = ctx.check_regulations(&self.regulations) {
            violations.extend(v);
        }
        if !violations.is_empty() {
            return Err(violations);
        }
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.regulations = canonical_set(self.regulations);
        self.control_type = canonical_set(self.control_type);
        Ok(self)
    }
}

/// Validate a raw oracle value as a `T`: schema first, then grounding.
pub fn accept<T: StageOutput>(
    value: &serde_json::Value,
    ctx: &GroundingContext<'_>,
) -> Result<T, Vec<String>> {
    validate_stage_output(T::STAGE, value)?;
    let parsed: T = serde_json::from_value(value.clone())
        .map_err(|e| vec![format!("output does not match the {} shape: {}", T::STAGE, e)])?;
    parsed.ground(ctx)
}

/// Why reconciliation forced a `REVIEW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    FramingDisagreement,
    LegalWithoutSnippets,
    NoGeoAndNoSnippets,
    NoRegulationMatch,
    YesWithoutSnippet,
}

impl ReviewReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::FramingDisagreement => {
                "detector and policy mapper disagree on legal versus business framing"
            }
            Self::LegalWithoutSnippets => {
                "detector found legal framing but no supporting regulation snippet was found"
            }
            Self::NoGeoAndNoSnippets => {
                "no geographic entity was tagged and no regulation snippet matches"
            }
            Self::NoRegulationMatch => "no regulation section matched the feature",
            Self::YesWithoutSnippet => "a YES decision cited no regulation snippet",
        }
    }
}

/// Signals from upstream components that reconciliation depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSignals {
    pub geo_tagged: bool,
    pub regulation_hits: usize,
}

/// One reconciled Arbiter sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provisional {
    pub decision: DecisionLabel,
    pub confidence: f64,
    pub reasoning_summary: String,
    pub evidence: Evidence,
    pub regulations: Vec<Regulation>,
    pub control_type: Vec<ControlType>,
    pub forced_review: Vec<ReviewReason>,
}

/// Apply the reconciliation rules to a grounded Arbiter sample.
///
/// The Arbiter's own label stands unless a rule forces `REVIEW`. A forced
/// review keeps the sample's confidence, evidence and reasoning, with the
/// reasons appended.
pub fn reconcile(
    detector: &DetectorOutput,
    mapper: &PolicyMapperOutput,
    arbiter: ArbiterOutput,
    signals: ReconcileSignals,
) -> Provisional {
    let mut forced = Vec::new();
    if detector.label != mapper.framing {
        forced.push(ReviewReason::FramingDisagreement);
    }
    if detector.label == Framing::Legal && mapper.reg_snippets.is_empty() {
        forced.push(ReviewReason::LegalWithoutSnippets);
    }
    if !signals.geo_tagged && arbiter.reg_snippets.is_empty() {
        forced.push(ReviewReason::NoGeoAndNoSnippets);
    }
    if signals.regulation_hits == 0 {
        forced.push(ReviewReason::NoRegulationMatch);
    }
    if arbiter.decision == DecisionLabel::Yes && arbiter.reg_snippets.is_empty() {
        forced.push(ReviewReason::YesWithoutSnippet);
    }

    let mut reasoning = arbiter.reasoning_summary.trim().to_string();
    let decision = if forced.is_empty() {
        arbiter.decision
    } else {
        let reasons: Vec<&str> = forced.iter().map(ReviewReason::describe).collect();
        if !reasoning.is_empty() {
            reasoning.push(' ');
        }
        reasoning.push_str(&format!("Needs review: {}.", reasons.join("; ")));
        DecisionLabel::Review
    };

    Provisional {
        decision,
        confidence: arbiter.confidence,
        reasoning_summary: reasoning,
        evidence: Evidence {
            feature_spans: arbiter.feature_spans,
            reg_snippets: arbiter.reg_snippets,
        },
        regulations: arbiter.regulations,
        control_type: arbiter.control_type,
        forced_review: forced,
    }
}
