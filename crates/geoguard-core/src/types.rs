//! Core types for GeoGuard decisions.
//!
//! These types define the externally visible decision shape. Enumerations
//! are closed: a `Regulation` or `ControlType` outside the fixed sets cannot
//! be represented, so subset invariants hold by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version of the decision pipeline, stamped into every decision.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The three externally visible outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionLabel {
    /// Feature needs geo-specific compliance logic
    Yes,
    /// Feature does not need geo-specific compliance logic
    No,
    /// Needs human review
    Review,
}

impl DecisionLabel {
    pub const ALL: [DecisionLabel; 3] = [Self::Yes, Self::No, Self::Review];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
            Self::Review => "REVIEW",
        }
    }
}

impl fmt::Display for DecisionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionLabel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownVariant::new("decision", s))
    }
}

/// The fixed set of regulations GeoGuard can cite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Regulation {
    /// EU Digital Services Act
    #[serde(rename = "DSA")]
    Dsa,
    /// California SB976 (Protecting Our Kids from Social Media Addiction Act)
    #[serde(rename = "CA-SB976")]
    CaSb976,
    /// Florida HB3 (Online Protections for Minors)
    #[serde(rename = "FL-Minors")]
    FlMinors,
    /// Utah Social Media Regulation Act
    #[serde(rename = "UT-SMRA")]
    UtSmra,
    /// US federal reporting to NCMEC (18 U.S.C. 2258A)
    #[serde(rename = "US-NCMEC")]
    UsNcmec,
}

impl Regulation {
    pub const ALL: [Regulation; 5] = [
        Self::Dsa,
        Self::CaSb976,
        Self::FlMinors,
        Self::UtSmra,
        Self::UsNcmec,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dsa => "DSA",
            Self::CaSb976 => "CA-SB976",
            Self::FlMinors => "FL-Minors",
            Self::UtSmra => "UT-SMRA",
            Self::UsNcmec => "US-NCMEC",
        }
    }
}

impl fmt::Display for Regulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Regulation {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reg| reg.as_str() == s.trim())
            .ok_or_else(|| UnknownVariant::new("regulation", s))
    }
}

/// Kinds of compliance control a feature may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    AgeGating,
    ParentalConsent,
    Reporting,
    ContentRestriction,
    DataLocalization,
    DataRetention,
    NoticeAndAction,
    DeliveryConstraints,
}

impl ControlType {
    pub const ALL: [ControlType; 8] = [
        Self::AgeGating,
        Self::ParentalConsent,
        Self::Reporting,
        Self::ContentRestriction,
        Self::DataLocalization,
        Self::DataRetention,
        Self::NoticeAndAction,
        Self::DeliveryConstraints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgeGating => "age_gating",
            Self::ParentalConsent => "parental_consent",
            Self::Reporting => "reporting",
            Self::ContentRestriction => "content_restriction",
            Self::DataLocalization => "data_localization",
            Self::DataRetention => "data_retention",
            Self::NoticeAndAction => "notice_and_action",
            Self::DeliveryConstraints => "delivery_constraints",
        }
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ct| ct.as_str() == s.trim())
            .ok_or_else(|| UnknownVariant::new("control_type", s))
    }
}

/// A string did not name a member of a closed enumeration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A verbatim quote from a retrieved regulation section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegSnippet {
    /// Stable section id, e.g. `ut-smra:13-63-105`
    pub section_id: String,

    /// Exact text from that section
    pub quote: String,
}

impl RegSnippet {
    pub fn new(section_id: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            section_id: section_id.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for RegSnippet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.section_id, self.quote)
    }
}

/// Evidence attached to a decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Verbatim substrings of the feature text
    #[serde(default)]
    pub feature_spans: Vec<String>,

    /// Verbatim substrings of retrieved regulation sections
    #[serde(default)]
    pub reg_snippets: Vec<RegSnippet>,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.feature_spans.is_empty() && self.reg_snippets.is_empty()
    }
}

/// Ids of the passages retrieved for a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalIds {
    pub feature_clause_ids: Vec<String>,
    pub reg_section_ids: Vec<String>,
}

/// Versions and timestamp of the run that produced a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub pipeline_version: String,
    pub prompt_version: String,
    pub index_version: String,
    pub router_model_version: String,
    pub timestamp_utc: DateTime<Utc>,
}

impl RuntimeInfo {
    /// Stamp the current pipeline version and time.
    pub fn now(
        prompt_version: impl Into<String>,
        index_version: impl Into<String>,
        router_model_version: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_version: PIPELINE_VERSION.to_string(),
            prompt_version: prompt_version.into(),
            index_version: index_version.into(),
            router_model_version: router_model_version.into(),
            timestamp_utc: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMetadata {
    pub retrieval: RetrievalIds,
    pub runtime: RuntimeInfo,
}

/// The externally visible result of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub feature_id: String,
    pub decision: DecisionLabel,
    pub confidence: f64,
    pub reasoning_summary: String,
    pub evidence: Evidence,
    pub regulations: Vec<Regulation>,
    pub control_type: Vec<ControlType>,
    pub metadata: DecisionMetadata,
}

/// A decision that breaks a structural invariant.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecisionError {
    #[error("Confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("YES decision for '{0}' carries no regulation snippet")]
    YesWithoutSnippet(String),

    #[error("Empty evidence string in {0}")]
    EmptyEvidence(&'static str),

    #[error("Duplicate {0} entries")]
    Duplicate(&'static str),
}

impl Decision {
    /// Check the structural invariants every emitted decision must hold.
    ///
    /// Grounding of quotes against source text is checked separately by
    /// [`crate::protocol::GroundingContext`], which owns the texts.
    pub fn check_invariants(&self) -> Result<(), DecisionError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(DecisionError::ConfidenceOutOfRange(self.confidence));
        }
        if self.decision == DecisionLabel::Yes && self.evidence.reg_snippets.is_empty() {
            return Err(DecisionError::YesWithoutSnippet(self.feature_id.clone()));
        }
        if self.evidence.feature_spans.iter().any(|s| s.trim().is_empty()) {
            return Err(DecisionError::EmptyEvidence("feature_spans"));
        }
        if self
            .evidence
            .reg_snippets
            .iter()
            .any(|s| s.quote.trim().is_empty())
        {
            return Err(DecisionError::EmptyEvidence("reg_snippets"));
        }
        if has_duplicates(&self.regulations) {
            return Err(DecisionError::Duplicate("regulations"));
        }
        if has_duplicates(&self.control_type) {
            return Err(DecisionError::Duplicate("control_type"));
        }
        Ok(())
    }
}

fn has_duplicates<T: Ord + Clone>(items: &[T]) -> bool {
    let mut sorted = items.to_vec();
    sorted.sort();
    sorted.windows(2).any(|w| w[0] == w[1])
}

/// Sort and deduplicate an enumeration list.
pub fn canonical_set<T: Ord + Copy>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = items.into_iter().collect();
    out.sort();
    out.dedup();
    out
}
