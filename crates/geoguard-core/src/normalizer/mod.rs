//! Feature text normalization.
//!
//! Turns raw feature text into ordered clauses: markup is stripped, unicode
//! folded, text split into sentence-level clauses, glossary terms expanded
//! and geographic entities tagged. Pure and deterministic.
//!
//! Each clause keeps the byte span of the raw text it came from, so
//! anything quoted from `Clause::quote` is a verbatim substring of the input.

mod clean;
mod geo;
mod glossary;

pub use geo::{GeoDictionary, GeoEntry};
pub use glossary::{Glossary, GlossaryTerm};

use serde::{Deserialize, Serialize};

/// Byte range into the original feature text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A sentence-level unit of a feature, used for retrieval and citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    /// `f:<feature_id>:<index>`
    pub clause_id: String,
    pub index: usize,
    /// Cleaned, whitespace-collapsed, glossary-expanded text
    pub text: String,
    /// Verbatim slice of the original text covered by `span`
    pub quote: String,
    pub span: Span,
    /// Geographic entities mentioned in this clause
    pub geo: Vec<String>,
}

/// Normalizer output for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedFeature {
    pub feature_id: String,
    pub clauses: Vec<Clause>,
    /// Distinct entities across all clauses, in first-mention order
    pub geo_tags: Vec<String>,
}

impl NormalizedFeature {
    /// True when there is no usable text, i.e. no evidence available.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn has_geo(&self) -> bool {
        !self.geo_tags.is_empty()
    }

    /// All clause texts joined by a space.
    pub fn joined_text(&self) -> String {
        self.clauses
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// All clause quotes joined by a space, before glossary expansion.
    pub fn joined_quotes(&self) -> String {
        self.clauses
            .iter()
            .map(|c| collapse_whitespace(&c.quote))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn clause(&self, clause_id: &str) -> Option<&Clause> {
        self.clauses.iter().find(|c| c.clause_id == clause_id)
    }
}

/// Abbreviations whose trailing period does not end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "e.g", "i.e", "etc", "vs", "mr", "mrs", "ms", "dr", "approx", "incl", "u.s", "u.k", "inc",
    "ltd", "st", "fig", "sec", "art", "para",
];

pub struct Normalizer {
    glossary: Glossary,
    geo: GeoDictionary,
}

impl Normalizer {
    pub fn new(glossary: Glossary, geo: GeoDictionary) -> Self {
        Self { glossary, geo }
    }

    pub fn glossary(&self) -> &Glossary {
        &self.glossary
    }

    pub fn geo(&self) -> &GeoDictionary {
        &self.geo
    }

    /// Normalize raw feature text into clauses.
    ///
    /// Empty or markup-only input yields zero clauses.
    pub fn normalize(&self, feature_id: &str, raw: &str) -> NormalizedFeature {
        let cleaned = clean::clean(raw);
        let mut clauses = Vec::new();
        let mut geo_tags: Vec<String> = Vec::new();

        for range in segment(&cleaned.text) {
            let Some((start, end)) = trim_range(&cleaned.text, range.0, range.1) else {
                continue;
            };
            let piece = &cleaned.text[start..end];
            if !piece.chars().any(char::is_alphanumeric) {
                continue;
            }
            let Some(span) = cleaned.raw_span(start..end) else {
                continue;
            };

            let collapsed = collapse_whitespace(piece);
            let geo = self.geo.tag(&collapsed);
            for entity in &geo {
                if !geo_tags.contains(entity) {
                    geo_tags.push(entity.clone());
                }
            }

            let index = clauses.len();
            clauses.push(Clause {
                clause_id: format!("f:{}:{}", feature_id, index),
                index,
                text: self.glossary.expand(&collapsed),
                quote: raw[span.start..span.end].to_string(),
                span,
                geo,
            });
        }

        tracing::debug!(
            feature_id,
            clauses = clauses.len(),
            geo = ?geo_tags,
            "Normalized feature text"
        );

        NormalizedFeature {
            feature_id: feature_id.to_string(),
            clauses,
            geo_tags,
        }
    }
}

/// Split cleaned text into candidate clause ranges.
///
/// Line breaks always split. `.`, `!`, `?` and `;` split when followed by
/// whitespace or end of text, except after a known abbreviation or a
/// single capital initial.
fn segment(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let next_is_break = chars.peek().map_or(true, |(_, n)| n.is_whitespace());
        match c {
            '\n' => {
                ranges.push((start, i));
                start = i + 1;
            }
            '.' | '!' | '?' | ';' if next_is_break => {
                if c == '.' && ends_with_abbreviation(&text[start..i]) {
                    continue;
                }
                ranges.push((start, i + 1));
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < text.len() {
        ranges.push((start, text.len()));
    }
    ranges
}

fn ends_with_abbreviation(prefix: &str) -> bool {
    let word = prefix
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or("")
        .trim_start_matches(['(', '"', '\'']);
    if word.is_empty() {
        return false;
    }
    let mut letters = word.chars();
    if let (Some(first), None) = (letters.next(), letters.next()) {
        if first.is_ascii_uppercase() {
            return true;
        }
    }
    let lower = word.to_ascii_lowercase();
    ABBREVIATIONS.contains(&lower.as_str())
}

fn trim_range(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    let (s, e) = (start + lead, end - trail);
    (s < e).then_some((s, e))
}

/// Collapse all whitespace runs to single spaces and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
