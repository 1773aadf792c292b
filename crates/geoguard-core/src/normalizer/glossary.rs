//! Controlled-vocabulary expansion of internal jargon.

use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::HashMap;

use crate::reference::ReferenceError;

#[derive(Debug, Clone, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    pub expansion: String,
}

#[derive(Debug, Deserialize)]
struct GlossaryFile {
    version: String,
    terms: Vec<GlossaryTerm>,
}

/// Expands abbreviations to `Expansion (TERM)` in a single pass.
#[derive(Debug, Clone)]
pub struct Glossary {
    version: String,
    expansions: HashMap<String, String>,
    pattern: Option<Regex>,
}

impl Glossary {
    pub fn from_yaml(yaml: &str) -> Result<Self, ReferenceError> {
        let file: GlossaryFile = serde_yaml::from_str(yaml)?;
        Self::new(file.version, file.terms)
    }

    pub fn new(version: impl Into<String>, terms: Vec<GlossaryTerm>) -> Result<Self, ReferenceError> {
        let mut expansions = HashMap::new();
        for term in terms {
            if term.term.trim().is_empty() || term.expansion.trim().is_empty() {
                return Err(ReferenceError::Invalid(format!(
                    "glossary entry '{}' has an empty term or expansion",
                    term.term
                )));
            }
            if expansions.insert(term.term.clone(), term.expansion).is_some() {
                return Err(ReferenceError::Invalid(format!(
                    "glossary term '{}' is defined twice",
                    term.term
                )));
            }
        }

        // Longest first so overlapping terms prefer the longer match.
        let mut keys: Vec<&String> = expansions.keys().collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let pattern = if keys.is_empty() {
            None
        } else {
            let alternation = keys
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            Some(Regex::new(&format!(r"\b(?:{})\b", alternation))?)
        };

        Ok(Self {
            version: version.into(),
            expansions,
            pattern,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.expansions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expansions.is_empty()
    }

    /// Replace every glossary term with its expansion, keeping the term in
    /// parentheses. Text that already reads `(TERM)` is left alone.
    pub fn expand(&self, text: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return text.to_string();
        };

        pattern
            .replace_all(text, |caps: &Captures<'_>| {
                let Some(m) = caps.get(0) else {
                    return String::new();
                };
                let already_glossed =
                    text[..m.start()].ends_with('(') && text[m.end()..].starts_with(')');
                match self.expansions.get(m.as_str()) {
                    Some(expansion) if !already_glossed => {
                        format!("{} ({})", expansion, m.as_str())
                    }
                    _ => m.as_str().to_string(),
                }
            })
            .into_owned()
    }
}
