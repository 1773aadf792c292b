//! Geographic entity tagging from a curated dictionary.

use regex::Regex;
use serde::Deserialize;

use crate::reference::ReferenceError;

#[derive(Debug, Clone, Deserialize)]
pub struct GeoEntry {
    pub entity: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GeoFile {
    version: String,
    entities: Vec<GeoEntry>,
}

#[derive(Debug, Clone)]
struct CompiledEntry {
    entity: String,
    pattern: Regex,
}

/// Curated dictionary of places. Names match case-insensitively, codes
/// (`UT`, `KR`) only in upper case.
#[derive(Debug, Clone)]
pub struct GeoDictionary {
    version: String,
    entries: Vec<CompiledEntry>,
}

impl GeoDictionary {
    pub fn from_yaml(yaml: &str) -> Result<Self, ReferenceError> {
        let file: GeoFile = serde_yaml::from_str(yaml)?;
        Self::new(file.version, file.entities)
    }

    pub fn new(version: impl Into<String>, entries: Vec<GeoEntry>) -> Result<Self, ReferenceError> {
        let mut compiled = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut alternatives = Vec::new();
            if !entry.names.is_empty() {
                let names = join_escaped(&entry.names);
                alternatives.push(format!(r"(?i:\b(?:{})\b)", names));
            }
            if !entry.codes.is_empty() {
                let codes = join_escaped(&entry.codes);
                alternatives.push(format!(r"\b(?:{})\b", codes));
            }
            if alternatives.is_empty() {
                return Err(ReferenceError::Invalid(format!(
                    "geo entity '{}' has neither names nor codes",
                    entry.entity
                )));
            }
            compiled.push(CompiledEntry {
                pattern: Regex::new(&alternatives.join("|"))?,
                entity: entry.entity,
            });
        }
        Ok(Self {
            version: version.into(),
            entries: compiled,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Entities mentioned in `text`, in dictionary order, without repeats.
    pub fn tag(&self, text: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.pattern.is_match(text))
            .map(|e| e.entity.clone())
            .collect()
    }
}

fn join_escaped(items: &[String]) -> String {
    let mut sorted: Vec<&String> = items.iter().collect();
    sorted.sort_by(|a, b| b.len().cmp(&a.len()));
    sorted
        .iter()
        .map(|s| regex::escape(s))
        .collect::<Vec<_>>()
        .join("|")
}
