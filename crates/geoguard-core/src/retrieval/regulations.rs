//! The static regulation corpus and its pre-built index.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use super::{Embedder, HybridIndex, RetrievalConfig, RetrievalResult};
use crate::reference::ReferenceError;
use crate::types::Regulation;

/// One citable section of a regulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegulationSection {
    /// Stable id, e.g. `dsa:III.28.1`
    pub section_id: String,
    pub regulation: Regulation,
    /// Heading path from the act down to the section
    #[serde(default)]
    pub heading: Vec<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulationCorpus {
    pub version: String,
    pub sections: Vec<RegulationSection>,
}

impl RegulationCorpus {
    pub fn from_yaml(yaml: &str) -> Result<Self, ReferenceError> {
        let corpus: Self = serde_yaml::from_str(yaml)?;
        corpus.validate()?;
        Ok(corpus)
    }

    fn validate(&self) -> Result<(), ReferenceError> {
        let mut seen = HashSet::new();
        for section in &self.sections {
            if section.section_id.trim().is_empty() {
                return Err(ReferenceError::Invalid(
                    "regulation section with empty id".to_string(),
                ));
            }
            if !seen.insert(section.section_id.as_str()) {
                return Err(ReferenceError::Invalid(format!(
                    "duplicate regulation section id '{}'",
                    section.section_id
                )));
            }
            if section.text.trim().is_empty() {
                return Err(ReferenceError::Invalid(format!(
                    "regulation section '{}' has no text",
                    section.section_id
                )));
            }
        }
        Ok(())
    }
}

/// Versioned, read-only index over the regulation corpus.
pub struct RegulationIndex {
    corpus: RegulationCorpus,
    index: HybridIndex,
    version: String,
}

impl RegulationIndex {
    pub fn build(corpus: RegulationCorpus, embedder: Arc<dyn Embedder>) -> Self {
        let version = format!("{}+{}", corpus.version, embedder.id());
        let index = HybridIndex::build(
            corpus
                .sections
                .iter()
                .map(|s| (s.section_id.clone(), s.text.clone())),
            embedder,
        );
        tracing::info!(
            version = %version,
            sections = index.len(),
            "Built regulation index"
        );
        Self {
            corpus,
            index,
            version,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn sections(&self) -> &[RegulationSection] {
        &self.corpus.sections
    }

    pub fn section(&self, section_id: &str) -> Option<&RegulationSection> {
        self.corpus
            .sections
            .iter()
            .find(|s| s.section_id == section_id)
    }

    /// Candidate supporting sections for `query`.
    ///
    /// An empty result means no regulation matched, which downstream
    /// treats as evidence against `YES`.
    pub fn search(&self, query: &str, config: &RetrievalConfig) -> RetrievalResult {
        self.index.search(
            query,
            config.top_k,
            config.lexical_weight,
            Some(config.min_score),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{ReferenceData, CORPUS_YAML};

    #[test]
    fn test_embedded_corpus_covers_every_regulation() {
        let corpus = RegulationCorpus::from_yaml(CORPUS_YAML).unwrap();
        for reg in Regulation::ALL {
            assert!(
                corpus.sections.iter().any(|s| s.regulation == reg),
                "no section for {}",
                reg
            );
        }
    }

    #[test]
    fn test_duplicate_section_ids_rejected() {
        let yaml = r#"
version: "v"
sections:
  - { section_id: "x:1", regulation: DSA, text: "a" }
  - { section_id: "x:1", regulation: DSA, text: "b" }
"#;
        assert!(RegulationCorpus::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_regulation_tag_rejected() {
        let yaml = r#"
version: "v"
sections:
  - { section_id: "x:1", regulation: GDPR, text: "a" }
"#;
        assert!(RegulationCorpus::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_utah_curfew_query_finds_utah_sections() {
        let reference = ReferenceData::embedded().unwrap();
        let result = reference.regulations.search(
            "To comply with the Utah Social Media Regulation Act, we implement a curfew-based login restriction for minors.",
            &RetrievalConfig::default(),
        );
        assert!(!result.is_empty());
        assert_eq!(result.hits[0].id, "ut-smra:13-63-105");
        assert!(result.len() <= 4);
        for hit in &result.hits {
            let section = reference.regulations.section(&hit.id).unwrap();
            assert_eq!(hit.text, section.text);
        }
    }

    #[test]
    fn test_unrelated_query_finds_nothing() {
        let reference = ReferenceData::embedded().unwrap();
        let result = reference.regulations.search(
            "Feature is available in all regions except Korea; no legal rationale stated.",
            &RetrievalConfig::default(),
        );
        assert!(result.is_empty());
    }

    #[test]
    fn test_version_includes_embedder() {
        let reference = ReferenceData::embedded().unwrap();
        assert!(reference.regulations.version().ends_with("+hash-trigram-256"));
    }
}
