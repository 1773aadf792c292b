//! Feature artifacts submitted for classification.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A feature description as submitted for a scan.
///
/// The pipeline clones the artifact at the start of a scan, so the audit
/// record holds a frozen snapshot even if the caller reuses the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureArtifact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trd: Option<String>,
}

impl FeatureArtifact {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            prd: None,
            trd: None,
        }
    }

    pub fn with_prd(mut self, prd: impl Into<String>) -> Self {
        self.prd = Some(prd.into());
        self
    }

    pub fn with_trd(mut self, trd: impl Into<String>) -> Self {
        self.trd = Some(trd.into());
        self
    }

    /// The text that feature spans are quoted from.
    ///
    /// Description, PRD and TRD are joined by a blank line, skipping
    /// sections that are absent or blank.
    pub fn full_text(&self) -> String {
        [Some(&self.description), self.prd.as_ref(), self.trd.as_ref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// SHA-256 over the artifact's fields, lowercase hex.
    ///
    /// Each field is written as a presence byte followed by its big-endian
    /// length and bytes, so moving text between fields changes the hash and
    /// an absent section differs from an empty one.
    pub fn content_hash(&self) -> String {
        let fields = [
            Some(&self.id),
            Some(&self.name),
            Some(&self.description),
            self.prd.as_ref(),
            self.trd.as_ref(),
        ];
        let mut hasher = Sha256::new();
        for field in fields {
            match field {
                Some(value) => {
                    hasher.update([1u8]);
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_text_joins_sections() {
        let feature = FeatureArtifact::new("F-9", "Curfew", "Curfew for minors.")
            .with_prd("Applies in Utah.")
            .with_trd("   ");
        assert_eq!(feature.full_text(), "Curfew for minors.\n\nApplies in Utah.");
    }

    #[test]
    fn test_full_text_without_description() {
        let feature = FeatureArtifact::new("F-9", "Curfew", "").with_trd("Only TRD.");
        assert_eq!(feature.full_text(), "Only TRD.");
    }

    #[test]
    fn test_content_hash_is_stable_and_sensitive() {
        let a = FeatureArtifact::new("F-1", "Name", "Text");
        let b = FeatureArtifact::new("F-1", "Name", "Text");
        let c = FeatureArtifact::new("F-1", "Name", "Text!");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_content_hash_separates_fields() {
        let a = FeatureArtifact::new("F-1", "ab", "c");
        let b = FeatureArtifact::new("F-1", "a", "bc");
        assert_ne!(a.content_hash(), b.content_hash());

        let absent = FeatureArtifact::new("F-1", "Name", "Text");
        let empty = FeatureArtifact::new("F-1", "Name", "Text").with_prd("");
        assert_ne!(absent.content_hash(), empty.content_hash());

        let prd = FeatureArtifact::new("F-1", "Name", "Text").with_prd("x");
        let trd = FeatureArtifact::new("F-1", "Name", "Text").with_trd("x");
        assert_ne!(prd.content_hash(), trd.content_hash());
    }

    #[test]
    fn test_optional_sections_omitted_from_json() {
        let json = serde_json::to_value(FeatureArtifact::new("F-1", "N", "D")).unwrap();
        assert!(json.get("prd").is_none());
    }
}
