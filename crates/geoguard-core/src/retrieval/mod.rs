//! Hybrid lexical and semantic retrieval.
//!
//! Two independent searches run per scan: one over the feature's own
//! clauses, one over the static regulation corpus. Both fuse an
//! IDF-weighted term-coverage score with embedding cosine similarity:
//!
//! ```text
//! fused = w * lexical + (1 - w) * semantic
//! ```
//!
//! Results are the top-k by fused score, ties broken by corpus order.
//! Indexes are read-only once built and only ever return stored text.

mod clauses;
mod embed;
mod regulations;

pub use clauses::{ClauseIndex, SALIENCE_PROBE};
pub use embed::{cosine, Embedder, HashingEmbedder};
pub use regulations::{RegulationCorpus, RegulationIndex, RegulationSection};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Tunable retrieval parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Weight of the lexical score in the fused score, in [0, 1]
    pub lexical_weight: f64,

    /// Passages returned per side
    pub top_k: usize,

    /// Minimum fused score for a regulation passage
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.6,
            top_k: 4,
            min_score: 0.12,
        }
    }
}

/// One ranked passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// `clause_id` or `section_id`
    pub id: String,
    pub score: f64,
    pub lexical: f64,
    pub semantic: f64,
    /// Stored passage text, never rewritten
    pub text: String,
}

/// Ranked passages for one side of retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<Hit>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.hits.iter().map(|h| h.id.clone()).collect()
    }
}

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "also", "an", "and", "any", "are", "as", "at", "be", "been", "but",
    "by", "can", "could", "each", "for", "from", "has", "have", "if", "in", "into", "is", "it",
    "its", "may", "must", "no", "not", "of", "on", "only", "or", "our", "shall", "should",
    "so", "such", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "those", "to", "us", "via", "was", "we", "were", "when", "which", "who", "will",
    "with", "would", "all",
];

/// Lowercase, drop stopwords, and fold simple plurals.
pub(crate) fn terms(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(stem)
        .collect()
}

fn stem(token: &str) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

struct IndexedDoc {
    id: String,
    text: String,
    terms: BTreeSet<String>,
    vector: Vec<f32>,
}

/// Shared scoring core for clause and regulation indexes.
pub(crate) struct HybridIndex {
    docs: Vec<IndexedDoc>,
    doc_freq: HashMap<String, usize>,
    embedder: Arc<dyn Embedder>,
}

impl HybridIndex {
    pub(crate) fn build<I>(docs: I, embedder: Arc<dyn Embedder>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let docs: Vec<IndexedDoc> = docs
            .into_iter()
            .map(|(id, text)| IndexedDoc {
                terms: terms(&text),
                vector: embedder.embed(&text),
                id,
                text,
            })
            .collect();

        let mut doc_freq = HashMap::new();
        for doc in &docs {
            for term in &doc.terms {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }

        Self {
            docs,
            doc_freq,
            embedder,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.docs.len()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (n + 1.0) / (df + 1.0)).ln()
    }

    /// Rank documents for `query`.
    ///
    /// With `min_score` set, a document also needs non-zero lexical overlap
    /// and a fused score at or above the floor.
    pub(crate) fn search(
        &self,
        query: &str,
        top_k: usize,
        lexical_weight: f64,
        min_score: Option<f64>,
    ) -> RetrievalResult {
        let query_terms = terms(query);
        let total_idf: f64 = query_terms.iter().map(|t| self.idf(t)).sum();
        let query_vector = self.embedder.embed(query);
        let w = lexical_weight.clamp(0.0, 1.0);

        let mut scored: Vec<(usize, Hit)> = self
            .docs
            .iter()
            .enumerate()
            .map(|(order, doc)| {
                let lexical = if total_idf > 0.0 {
                    query_terms
                        .iter()
                        .filter(|t| doc.terms.contains(*t))
                        .map(|t| self.idf(t))
                        .sum::<f64>()
                        / total_idf
                } else {
                    0.0
                };
                let semantic = cosine(&query_vector, &doc.vector);
                let hit = Hit {
                    id: doc.id.clone(),
                    score: w * lexical + (1.0 - w) * semantic,
                    lexical,
                    semantic,
                    text: doc.text.clone(),
                };
                (order, hit)
            })
            .filter(|(_, hit)| match min_score {
                Some(floor) => hit.lexical > 0.0 && hit.score >= floor,
                None => true,
            })
            .collect();

        scored.sort_by(|(ord_a, a), (ord_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(ord_a.cmp(ord_b))
        });

        RetrievalResult {
            hits: scored.into_iter().take(top_k).map(|(_, hit)| hit).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(texts: &[&str]) -> HybridIndex {
        HybridIndex::build(
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| (format!("d{}", i), t.to_string())),
            Arc::new(HashingEmbedder::default()),
        )
    }

    #[test]
    fn test_terms_drop_stopwords_and_plurals() {
        let t = terms("The minors and their Accounts, with access");
        assert_eq!(
            t.into_iter().collect::<Vec<_>>(),
            vec!["access".to_string(), "account".to_string(), "minor".to_string()]
        );
    }

    #[test]
    fn test_lexical_ranks_overlap_first() {
        let idx = index(&["curfew for minor accounts", "notice and action for hosting"]);
        let result = idx.search("minors curfew", 2, 1.0, None);
        assert_eq!(result.hits[0].id, "d0");
        assert!((result.hits[0].lexical - 1.0).abs() < 1e-9);
        assert_eq!(result.hits[1].lexical, 0.0);
    }

    #[test]
    fn test_ties_broken_by_corpus_order() {
        let idx = index(&["same text here", "same text here", "same text here"]);
        let result = idx.search("same text", 3, 0.6, None);
        assert_eq!(result.ids(), vec!["d0", "d1", "d2"]);
    }

    #[test]
    fn test_top_k_bounds_results() {
        let idx = index(&["a minor", "b minor", "c minor", "d minor"]);
        assert_eq!(idx.search("minor", 2, 0.6, None).len(), 2);
    }

    #[test]
    fn test_gate_requires_lexical_overlap() {
        let idx = index(&["curfew for minor accounts"]);
        let gated = idx.search("minority report", 4, 0.6, Some(0.0));
        assert!(gated.is_empty());
        let ungated = idx.search("minority report", 4, 0.6, None);
        assert_eq!(ungated.len(), 1);
    }

    #[test]
    fn test_stopword_only_query_has_no_lexical_score() {
        let idx = index(&["the and of"]);
        let result = idx.search("the of", 1, 1.0, None);
        assert_eq!(result.hits[0].lexical, 0.0);
    }

    #[test]
    fn test_hits_return_stored_text() {
        let idx = index(&["Verbatim   Text, kept."]);
        let result = idx.search("verbatim", 1, 0.6, None);
        assert_eq!(result.hits[0].text, "Verbatim   Text, kept.");
    }
}
