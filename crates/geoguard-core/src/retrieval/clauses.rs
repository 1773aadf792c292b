//! Per-scan index over a feature's own clauses.

use std::sync::Arc;

use super::{Embedder, HybridIndex, RetrievalConfig, RetrievalResult};
use crate::normalizer::NormalizedFeature;

/// Query used to surface the clauses that describe compliance-relevant
/// behaviour. Tagged geographies are appended per feature.
pub const SALIENCE_PROBE: &str = "legal requirement law regulation compliance comply minors \
     age verification restriction parental consent data retention reporting jurisdiction \
     curfew content notice takedown localization region";

pub struct ClauseIndex {
    index: HybridIndex,
}

impl ClauseIndex {
    pub fn build(feature: &NormalizedFeature, embedder: Arc<dyn Embedder>) -> Self {
        let index = HybridIndex::build(
            feature
                .clauses
                .iter()
                .map(|c| (c.clause_id.clone(), c.text.clone())),
            embedder,
        );
        Self { index }
    }

    /// Rank clauses against an arbitrary query. No score floor applies.
    pub fn search(&self, query: &str, config: &RetrievalConfig) -> RetrievalResult {
        self.index
            .search(query, config.top_k, config.lexical_weight, None)
    }

    /// Most salient clauses for the compliance query plus the feature's
    /// geographic tags.
    pub fn salient(&self, feature: &NormalizedFeature, config: &RetrievalConfig) -> RetrievalResult {
        let mut query = SALIENCE_PROBE.to_string();
        for tag in &feature.geo_tags {
            query.push(' ');
            query.push_str(tag);
        }
        self.search(&query, config)
    }
}
