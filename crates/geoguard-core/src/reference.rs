//! Process-wide reference data.
//!
//! The regulation index, router model, phrase cues, glossary and geo
//! dictionary are loaded once and shared read-only by every request.
//! [`ReferenceHandle`] lets an operator swap in a new set between requests;
//! in-flight requests keep the snapshot they started with.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::ReferencePaths;
use crate::normalizer::{GeoDictionary, Glossary, Normalizer};
use crate::retrieval::{Embedder, HashingEmbedder, RegulationCorpus, RegulationIndex};
use crate::router::{CueLists, Router, RouterModel, DEFAULT_THRESHOLD};

pub const CORPUS_YAML: &str = include_str!("../../../data/regulations.yaml");
pub const GLOSSARY_YAML: &str = include_str!("../../../data/glossary.yaml");
pub const GEO_YAML: &str = include_str!("../../../data/geo.yaml");
pub const CUES_YAML: &str = include_str!("../../../data/cues.yaml");
pub const ROUTER_MODEL_JSON: &str = include_str!("../../../data/router_model.json");

/// Errors loading reference data.
#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid reference data: {0}")]
    Invalid(String),
}

/// Everything a scan reads but never writes.
pub struct ReferenceData {
    pub normalizer: Normalizer,
    pub router: Router,
    pub regulations: RegulationIndex,
    pub embedder: Arc<dyn Embedder>,
}

impl ReferenceData {
    /// Reference data compiled into the binary, with the default threshold.
    pub fn embedded() -> Result<Self, ReferenceError> {
        Self::load(&ReferencePaths::default(), DEFAULT_THRESHOLD)
    }

    /// Load reference data, reading any configured path instead of the
    /// embedded default.
    pub fn load(paths: &ReferencePaths, router_threshold: f64) -> Result<Self, ReferenceError> {
        let glossary = Glossary::from_yaml(&source(paths.glossary.as_deref(), GLOSSARY_YAML)?)?;
        let geo = GeoDictionary::from_yaml(&source(paths.geo.as_deref(), GEO_YAML)?)?;
        let cues = CueLists::from_yaml(&source(paths.cues.as_deref(), CUES_YAML)?)?;
        let model =
            RouterModel::from_json(&source(paths.router_model.as_deref(), ROUTER_MODEL_JSON)?)?;
        let corpus = RegulationCorpus::from_yaml(&source(paths.corpus.as_deref(), CORPUS_YAML)?)?;

        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        let regulations = RegulationIndex::build(corpus, embedder.clone());
        let router = Router::new(model, &cues, router_threshold)?;

        tracing::info!(
            index_version = regulations.version(),
            router_model = router.model_version(),
            glossary_terms = glossary.len(),
            "Loaded reference data"
        );

        Ok(Self {
            normalizer: Normalizer::new(glossary, geo),
            router,
            regulations,
            embedder,
        })
    }
}

fn source(path: Option<&Path>, embedded: &'static str) -> Result<String, ReferenceError> {
    match path {
        Some(p) => std::fs::read_to_string(p).map_err(|e| ReferenceError::Io {
            path: p.to_path_buf(),
            source: e,
        }),
        None => Ok(embedded.to_string()),
    }
}

/// Read-only handle to the current reference data.
///
/// `snapshot` is cheap and never blocks on an in-progress scan; `swap`
/// replaces the data atomically for subsequent snapshots.
pub struct ReferenceHandle {
    current: RwLock<Arc<ReferenceData>>,
}

impl ReferenceHandle {
    pub fn new(data: ReferenceData) -> Self {
        Self {
            current: RwLock::new(Arc::new(data)),
        }
    }

    pub fn snapshot(&self) -> Arc<ReferenceData> {
        self.current.read().clone()
    }

    /// Install new reference data, returning the previous set.
    pub fn swap(&self, data: ReferenceData) -> Arc<ReferenceData> {
        let next = Arc::new(data);
        let previous = std::mem::replace(&mut *self.current.write(), next);
        tracing::info!(
            index_version = self.current.read().regulations.version(),
            "Swapped reference data"
        );
        previous
    }
}
