//! Plugin traits and registries.
//!
//! Sources, extractors, normalizers, classifiers and networks are developed
//! independently and composed through the narrow contracts below. Each
//! plugin carries an explicit `id()`; ids are stored in model snapshots and
//! used to build model fingerprints, so they must stay stable.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌─────────────────┐    ┌───────────────────┐
//! │ SourceRegistry│──▶│ scrape() / drain │──▶│ Store (per source) │
//! └──────────────┘    └─────────────────┘    └─────────┬─────────┘
//!                                                      ▼
//!                                        FeatureExtraction (per extractor)
//!                                                      ▼
//!                              Normalizer + Classifier ─▶ TrainableModel
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::extractor_twitter::TwitterFeatureExtractor;
use crate::models::{Classification, Record, ScrapeOptions, TrainingExample};
use crate::network::{FeedForwardFactory, NetworkFactory};
use crate::source_fs::FilesystemSource;
use crate::store::Store;

// ═══════════════════════════════════════════════════════════════════════
// Plugin traits
// ═══════════════════════════════════════════════════════════════════════

/// A data source producing new records.
///
/// `run` is called by the scrape scheduler with a connection to the
/// source's own database. It stores whatever it collects and returns only
/// the records that are new; an empty list means nothing new upstream.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use neuralfm::models::{Record, ScrapeOptions};
/// use neuralfm::store::Store;
/// use neuralfm::traits::Source;
///
/// struct Quiet {
///     extractors: Vec<String>,
/// }
///
/// #[async_trait]
/// impl Source for Quiet {
///     fn id(&self) -> &str { "quiet" }
///     fn description(&self) -> &str { "Never finds anything" }
///     fn compatible_extractors(&self) -> &[String] { &self.extractors }
///
///     async fn run(&self, _store: &dyn Store, _opts: &ScrapeOptions) -> Result<Vec<Record>> {
///         Ok(vec![])
///     }
/// }
/// ```
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier (e.g. `"bsv"`).
    fn id(&self) -> &str;

    /// One-line description for `neuralfm sources`.
    fn description(&self) -> &str;

    /// Database holding this source's records. Defaults to the id.
    fn database_name(&self) -> &str {
        self.id()
    }

    /// Collection holding this source's records.
    fn collection_name(&self) -> &str {
        "records"
    }

    /// Ids of the feature extractors that understand this source's records.
    fn compatible_extractors(&self) -> &[String];

    fn is_compatible_with(&self, extractor_id: &str) -> bool {
        self.compatible_extractors().iter().any(|e| e == extractor_id)
    }

    /// Fetch, store and return new records.
    async fn run(&self, store: &dyn Store, options: &ScrapeOptions) -> Result<Vec<Record>>;
}

/// Computes a feature document from one record.
pub trait FeatureExtractor: Send + Sync {
    /// Stable identifier (e.g. `"twitter"`).
    fn id(&self) -> &str;

    /// Field under which feature documents are attached.
    ///
    /// Its presence on a record marks the record as processed.
    fn features_field(&self) -> String {
        format!("{}_features", self.id())
    }

    /// Compute the feature document. Errors abort the extraction run.
    fn extract(&self, record: &Record) -> Result<Value>;
}

/// Turns extracted features into trainable data.
#[async_trait]
pub trait Normalizer: Send + Sync {
    fn id(&self) -> &str;

    /// Records with features, ready for normalization.
    async fn data_source(&self) -> Result<Vec<Record>>;

    /// Normalization metadata for `data` (vocabulary, scaling stats, ...).
    ///
    /// Implementations reuse earlier metadata when `data` is unchanged.
    async fn get_or_create_metadata(&self, data: &[Record]) -> Result<Value>;

    /// Labeled examples aligned with the classifier's current set.
    async fn training_data(
        &self,
        classifier: &dyn Classifier,
        data: &[Record],
        metadata: &Value,
    ) -> Result<Vec<TrainingExample>>;
}

/// Supplies the current classification set.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn id(&self) -> &str;

    async fn classifications(&self) -> Result<Vec<Classification>>;

    /// Map of label identifier to human-readable name.
    async fn classification_mapping(
        &self,
        classifications: &[Classification],
    ) -> Result<BTreeMap<String, String>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registries
// ═══════════════════════════════════════════════════════════════════════

/// Ordered set of sources. Order is scrape priority.
pub struct SourceRegistry {
    sources: Vec<Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Create a registry holding every source declared in the config.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (name, cfg) in &config.sources.filesystem {
            registry.register(Arc::new(FilesystemSource::new(name.clone(), cfg.clone())));
        }
        registry
    }

    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[Arc<dyn Source>] {
        &self.sources
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn Source>> {
        self.sources.iter().find(|s| s.id() == id).cloned()
    }

    /// Sources whose records the given extractor understands.
    pub fn compatible_with(&self, extractor_id: &str) -> Vec<Arc<dyn Source>> {
        self.sources
            .iter()
            .filter(|s| s.is_compatible_with(extractor_id))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Feature extractors by id.
pub struct ExtractorRegistry {
    extractors: BTreeMap<String, Arc<dyn FeatureExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in extractors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TwitterFeatureExtractor));
        registry
    }

    pub fn register(&mut self, extractor: Arc<dyn FeatureExtractor>) {
        self.extractors
            .insert(extractor.id().to_string(), extractor);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn FeatureExtractor>> {
        self.extractors.get(id).cloned()
    }

    pub fn extractors(&self) -> impl Iterator<Item = &Arc<dyn FeatureExtractor>> {
        self.extractors.values()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Network factories by id.
pub struct NetworkRegistry {
    factories: BTreeMap<String, Arc<dyn NetworkFactory>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FeedForwardFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn NetworkFactory>) {
        self.factories.insert(factory.id().to_string(), factory);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn NetworkFactory>> {
        self.factories.get(id).cloned()
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
