//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! dir = "./data"            # one SQLite file per named database
//! database = "neuralfm"     # where model snapshots are stored
//! network_collection = "networks"
//!
//! [scrape]
//! interval_ms = 1000
//!
//! [network]
//! hidden_layers = [10, 5]
//!
//! [sources.filesystem.bsv]
//! root = "./inbox/bsv"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::network::{NetworkOptions, TrainingOptions};
use crate::store::validate_name;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub network: NetworkOptions,
    #[serde(default)]
    pub training: TrainingOptions,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub dir: PathBuf,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_network_collection")]
    pub network_collection: String,
}

fn default_database() -> String {
    "neuralfm".to_string()
}
fn default_network_collection() -> String {
    "networks".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScrapeConfig {
    /// Sleep between scrape cycles.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Failed cycles in a row before the drain loop gives up.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Default per-call record limit handed to sources.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            limit: None,
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}
fn default_max_consecutive_failures() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizerConfig {
    #[serde(default = "default_vocabulary_size")]
    pub vocabulary_size: usize,
    /// Collection (in the source's database) caching vocabulary metadata.
    #[serde(default = "default_metadata_collection")]
    pub metadata_collection: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            vocabulary_size: default_vocabulary_size(),
            metadata_collection: default_metadata_collection(),
        }
    }
}

fn default_vocabulary_size() -> usize {
    500
}
fn default_metadata_collection() -> String {
    "normalizations".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    /// Collection (in the source's database) holding classifications.
    #[serde(default = "default_classification_collection")]
    pub collection: String,
    /// Human-readable names for label identifiers.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            collection: default_classification_collection(),
            labels: BTreeMap::new(),
        }
    }
}

fn default_classification_collection() -> String {
    "classifications".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub filesystem: BTreeMap<String, FilesystemSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Database name; defaults to the source name.
    #[serde(default)]
    pub database: Option<String>,
    /// Collection name; defaults to `"records"`.
    #[serde(default)]
    pub collection: Option<String>,
    /// Payload field used as fingerprint. Content hash when unset.
    #[serde(default)]
    pub fingerprint_field: Option<String>,
    #[serde(default = "default_compatible_extractors")]
    pub compatible_extractors: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string(), "**/*.jsonl".to_string()]
}
fn default_compatible_extractors() -> Vec<String> {
    vec!["twitter".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    validate_name("database", &config.db.database)?;
    validate_name("collection", &config.db.network_collection)?;

    if config.scrape.max_consecutive_failures == 0 {
        anyhow::bail!("scrape.max_consecutive_failures must be >= 1");
    }

    if config.network.hidden_layers.iter().any(|&n| n == 0) {
        anyhow::bail!("network.hidden_layers entries must be > 0");
    }
    if !(0.0..=1.0).contains(&config.network.binary_thresh) {
        anyhow::bail!("network.binary_thresh must be in [0.0, 1.0]");
    }

    if config.training.iterations == 0 {
        anyhow::bail!("training.iterations must be > 0");
    }
    if !(0.0..1.0).contains(&config.training.error_thresh) {
        anyhow::bail!("training.error_thresh must be in [0.0, 1.0)");
    }
    if config.training.learning_rate <= 0.0 || config.training.learning_rate > 1.0 {
        anyhow::bail!("training.learning_rate must be in (0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.training.momentum) {
        anyhow::bail!("training.momentum must be in [0.0, 1.0]");
    }

    if config.normalizer.vocabulary_size == 0 {
        anyhow::bail!("normalizer.vocabulary_size must be > 0");
    }
    validate_name("collection", &config.normalizer.metadata_collection)?;
    validate_name("collection", &config.classifier.collection)?;

    for (name, fs) in &config.sources.filesystem {
        validate_name("source", name)?;
        if let Some(db) = &fs.database {
            validate_name("database", db)?;
        }
        if let Some(coll) = &fs.collection {
            validate_name("collection", coll)?;
        }
    }

    Ok(())
}
