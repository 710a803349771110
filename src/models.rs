//! Core data models used throughout neuralfm.
//!
//! These types represent the records, classifications and training examples
//! that flow from the sources through extraction into model training.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A domain document collected by a source.
///
/// `data` is the raw payload exactly as the source produced it. Derived
/// feature documents are kept apart in `features`, keyed by the extractor's
/// field name (e.g. `"twitter_features"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub fingerprint: String,
    pub data: Value,
    #[serde(default)]
    pub features: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn new(fingerprint: impl Into<String>, data: Value) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            data,
            features: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Returns the feature document stored under `field`.
    ///
    /// A stored JSON `null` counts as missing.
    pub fn feature(&self, field: &str) -> Option<&Value> {
        self.features.get(field).filter(|v| !v.is_null())
    }

    pub fn has_feature(&self, field: &str) -> bool {
        self.feature(field).is_some()
    }
}

/// One labeled record, as reported by a classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Fingerprint of the classified record.
    pub fingerprint: String,
    /// Internal label identifier (e.g. `"like"`).
    pub label: String,
    /// Target value the network should learn for this record.
    pub value: f64,
}

/// A single `(input, output)` pair fed to the numeric trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub input: Vec<f64>,
    pub output: Vec<f64>,
}

/// Call-scoped options handed to every source during a scrape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeOptions {
    /// Maximum number of new records a source should return per call.
    pub limit: Option<usize>,
    /// Source-interpreted filter (e.g. a file glob or account name).
    pub filter: Option<String>,
}
