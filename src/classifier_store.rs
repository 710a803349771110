//! Classifier backed by a store collection.
//!
//! Classifications live next to the records they label, in a collection of
//! the source's database. Each document is keyed by the classified record's
//! fingerprint and carries `{ "label": ..., "value": ... }`, so a record has
//! at most one classification.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::models::{Classification, Record};
use crate::store::{Backend, Filter, Store};
use crate::traits::{Classifier, Source};

pub struct StoreClassifier {
    backend: Arc<dyn Backend>,
    source: Arc<dyn Source>,
    config: ClassifierConfig,
}

impl StoreClassifier {
    pub fn new(backend: Arc<dyn Backend>, source: Arc<dyn Source>, config: ClassifierConfig) -> Self {
        Self {
            backend,
            source,
            config,
        }
    }

    /// Label the record `fingerprint`.
    ///
    /// Fails when the record does not exist in the source or is already
    /// classified.
    pub async fn classify(&self, fingerprint: &str, label: &str, value: f64) -> Result<()> {
        let store = self.backend.open(self.source.database_name()).await?;
        let result = self.insert(store.as_ref(), fingerprint, label, value).await;
        store.close().await;
        result
    }

    async fn insert(&self, store: &dyn Store, fingerprint: &str, label: &str, value: f64) -> Result<()> {
        let known = store
            .find(
                self.source.collection_name(),
                &Filter::Fingerprints(vec![fingerprint.to_string()]),
            )
            .await?;
        if known.is_empty() {
            bail!("source '{}' has no record {}", self.source.id(), fingerprint);
        }

        store.create_unique_index(&self.config.collection).await?;
        let ack = store
            .insert(
                &self.config.collection,
                &Record::new(fingerprint, json!({ "label": label, "value": value })),
            )
            .await?;
        if !ack.is_ok() {
            bail!("classification of {} was not acknowledged", fingerprint);
        }
        debug!(fingerprint, label, value, "classified record");
        Ok(())
    }
}

fn parse(record: Record) -> Result<Classification> {
    let label = record
        .data
        .get("label")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("classification {} has no label", record.fingerprint))?
        .to_string();
    let value = record.data.get("value").and_then(Value::as_f64).unwrap_or(1.0);
    Ok(Classification {
        fingerprint: record.fingerprint,
        label,
        value,
    })
}

#[async_trait]
impl Classifier for StoreClassifier {
    fn id(&self) -> &str {
        "store"
    }

    async fn classifications(&self) -> Result<Vec<Classification>> {
        let store = self.backend.open(self.source.database_name()).await?;
        let found = store.find(&self.config.collection, &Filter::All).await;
        store.close().await;

        let mut classifications = Vec::new();
        for record in found? {
            match parse(record) {
                Ok(c) => classifications.push(c),
                Err(e) => warn!(error = %e, "ignoring malformed classification"),
            }
        }
        Ok(classifications)
    }

    async fn classification_mapping(
        &self,
        classifications: &[Classification],
    ) -> Result<BTreeMap<String, String>> {
        Ok(classifications
            .iter()
            .map(|c| {
                let name = self
                    .config
                    .labels
                    .get(&c.label)
                    .cloned()
                    .unwrap_or_else(|| c.label.clone());
                (c.label.clone(), name)
            })
            .collect())
    }
}
