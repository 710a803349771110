//! Bag-of-words normalizer.
//!
//! Reads the text feature produced by an extractor, builds a vocabulary of
//! the most frequent words across the data set, and turns each classified
//! record into a word-presence vector. Vocabularies are cached in the
//! source's database, keyed by a hash of the fingerprints they were built
//! from, so repeated runs over unchanged data reuse them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::NormalizerConfig;
use crate::error::Error;
use crate::models::{Record, TrainingExample};
use crate::store::{find_one, Backend, Filter, Store};
use crate::traits::{Classifier, FeatureExtractor, Normalizer, Source};

/// Feature key holding the text to tokenize.
const TEXT_KEY: &str = "text";

pub struct BagOfWordsNormalizer {
    backend: Arc<dyn Backend>,
    source: Arc<dyn Source>,
    extractor: Arc<dyn FeatureExtractor>,
    config: NormalizerConfig,
}

impl BagOfWordsNormalizer {
    pub fn new(
        backend: Arc<dyn Backend>,
        source: Arc<dyn Source>,
        extractor: Arc<dyn FeatureExtractor>,
        config: NormalizerConfig,
    ) -> Self {
        Self {
            backend,
            source,
            extractor,
            config,
        }
    }

    fn text<'a>(&self, record: &'a Record) -> Option<&'a str> {
        record
            .feature(&self.extractor.features_field())
            .and_then(|f| f.get(TEXT_KEY))
            .and_then(Value::as_str)
    }

    fn build_vocabulary(&self, data: &[Record]) -> Vec<String> {
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for record in data {
            let Some(text) = self.text(record) else {
                continue;
            };
            let mut words = tokenize(text);
            words.sort();
            words.dedup();
            for word in words {
                *document_frequency.entry(word).or_default() += 1;
            }
        }

        let mut ranked: Vec<(String, usize)> = document_frequency.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(self.config.vocabulary_size)
            .map(|(word, _)| word)
            .collect()
    }

    /// Cache key for the metadata of `data`.
    fn metadata_key(&self, data: &[Record]) -> String {
        let mut fingerprints: Vec<&str> = data.iter().map(|r| r.fingerprint.as_str()).collect();
        fingerprints.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(self.extractor.features_field().as_bytes());
        hasher.update(self.config.vocabulary_size.to_le_bytes());
        for fp in fingerprints {
            hasher.update(fp.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    async fn load_or_build(&self, store: &dyn Store, data: &[Record]) -> Result<Value> {
        let key = self.metadata_key(data);
        let collection = &self.config.metadata_collection;

        store.create_unique_index(collection).await?;
        if let Some(cached) = find_one(store, collection, &key).await? {
            debug!(key = %key, "reusing normalization metadata");
            return Ok(cached.data);
        }

        let vocabulary = self.build_vocabulary(data);
        info!(
            source = self.source.id(),
            records = data.len(),
            words = vocabulary.len(),
            "built vocabulary"
        );
        let metadata = json!({
            "vocabulary": vocabulary,
            "records": data.len(),
        });

        match store.insert(collection, &Record::new(key, metadata.clone())).await {
            // Another run cached the same data set first.
            Ok(_) | Err(Error::ConstraintViolation { .. }) => Ok(metadata),
            Err(e) => Err(e.into()),
        }
    }
}

/// Lowercased alphanumeric words of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '@' && c != '#')
        .map(|w| w.trim_matches(|c| c == '@' || c == '#'))
        .filter(|w| w.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Word-presence vector of `text` over `vocabulary`.
pub fn vectorize(text: &str, vocabulary: &[String]) -> Vec<f64> {
    let words: std::collections::HashSet<String> = tokenize(text).into_iter().collect();
    vocabulary
        .iter()
        .map(|w| if words.contains(w) { 1.0 } else { 0.0 })
        .collect()
}

/// The vocabulary stored in normalization metadata.
pub fn vocabulary(metadata: &Value) -> Result<Vec<String>> {
    metadata
        .get("vocabulary")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("normalization metadata has no vocabulary"))?
        .iter()
        .map(|w| {
            w.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("vocabulary entries must be strings"))
        })
        .collect()
}

#[async_trait]
impl Normalizer for BagOfWordsNormalizer {
    fn id(&self) -> &str {
        "bow"
    }

    async fn data_source(&self) -> Result<Vec<Record>> {
        let store = self.backend.open(self.source.database_name()).await?;
        let found = store
            .find(
                self.source.collection_name(),
                &Filter::HasFeature(self.extractor.features_field()),
            )
            .await;
        store.close().await;
        Ok(found?)
    }

    async fn get_or_create_metadata(&self, data: &[Record]) -> Result<Value> {
        let store = self.backend.open(self.source.database_name()).await?;
        let result = self.load_or_build(store.as_ref(), data).await;
        store.close().await;
        result
    }

    async fn training_data(
        &self,
        classifier: &dyn Classifier,
        data: &[Record],
        metadata: &Value,
    ) -> Result<Vec<TrainingExample>> {
        let vocabulary = vocabulary(metadata)?;
        let by_fingerprint: BTreeMap<&str, &Record> =
            data.iter().map(|r| (r.fingerprint.as_str(), r)).collect();

        let mut examples = Vec::new();
        for classification in classifier.classifications().await? {
            let text = by_fingerprint
                .get(classification.fingerprint.as_str())
                .and_then(|record| self.text(record));
            match text {
                Some(text) => examples.push(TrainingExample {
                    input: vectorize(text, &vocabulary),
                    output: vec![classification.value],
                }),
                None => debug!(
                    fingerprint = %classification.fingerprint,
                    "classified record has no features, leaving it out"
                ),
            }
        }
        Ok(examples)
    }
}
