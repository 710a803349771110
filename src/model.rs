//! Trainable model lifecycle.
//!
//! A [`TrainableModel`] composes one source, extractor, normalizer and
//! classifier with a network. It is built through [`ModelBuilder`], trained
//! with [`run`](TrainableModel::run), queried with
//! [`predict`](TrainableModel::predict), and persisted as a
//! [`ModelSnapshot`].
//!
//! ```text
//!              run()                  mark_dirty() / check_staleness()
//! Untrained ─────────▶ Trained ───────────────────────────▶ Dirty
//!     ▲                  ▲  ◀──────────── run() ──────────────┘
//!     └──── reset() ─────┴──────────────── reset() ───────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{Classification, Record, TrainingExample};
use crate::network::{
    FeedForwardFactory, Network, NetworkFactory, NetworkOptions, TrainingOptions, TrainingStatus,
};
use crate::snapshot::{self, ModelSnapshot};
use crate::store::Backend;
use crate::traits::{Classifier, FeatureExtractor, Normalizer, Source};

/// Lifecycle state of a [`TrainableModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    /// No trained network. Predictions are refused.
    Untrained,
    /// Trained on the current classification set and data.
    Trained,
    /// Trained, but the classification set or data has changed since.
    Dirty,
}

/// What a call to [`TrainableModel::run`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// No classifications or no usable training data; nothing changed.
    Skipped,
    Trained {
        fingerprint: String,
        status: TrainingStatus,
    },
}

/// Builder for [`TrainableModel`].
pub struct ModelBuilder {
    source: Option<Arc<dyn Source>>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    normalizer: Option<Arc<dyn Normalizer>>,
    classifier: Option<Arc<dyn Classifier>>,
    backend: Option<Arc<dyn Backend>>,
    factory: Arc<dyn NetworkFactory>,
    network_options: NetworkOptions,
    training_options: TrainingOptions,
    database: String,
    collection: String,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self {
            source: None,
            extractor: None,
            normalizer: None,
            classifier: None,
            backend: None,
            factory: Arc::new(FeedForwardFactory),
            network_options: NetworkOptions::default(),
            training_options: TrainingOptions::default(),
            database: "neuralfm".to_string(),
            collection: "networks".to_string(),
        }
    }
}

impl ModelBuilder {
    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Backend used to persist and load snapshots.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn network_factory(mut self, factory: Arc<dyn NetworkFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn network_options(mut self, options: NetworkOptions) -> Self {
        self.network_options = options;
        self
    }

    pub fn training_options(mut self, options: TrainingOptions) -> Self {
        self.training_options = options;
        self
    }

    /// Database and collection holding snapshots.
    pub fn snapshots_in(mut self, database: impl Into<String>, collection: impl Into<String>) -> Self {
        self.database = database.into();
        self.collection = collection.into();
        self
    }

    pub fn build(self) -> Result<TrainableModel> {
        fn require<T>(value: Option<T>, what: &str) -> Result<T> {
            value.ok_or_else(|| Error::Precondition(format!("model requires a {}", what)))
        }

        Ok(TrainableModel {
            source: require(self.source, "source")?,
            extractor: require(self.extractor, "feature extractor")?,
            normalizer: require(self.normalizer, "normalizer")?,
            classifier: require(self.classifier, "classifier")?,
            backend: require(self.backend, "store backend")?,
            factory: self.factory,
            network_options: self.network_options,
            training_options: self.training_options,
            database: self.database,
            collection: self.collection,
            state: ModelState::Untrained,
            network: None,
            digest: None,
            mapping: BTreeMap::new(),
            metadata: None,
            training_data: Vec::new(),
            trained_date: None,
            created_date: Utc::now(),
            fingerprint: None,
        })
    }
}

/// A model owned by the process that built it.
pub struct TrainableModel {
    source: Arc<dyn Source>,
    extractor: Arc<dyn FeatureExtractor>,
    normalizer: Arc<dyn Normalizer>,
    classifier: Arc<dyn Classifier>,
    backend: Arc<dyn Backend>,
    factory: Arc<dyn NetworkFactory>,
    network_options: NetworkOptions,
    training_options: TrainingOptions,
    database: String,
    collection: String,

    state: ModelState,
    network: Option<Box<dyn Network>>,
    /// Digest of what the network was last trained on.
    digest: Option<String>,
    mapping: BTreeMap<String, String>,
    metadata: Option<Value>,
    training_data: Vec<TrainingExample>,
    trained_date: Option<DateTime<Utc>>,
    created_date: DateTime<Utc>,
    fingerprint: Option<String>,
}

impl TrainableModel {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// `source:extractor:normalizer:classifier`
    pub fn name(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.source.id(),
            self.extractor.id(),
            self.normalizer.id(),
            self.classifier.id()
        )
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    /// True until a successful run, and again once the model goes stale.
    pub fn is_dirty(&self) -> bool {
        self.state != ModelState::Trained
    }

    /// Fingerprint of the last successful training run.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn network_options(&self) -> &NetworkOptions {
        &self.network_options
    }

    pub fn training_options(&self) -> &TrainingOptions {
        &self.training_options
    }

    /// Train on the current classification set.
    ///
    /// With no classifications the call is skipped and the model is left as
    /// it was. The network is created on the first run and trained further
    /// on later runs.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let name = self.name();

        let classifications = self.fetch_classifications().await?;
        if classifications.is_empty() {
            info!(model = %name, "no classifications, skipping training");
            return Ok(RunOutcome::Skipped);
        }

        let normalizer_id = self.normalizer.id().to_string();
        let wrap_normalizer = |e| Error::plugin(format!("normalizer '{}'", normalizer_id), e);

        let data = self.normalizer.data_source().await.map_err(wrap_normalizer)?;
        debug!(model = %name, records = data.len(), "loaded normalizer data source");

        let metadata = self
            .normalizer
            .get_or_create_metadata(&data)
            .await
            .map_err(wrap_normalizer)?;

        let mapping = self
            .classifier
            .classification_mapping(&classifications)
            .await
            .map_err(|e| Error::plugin(format!("classifier '{}'", self.classifier.id()), e))?;

        let training_data = self
            .normalizer
            .training_data(self.classifier.as_ref(), &data, &metadata)
            .await
            .map_err(wrap_normalizer)?;
        if training_data.is_empty() {
            warn!(
                model = %name,
                classifications = classifications.len(),
                "no classified record has features yet, skipping training"
            );
            return Ok(RunOutcome::Skipped);
        }

        let factory = self.factory.clone();
        let options = &self.network_options;
        let network = self.network.get_or_insert_with(|| factory.create(options));

        info!(model = %name, examples = training_data.len(), "training");
        let started = Instant::now();
        let status = network
            .train(&training_data, &self.training_options, &mut |s| {
                info!(model = %name, iterations = s.iterations, error = s.error, "training progress");
            })
            .map_err(|e| Error::plugin(format!("network '{}'", factory.id()), e))?;
        info!(
            model = %name,
            iterations = status.iterations,
            error = status.error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "finished training"
        );

        let trained_date = self.next_trained_date();
        let fingerprint = format!(
            "{}:{}:{}",
            name,
            classifications.len(),
            trained_date.timestamp_millis()
        );

        self.digest = Some(training_digest(&classifications, &data));
        self.mapping = mapping;
        self.metadata = Some(metadata);
        self.training_data = training_data;
        self.trained_date = Some(trained_date);
        self.fingerprint = Some(fingerprint.clone());
        self.state = ModelState::Trained;

        Ok(RunOutcome::Trained { fingerprint, status })
    }

    async fn fetch_classifications(&self) -> Result<Vec<Classification>> {
        self.classifier
            .classifications()
            .await
            .map_err(|e| Error::plugin(format!("classifier '{}'", self.classifier.id()), e))
    }

    /// Millisecond timestamps, strictly increasing across runs of this model.
    fn next_trained_date(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.trained_date {
            Some(prev) if now.timestamp_millis() <= prev.timestamp_millis() => {
                prev + chrono::Duration::milliseconds(1)
            }
            _ => now,
        }
    }

    /// Evaluate the network on a normalized input vector.
    pub fn predict(&self, input: &[f64]) -> Result<Vec<f64>> {
        let network = match (&self.network, self.state) {
            (Some(network), ModelState::Trained | ModelState::Dirty) => network,
            _ => {
                return Err(Error::Precondition(format!(
                    "model {} has not been trained",
                    self.name()
                )))
            }
        };
        if self.state == ModelState::Dirty {
            warn!(model = %self.name(), "predicting with a stale model, classifications or data changed since training");
        }
        network
            .run(input)
            .map_err(|e| Error::plugin(format!("network '{}'", self.factory.id()), e))
    }

    /// [`predict`](Self::predict) thresholded at `binary_thresh`.
    pub fn predict_binary(&self, input: &[f64]) -> Result<Vec<bool>> {
        let thresh = self.network_options.binary_thresh;
        Ok(self.predict(input)?.into_iter().map(|v| v > thresh).collect())
    }

    pub fn mark_dirty(&mut self) {
        if self.state == ModelState::Trained {
            debug!(model = %self.name(), "marked dirty");
            self.state = ModelState::Dirty;
        }
    }

    /// Compare the current classification set and normalizer data against
    /// what the network was trained on, and mark the model dirty when either
    /// changed. Returns whether the model is dirty.
    pub async fn check_staleness(&mut self) -> Result<bool> {
        if self.state == ModelState::Trained {
            let classifications = self.fetch_classifications().await?;
            let data = self
                .normalizer
                .data_source()
                .await
                .map_err(|e| Error::plugin(format!("normalizer '{}'", self.normalizer.id()), e))?;
            let current = training_digest(&classifications, &data);
            if self.digest.as_deref() != Some(current.as_str()) {
                self.mark_dirty();
            }
        }
        Ok(self.is_dirty())
    }

    /// Drop the network and everything learned from the last run.
    pub fn reset(&mut self) {
        self.network = None;
        self.digest = None;
        self.mapping.clear();
        self.metadata = None;
        self.training_data.clear();
        self.trained_date = None;
        self.fingerprint = None;
        self.state = ModelState::Untrained;
    }

    /// Serializable form of the trained model.
    pub fn snapshot(&self) -> Result<ModelSnapshot> {
        let network = self
            .network
            .as_ref()
            .filter(|_| self.state != ModelState::Untrained)
            .ok_or_else(|| Error::Precondition("model has no trained network".to_string()))?;
        let (Some(fingerprint), Some(trained_date)) = (&self.fingerprint, self.trained_date) else {
            return Err(Error::Precondition(
                "model has not been trained on any classifications".to_string(),
            ));
        };

        Ok(ModelSnapshot {
            fingerprint: fingerprint.clone(),
            name: self.name(),
            network_options: self.network_options.clone(),
            training_options: self.training_options.clone(),
            source: self.source.id().to_string(),
            extractor: self.extractor.id().to_string(),
            normalizer: self.normalizer.id().to_string(),
            classifier: self.classifier.id().to_string(),
            network: self.factory.id().to_string(),
            neural_network: network
                .to_json()
                .map_err(|e| Error::plugin(format!("network '{}'", self.factory.id()), e))?,
            classifications: self.mapping.clone(),
            normalization_metadata: self.metadata.clone().unwrap_or(Value::Null),
            training_data: self.training_data.clone(),
            training_digest: self.digest.clone().unwrap_or_default(),
            trained_date,
            created_date: self.created_date,
        })
    }

    /// Persist the current snapshot and return it.
    pub async fn save(&self) -> Result<ModelSnapshot> {
        let snapshot = self.snapshot()?;
        snapshot::save_snapshot(self.backend.as_ref(), &self.database, &self.collection, &snapshot)
            .await?;
        Ok(snapshot)
    }

    /// Fetch a stored snapshot from this model's snapshot collection.
    pub async fn get_from_fingerprint(&self, fingerprint: &str) -> Result<ModelSnapshot> {
        snapshot::get_from_fingerprint(
            self.backend.as_ref(),
            &self.database,
            &self.collection,
            fingerprint,
        )
        .await
    }

    /// Load the most recent snapshot saved for this model, if there is one.
    /// Returns its fingerprint.
    pub async fn load_latest(&mut self) -> Result<Option<String>> {
        let latest = snapshot::latest_snapshot(
            self.backend.as_ref(),
            &self.database,
            &self.collection,
            &self.name(),
        )
        .await?;
        match latest {
            Some(snap) => {
                self.load_snapshot(&snap)?;
                Ok(Some(snap.fingerprint))
            }
            None => Ok(None),
        }
    }

    /// Restore a stored snapshot into this model. The model ends up Trained.
    ///
    /// The snapshot must come from the same pipeline and network kind.
    pub fn load_snapshot(&mut self, snapshot: &ModelSnapshot) -> Result<()> {
        if snapshot.name != self.name() {
            return Err(Error::Precondition(format!(
                "snapshot {} belongs to {}, not {}",
                snapshot.fingerprint,
                snapshot.name,
                self.name()
            )));
        }
        if snapshot.network != self.factory.id() {
            return Err(Error::Precondition(format!(
                "snapshot {} needs network '{}', model uses '{}'",
                snapshot.fingerprint,
                snapshot.network,
                self.factory.id()
            )));
        }

        let network = self
            .factory
            .restore(&snapshot.neural_network)
            .map_err(|e| Error::plugin(format!("network '{}'", self.factory.id()), e))?;

        // Without a recorded digest the model can never be shown current.
        self.digest = Some(snapshot.training_digest.clone()).filter(|d| !d.is_empty());
        self.network = Some(network);
        self.network_options = snapshot.network_options.clone();
        self.training_options = snapshot.training_options.clone();
        self.mapping = snapshot.classifications.clone();
        self.metadata = Some(snapshot.normalization_metadata.clone());
        self.training_data = snapshot.training_data.clone();
        self.trained_date = Some(snapshot.trained_date);
        self.created_date = snapshot.created_date;
        self.fingerprint = Some(snapshot.fingerprint.clone());
        self.state = ModelState::Trained;
        info!(fingerprint = %snapshot.fingerprint, "loaded model snapshot");
        Ok(())
    }
}

/// SHA-256 over the classification set and the fingerprints of the data,
/// both order-independent.
fn training_digest(classifications: &[Classification], data: &[Record]) -> String {
    let mut labels: Vec<String> = classifications
        .iter()
        .map(|c| format!("{}\t{}\t{}", c.fingerprint, c.label, c.value))
        .collect();
    labels.sort();
    let mut fingerprints: Vec<&str> = data.iter().map(|r| r.fingerprint.as_str()).collect();
    fingerprints.sort_unstable();

    let mut hasher = Sha256::new();
    for line in &labels {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"--\n");
    for fingerprint in fingerprints {
        hasher.update(fingerprint.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
