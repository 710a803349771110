//! Persisted model snapshots.
//!
//! A [`ModelSnapshot`] is the immutable result of one training run. Snapshots
//! live in a single collection of the model database, keyed by their
//! fingerprint under a unique index, and are never updated in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::{Record, TrainingExample};
use crate::network::{NetworkOptions, TrainingOptions};
use crate::store::{find_one, Backend, Filter, Store};

/// Everything needed to restore and audit a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub fingerprint: String,
    /// `source:extractor:normalizer:classifier`
    pub name: String,
    pub network_options: NetworkOptions,
    pub training_options: TrainingOptions,
    pub source: String,
    pub extractor: String,
    pub normalizer: String,
    pub classifier: String,
    /// Id of the network factory that can restore `neural_network`.
    pub network: String,
    pub neural_network: Value,
    /// Label identifier to human-readable name.
    pub classifications: BTreeMap<String, String>,
    pub normalization_metadata: Value,
    pub training_data: Vec<TrainingExample>,
    /// Digest of the classification set and data the network was trained on.
    /// Empty for snapshots written before it was recorded.
    #[serde(default)]
    pub training_digest: String,
    pub trained_date: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
}

impl ModelSnapshot {
    fn to_record(&self) -> Result<Record> {
        let mut record = Record::new(self.fingerprint.clone(), serde_json::to_value(self)?);
        record.created_at = self.trained_date;
        Ok(record)
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(serde_json::from_value(record.data)?)
    }
}

/// Ensure snapshot fingerprints are unique in `collection`.
pub async fn create_indexes(store: &dyn Store, collection: &str) -> Result<()> {
    store.create_unique_index(collection).await
}

/// Insert a snapshot.
///
/// Fails with [`Error::ConstraintViolation`] when the fingerprint is already
/// stored and with [`Error::StoreOperation`] when the insert is not
/// acknowledged.
pub async fn save_snapshot(
    backend: &dyn Backend,
    database: &str,
    collection: &str,
    snapshot: &ModelSnapshot,
) -> Result<()> {
    let store = backend.open(database).await?;
    let saved = insert_snapshot(store.as_ref(), collection, snapshot).await;
    store.close().await;
    saved
}

async fn insert_snapshot(
    store: &dyn Store,
    collection: &str,
    snapshot: &ModelSnapshot,
) -> Result<()> {
    create_indexes(store, collection).await?;
    let ack = store.insert(collection, &snapshot.to_record()?).await?;
    if !ack.is_ok() {
        return Err(Error::StoreOperation(format!(
            "snapshot {} was not acknowledged (count {})",
            snapshot.fingerprint, ack.count
        )));
    }
    info!(fingerprint = %snapshot.fingerprint, "saved model snapshot");
    Ok(())
}

/// Look up one snapshot. Fails with [`Error::NotFound`] when absent.
pub async fn get_from_fingerprint(
    backend: &dyn Backend,
    database: &str,
    collection: &str,
    fingerprint: &str,
) -> Result<ModelSnapshot> {
    let store = backend.open(database).await?;
    let found = find_one(store.as_ref(), collection, fingerprint).await;
    store.close().await;

    match found? {
        Some(record) => ModelSnapshot::from_record(record),
        None => Err(Error::NotFound(format!("model snapshot {}", fingerprint))),
    }
}

/// All stored snapshots, oldest first.
pub async fn list_snapshots(
    backend: &dyn Backend,
    database: &str,
    collection: &str,
) -> Result<Vec<ModelSnapshot>> {
    let store = backend.open(database).await?;
    let found = store.find(collection, &Filter::All).await;
    store.close().await;

    found?.into_iter().map(ModelSnapshot::from_record).collect()
}

/// The most recently trained snapshot of the model called `name`.
pub async fn latest_snapshot(
    backend: &dyn Backend,
    database: &str,
    collection: &str,
    name: &str,
) -> Result<Option<ModelSnapshot>> {
    Ok(list_snapshots(backend, database, collection)
        .await?
        .into_iter()
        .filter(|snap| snap.name == name)
        .max_by_key(|snap| snap.trained_date))
}

/// Delete every snapshot and recreate the unique index.
///
/// Returns the number of snapshots removed.
pub async fn reset_database(backend: &dyn Backend, database: &str, collection: &str) -> Result<u64> {
    let store = backend.open(database).await?;
    let reset = async {
        let deleted = store.delete_many(collection).await?;
        create_indexes(store.as_ref(), collection).await?;
        Ok::<_, Error>(deleted)
    }
    .await;
    store.close().await;

    if let Ok(deleted) = &reset {
        info!(database, collection, deleted, "reset model snapshots");
    }
    reset
}
