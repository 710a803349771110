//! In-memory [`Backend`] for tests and dry runs.
//!
//! Databases live behind `std::sync::RwLock`s and survive for the lifetime of
//! the backend, so reopening a database sees earlier writes. The backend
//! counts open connections, which lets tests observe that every operation
//! released the connection it acquired.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::Record;

use super::{validate_name, Ack, Backend, Filter, Store};

#[derive(Default)]
struct MemoryCollection {
    records: Vec<Record>,
    unique: bool,
}

#[derive(Default)]
struct MemoryDatabase {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

/// In-memory backend. Cheap to create; one per test.
#[derive(Default)]
pub struct MemoryBackend {
    databases: RwLock<HashMap<String, Arc<MemoryDatabase>>>,
    open: Arc<AtomicUsize>,
    opened_total: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Connections opened since the backend was created.
    pub fn opened_total(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(&self, database: &str) -> Result<Box<dyn Store>> {
        validate_name("database", database)?;
        let db = {
            let mut dbs = self.databases.write().unwrap();
            dbs.entry(database.to_string()).or_default().clone()
        };
        self.open.fetch_add(1, Ordering::SeqCst);
        self.opened_total.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStore {
            name: database.to_string(),
            db,
            open: self.open.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection handed out by [`MemoryBackend`].
///
/// Dropping the connection releases it as well, so a panicking caller still
/// gives it back.
pub struct MemoryStore {
    name: String,
    db: Arc<MemoryDatabase>,
    open: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MemoryStore {
    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn database(&self) -> &str {
        &self.name
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        let collections = self.db.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|c| {
                c.records
                    .iter()
                    .filter(|r| filter.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_feature(
        &self,
        collection: &str,
        fingerprint: &str,
        field: &str,
        value: &Value,
    ) -> Result<Ack> {
        let mut collections = self.db.collections.write().unwrap();
        let record = collections
            .get_mut(collection)
            .and_then(|c| c.records.iter_mut().find(|r| r.fingerprint == fingerprint));
        match record {
            Some(record) => {
                record.features.insert(field.to_string(), value.clone());
                Ok(Ack::new(1))
            }
            None => Ok(Ack::new(0)),
        }
    }

    async fn insert(&self, collection: &str, record: &Record) -> Result<Ack> {
        validate_name("collection", collection)?;
        let mut collections = self.db.collections.write().unwrap();
        let coll = collections.entry(collection.to_string()).or_default();
        if coll.unique
            && coll
                .records
                .iter()
                .any(|r| r.fingerprint == record.fingerprint)
        {
            return Err(Error::ConstraintViolation {
                collection: collection.to_string(),
                fingerprint: record.fingerprint.clone(),
            });
        }
        coll.records.push(record.clone());
        Ok(Ack::new(1))
    }

    async fn delete_many(&self, collection: &str) -> Result<u64> {
        let mut collections = self.db.collections.write().unwrap();
        Ok(collections
            .get_mut(collection)
            .map(|c| {
                let n = c.records.len() as u64;
                c.records.clear();
                n
            })
            .unwrap_or(0))
    }

    async fn create_unique_index(&self, collection: &str) -> Result<()> {
        validate_name("collection", collection)?;
        let mut collections = self.db.collections.write().unwrap();
        let coll = collections.entry(collection.to_string()).or_default();
        let mut seen = std::collections::HashSet::new();
        for r in &coll.records {
            if !seen.insert(r.fingerprint.as_str()) {
                return Err(Error::ConstraintViolation {
                    collection: collection.to_string(),
                    fingerprint: r.fingerprint.clone(),
                });
            }
        }
        coll.unique = true;
        Ok(())
    }

    async fn close(&self) {
        self.release();
    }
}
