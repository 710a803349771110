//! Storage abstraction for neuralfm.
//!
//! A [`Backend`] hands out one [`Store`] connection per named database. Every
//! pipeline operation opens its own connection, uses it, and closes it before
//! returning, whether the operation succeeded or not.
//!
//! The store is a small document store: each collection holds records keyed
//! by fingerprint, and every record carries an explicit map of feature
//! documents keyed by extractor field name.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`find`](Store::find) | Records in a collection matching a [`Filter`] |
//! | [`set_feature`](Store::set_feature) | Atomically attach one feature document |
//! | [`insert`](Store::insert) | Insert a new record |
//! | [`delete_many`](Store::delete_many) | Drop every record of a collection |
//! | [`create_unique_index`](Store::create_unique_index) | Enforce unique fingerprints |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::Record;

/// Predicate used by [`Store::find`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every record of the collection.
    All,
    /// Records whose feature document under this field is absent or null.
    MissingFeature(String),
    /// Records with a non-null feature document under this field.
    HasFeature(String),
    /// Records whose fingerprint is in the list.
    Fingerprints(Vec<String>),
}

impl Filter {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::MissingFeature(field) => !record.has_feature(field),
            Filter::HasFeature(field) => record.has_feature(field),
            Filter::Fingerprints(fps) => fps.iter().any(|fp| fp == &record.fingerprint),
        }
    }
}

/// Write acknowledgment returned by the store.
///
/// Only a positive count is a success; anything else is treated as a failed
/// write by the callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub count: u64,
}

impl Ack {
    pub fn new(count: u64) -> Self {
        Self { count }
    }

    pub fn is_ok(&self) -> bool {
        self.count > 0
    }
}

/// A connection to one named database.
#[async_trait]
pub trait Store: Send + Sync {
    /// Name of the database this connection is bound to.
    fn database(&self) -> &str;

    /// Return the records of `collection` matching `filter`, in insertion order.
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>>;

    /// Attach `value` under `field` on the record identified by `fingerprint`.
    ///
    /// The write is atomic per record. A missing record yields a zero ack.
    async fn set_feature(
        &self,
        collection: &str,
        fingerprint: &str,
        field: &str,
        value: &Value,
    ) -> Result<Ack>;

    /// Insert a record. Fails with
    /// [`ConstraintViolation`](crate::error::Error::ConstraintViolation) when a
    /// unique index on the collection already holds the fingerprint.
    async fn insert(&self, collection: &str, record: &Record) -> Result<Ack>;

    /// Delete every record (and its features) in `collection`.
    async fn delete_many(&self, collection: &str) -> Result<u64>;

    /// Ensure fingerprints in `collection` are unique. Idempotent.
    async fn create_unique_index(&self, collection: &str) -> Result<()>;

    /// Release the connection.
    async fn close(&self) {}
}

/// Factory for per-database [`Store`] connections.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn open(&self, database: &str) -> Result<Box<dyn Store>>;
}

/// Find one record by fingerprint.
pub async fn find_one(
    store: &dyn Store,
    collection: &str,
    fingerprint: &str,
) -> Result<Option<Record>> {
    let mut found = store
        .find(
            collection,
            &Filter::Fingerprints(vec![fingerprint.to_string()]),
        )
        .await?;
    Ok(if found.is_empty() {
        None
    } else {
        Some(found.swap_remove(0))
    })
}

/// Collection and database names end up in SQL identifiers, so they are
/// restricted to ASCII alphanumerics, `_` and `-`.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(crate::error::Error::Config(format!(
            "invalid {} name '{}': use letters, digits, '_' or '-'",
            kind, name
        )))
    }
}
