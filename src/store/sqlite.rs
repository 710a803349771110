//! SQLite-backed [`Store`] implementation.
//!
//! Records are rows of the `documents` table with their JSON payload in
//! `body`; feature documents are rows of `features`. Feature maps are
//! assembled in SQL with `json_group_object`, so a `find` is one statement.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::Record;

use super::{validate_name, Ack, Backend, Filter, Store};

/// Opens one SQLite file per named database under `dir`.
pub struct SqliteBackend {
    dir: PathBuf,
}

impl SqliteBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn open(&self, database: &str) -> Result<Box<dyn Store>> {
        let pool = db::connect(&self.dir, database).await?;
        if let Err(e) = migrate::run_migrations(&pool).await {
            pool.close().await;
            return Err(e);
        }
        Ok(Box::new(SqliteStore::new(database, pool)))
    }
}

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    name: String,
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(name: impl Into<String>, pool: SqlitePool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

const FEATURE_PRESENT: &str = "EXISTS (SELECT 1 FROM features f WHERE f.collection = d.collection AND f.fingerprint = d.fingerprint AND f.field = ? AND f.body <> 'null')";

#[async_trait]
impl Store for SqliteStore {
    fn database(&self) -> &str {
        &self.name
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        let (predicate, param) = match filter {
            Filter::All => ("1 = 1".to_string(), None),
            Filter::MissingFeature(field) => {
                (format!("NOT {}", FEATURE_PRESENT), Some(field.clone()))
            }
            Filter::HasFeature(field) => (FEATURE_PRESENT.to_string(), Some(field.clone())),
            Filter::Fingerprints(fps) => (
                "d.fingerprint IN (SELECT value FROM json_each(?))".to_string(),
                Some(serde_json::to_string(fps)?),
            ),
        };

        let sql = format!(
            r#"
            SELECT d.fingerprint, d.body, d.created_at,
                   (SELECT json_group_object(f.field, json(f.body))
                    FROM features f
                    WHERE f.collection = d.collection AND f.fingerprint = d.fingerprint) AS features
            FROM documents d
            WHERE d.collection = ? AND {}
            ORDER BY d.id ASC
            "#,
            predicate
        );

        let mut query = sqlx::query(&sql).bind(collection);
        if let Some(param) = param {
            query = query.bind(param);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<Record> {
                let body: String = row.get("body");
                let features: Option<String> = row.get("features");
                let features: BTreeMap<String, Value> = match features {
                    Some(f) => serde_json::from_str(&f)?,
                    None => BTreeMap::new(),
                };
                Ok(Record {
                    fingerprint: row.get("fingerprint"),
                    data: serde_json::from_str(&body)?,
                    features,
                    created_at: from_millis(row.get("created_at")),
                })
            })
            .collect()
    }

    async fn set_feature(
        &self,
        collection: &str,
        fingerprint: &str,
        field: &str,
        value: &Value,
    ) -> Result<Ack> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO features (collection, fingerprint, field, body, updated_at)
            SELECT ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM documents WHERE collection = ? AND fingerprint = ?)
            ON CONFLICT(collection, fingerprint, field) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(fingerprint)
        .bind(field)
        .bind(serde_json::to_string(value)?)
        .bind(now)
        .bind(collection)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;

        Ok(Ack::new(result.rows_affected()))
    }

    async fn insert(&self, collection: &str, record: &Record) -> Result<Ack> {
        validate_name("collection", collection)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO documents (collection, fingerprint, body, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(&record.fingerprint)
        .bind(serde_json::to_string(&record.data)?)
        .bind(record.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await;

        let result = match inserted {
            Ok(result) => result,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(Error::ConstraintViolation {
                    collection: collection.to_string(),
                    fingerprint: record.fingerprint.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now().timestamp_millis();
        for (field, value) in &record.features {
            sqlx::query(
                "INSERT INTO features (collection, fingerprint, field, body, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(collection)
            .bind(&record.fingerprint)
            .bind(field)
            .bind(serde_json::to_string(value)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Ack::new(result.rows_affected()))
    }

    async fn delete_many(&self, collection: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM features WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    async fn create_unique_index(&self, collection: &str) -> Result<()> {
        validate_name("collection", collection)?;
        // Partial index: uniqueness is per collection.
        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"uniq_fingerprint_{c}\" ON documents(fingerprint) WHERE collection = '{c}'",
            c = collection
        );
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(Error::ConstraintViolation {
                    collection: collection.to_string(),
                    fingerprint: "<existing duplicates>".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
