//! Database schema setup.
//!
//! The schema is the same for every named database: a `documents` table of
//! fingerprinted JSON records and a `features` table holding one feature
//! document per `(record, field)`. Running the migrations is idempotent.

use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::snapshot;
use crate::store::sqlite::SqliteBackend;
use crate::store::Backend;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS features (
            collection TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            field TEXT NOT NULL,
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, fingerprint, field)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_collection_fingerprint ON documents(collection, fingerprint)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Prepare every configured database.
///
/// Creates the snapshot database with its unique fingerprint index and the
/// database of each configured source. Failures here are fatal at startup.
pub async fn init(config: &Config) -> Result<()> {
    let backend = SqliteBackend::new(&config.db.dir);

    let store = backend.open(&config.db.database).await?;
    let indexed = snapshot::create_indexes(store.as_ref(), &config.db.network_collection).await;
    store.close().await;
    indexed?;

    for (name, fs) in &config.sources.filesystem {
        let database = fs.database.as_deref().unwrap_or(name);
        let store = backend.open(database).await?;
        store.close().await;
        info!(source = %name, database, "database ready");
    }

    println!("init");
    println!("  snapshots: {}/{}", config.db.database, config.db.network_collection);
    println!("  sources: {}", config.sources.filesystem.len());
    println!("ok");
    Ok(())
}
