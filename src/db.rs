//! SQLite database connection management.
//!
//! Every named database lives in its own file, `<db.dir>/<name>.sqlite`. The
//! file and its parent directories are created on first use and WAL mode is
//! enabled so a scrape loop and a training run can share a database.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::Result;
use crate::store::validate_name;

/// Open a connection pool to the database `name` under `dir`.
///
/// Pools are small and short-lived: callers open one per operation and
/// close it when the operation finishes.
pub async fn connect(dir: &Path, name: &str) -> Result<SqlitePool> {
    validate_name("database", name)?;
    std::fs::create_dir_all(dir)?;

    let db_path = dir.join(format!("{}.sqlite", name));
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?;

    Ok(pool)
}
