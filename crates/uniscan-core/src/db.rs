//! `SQLite` plumbing shared by every process that opens the delivery store.
//!
//! All stored timestamps are Unix milliseconds; [`unix_millis`] is the one
//! clock the store and gateway read.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// Writers from several processes share one file; give them time to queue.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_POOL_SIZE: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("cannot create database directory: {0}")]
    Io(String),

    #[error("cannot open database: {0}")]
    Connection(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(e.to_string())
    }
}

/// Where a store lives.
#[derive(Debug, Clone, Copy)]
pub enum StoreLocation<'a> {
    File(&'a Path),
    /// Private to this process; gone when the pool closes.
    Memory,
}

/// Connect a pool for `location`.
///
/// File databases run in WAL mode so the gateway and any number of
/// schedulers can share them. An in-memory database is a single connection,
/// since every `:memory:` connection is its own database.
pub async fn connect(location: StoreLocation<'_>) -> Result<Pool<Sqlite>, DatabaseError> {
    let (options, max_connections) = match location {
        StoreLocation::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            (options, FILE_POOL_SIZE)
        }
        StoreLocation::Memory => {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            (options, 1)
        }
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options.foreign_keys(true).busy_timeout(BUSY_TIMEOUT))
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    if let StoreLocation::File(path) = location {
        info!(path = %path.display(), "Database opened");
    }
    Ok(pool)
}

/// Current time as Unix milliseconds.
#[allow(clippy::cast_possible_truncation)]
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Convert a policy duration to the millisecond offsets used in queries.
#[allow(clippy::cast_possible_truncation)]
pub const fn duration_millis(d: Duration) -> i64 {
    d.as_millis() as i64
}
