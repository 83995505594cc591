//! `SQLite` delivery store.
//!
//! Owns every piece of durable state: scanner identities, agent identities,
//! pairings and the per-target delivery rows. The scheduler's mutual
//! exclusion rests entirely on [`DeliveryStore::claim_next`] and
//! [`DeliveryStore::claim_by_id`] being single statements.

mod models;
mod queries;
mod queries_deliveries;


pub use models::*;
pub use queries::{DEFAULT_ALIAS, DeviceParams, is_valid_eqid};
pub use queries_deliveries::{ACK_TIMEOUT, AckRecord, ClaimParams};
pub use uniscan_core::db::DatabaseError;

use std::path::Path;

use sqlx::{Pool, Sqlite};
use uniscan_core::db::{StoreLocation, connect};

/// Handle to the shared database. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct DeliveryStore {
    pool: Pool<Sqlite>,
}

impl DeliveryStore {
    /// Open or create the database file and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(connect(StoreLocation::File(path)).await?).await
    }

    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(connect(StoreLocation::Memory).await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!("Delivery store schema up to date");
        Ok(Self { pool })
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
