//! Identity and pairing queries.

use rand::Rng;
use uniscan_core::db::unix_millis;

use crate::DeliveryStore;
use crate::models::{App, Device, Pairing};
use uniscan_core::db::DatabaseError;

const EQID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const EQID_LEN: usize = 6;
const EQID_RETRIES: usize = 16;

pub const DEFAULT_ALIAS: &str = "SCANNER";

/// Parameters for [`DeliveryStore::upsert_device`].
pub struct DeviceParams<'a> {
    pub pc_id: &'a str,
    pub group: &'a str,
    pub device_name: &'a str,
    pub machine_id: &'a str,
}

/// Whether `eqid` has the shape [`DeliveryStore::allocate_app`] produces:
/// six characters of `A-Z0-9`.
pub fn is_valid_eqid(eqid: &str) -> bool {
    eqid.len() == EQID_LEN && eqid.bytes().all(|b| EQID_ALPHABET.contains(&b))
}

fn random_eqid() -> String {
    let mut rng = rand::thread_rng();
    (0..EQID_LEN)
        .map(|_| char::from(EQID_ALPHABET[rng.gen_range(0..EQID_ALPHABET.len())]))
        .collect()
}

impl DeliveryStore {
    // =========================================================================
    // Scanner identities
    // =========================================================================

    /// Insert a scanner identity. Returns `None` if the eqid is already taken.
    pub async fn create_app(&self, eqid: &str, alias: &str) -> Result<Option<App>, DatabaseError> {
        let now = unix_millis();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO apps (eqid, alias, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(eqid)
        .bind(alias)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_app(eqid).await
    }

    pub async fn get_app(&self, eqid: &str) -> Result<Option<App>, DatabaseError> {
        let app = sqlx::query_as::<_, App>("SELECT * FROM apps WHERE eqid = ?")
            .bind(eqid)
            .fetch_optional(self.pool())
            .await?;
        Ok(app)
    }

    /// Allocate a fresh random eqid.
    pub async fn allocate_app(&self, alias: &str) -> Result<App, DatabaseError> {
        for _ in 0..EQID_RETRIES {
            if let Some(app) = self.create_app(&random_eqid(), alias).await? {
                return Ok(app);
            }
        }
        Err(DatabaseError::Conflict(
            "could not allocate an unused eqid".to_string(),
        ))
    }

    /// Resolve a scanner identity, creating it when unknown. Without an eqid
    /// a new one is allocated. A supplied alias replaces the stored one.
    pub async fn resolve_app(
        &self,
        eqid: Option<&str>,
        alias: Option<&str>,
    ) -> Result<App, DatabaseError> {
        let Some(eqid) = eqid.map(str::trim).filter(|e| !e.is_empty()) else {
            return self.allocate_app(alias.unwrap_or(DEFAULT_ALIAS)).await;
        };

        if let Some(app) = self
            .create_app(eqid, alias.unwrap_or(DEFAULT_ALIAS))
            .await?
        {
            return Ok(app);
        }

        if let Some(alias) = alias {
            sqlx::query("UPDATE apps SET alias = ?, updated_at = ? WHERE eqid = ?")
                .bind(alias)
                .bind(unix_millis())
                .bind(eqid)
                .execute(self.pool())
                .await?;
        }

        self.get_app(eqid)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("App {eqid}")))
    }

    // =========================================================================
    // Agent identities
    // =========================================================================

    /// Create or refresh an agent identity and mark it online.
    pub async fn upsert_device(&self, params: &DeviceParams<'_>) -> Result<Device, DatabaseError> {
        let now = unix_millis();
        let device = sqlx::query_as::<_, Device>(
            "INSERT INTO pc_devices
                 (pc_id, group_name, device_name, machine_id, online, last_seen_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, 1, ?, ?, ?)
             ON CONFLICT (pc_id) DO UPDATE SET
                 group_name = excluded.group_name,
                 device_name = excluded.device_name,
                 machine_id = excluded.machine_id,
                 online = 1,
                 last_seen_at = excluded.last_seen_at,
                 updated_at = excluded.updated_at
             RETURNING *",
        )
        .bind(params.pc_id)
        .bind(params.group)
        .bind(params.device_name)
        .bind(params.machine_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(device)
    }

    pub async fn set_device_online(&self, pc_id: &str, online: bool) -> Result<bool, DatabaseError> {
        let now = unix_millis();
        let result = sqlx::query(
            "UPDATE pc_devices SET online = ?, last_seen_at = ?, updated_at = ? WHERE pc_id = ?",
        )
        .bind(online)
        .bind(now)
        .bind(now)
        .bind(pc_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_device(&self, pc_id: &str) -> Result<Option<Device>, DatabaseError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM pc_devices WHERE pc_id = ?")
            .bind(pc_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(device)
    }

    // =========================================================================
    // Pairings
    // =========================================================================

    /// Idempotently create or update a pairing.
    pub async fn upsert_pairing(
        &self,
        eqid: &str,
        pc_id: &str,
        enabled: bool,
    ) -> Result<Pairing, DatabaseError> {
        let now = unix_millis();
        let pairing = sqlx::query_as::<_, Pairing>(
            "INSERT INTO pairings (eqid, pc_id, enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (eqid, pc_id) DO UPDATE SET
                 enabled = excluded.enabled,
                 updated_at = excluded.updated_at
             RETURNING *",
        )
        .bind(eqid)
        .bind(pc_id)
        .bind(enabled)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(pairing)
    }

    pub async fn get_pairing(
        &self,
        eqid: &str,
        pc_id: &str,
    ) -> Result<Option<Pairing>, DatabaseError> {
        let pairing =
            sqlx::query_as::<_, Pairing>("SELECT * FROM pairings WHERE eqid = ? AND pc_id = ?")
                .bind(eqid)
                .bind(pc_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(pairing)
    }

    pub async fn list_pairings(&self, eqid: &str) -> Result<Vec<Pairing>, DatabaseError> {
        let pairings = sqlx::query_as::<_, Pairing>(
            "SELECT * FROM pairings WHERE eqid = ? ORDER BY created_at ASC, pc_id ASC",
        )
        .bind(eqid)
        .fetch_all(self.pool())
        .await?;
        Ok(pairings)
    }

    /// Agents currently enabled for a scanner, in pairing order.
    pub async fn enabled_targets(&self, eqid: &str) -> Result<Vec<String>, DatabaseError> {
        let targets: Vec<(String,)> = sqlx::query_as(
            "SELECT pc_id FROM pairings WHERE eqid = ? AND enabled = 1
             ORDER BY created_at ASC, pc_id ASC",
        )
        .bind(eqid)
        .fetch_all(self.pool())
        .await?;
        Ok(targets.into_iter().map(|(pc_id,)| pc_id).collect())
    }

    /// Number of scanners with an enabled pairing to this agent.
    pub async fn count_enabled_scanners(&self, pc_id: &str) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pairings WHERE pc_id = ? AND enabled = 1")
                .bind(pc_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
