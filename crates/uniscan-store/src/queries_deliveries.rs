//! Delivery lifecycle queries: creation, leasing, dispatch and acks.

use tracing::debug;
use uniscan_core::DispatchPolicy;
use uniscan_core::db::{DatabaseError, duration_millis, unix_millis};

use crate::DeliveryStore;
use crate::models::Delivery;

/// Error recorded when a `sent` delivery exhausts its server attempts.
pub const ACK_TIMEOUT: &str = "ACK_TIMEOUT";

/// Rows a scheduler may lease. Binds: `now`, `now - ack_timeout`, `max_attempts`.
///
/// Expired `dispatching` rows are eligible so a crashed scheduler's leases
/// come back once `lock_until` passes.
const ELIGIBLE: &str = "((status IN ('pending', 'dispatching') \
       AND (lock_until IS NULL OR lock_until <= ?)) \
     OR (status = 'sent' AND last_sent_at <= ? AND server_attempt < ?))";

/// Lease parameters for one claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimParams<'a> {
    pub owner: &'a str,
    pub now: i64,
    pub lease_ms: i64,
    pub ack_timeout_ms: i64,
    pub max_attempts: i64,
}

impl<'a> ClaimParams<'a> {
    pub fn from_policy(owner: &'a str, policy: &DispatchPolicy) -> Self {
        Self {
            owner,
            now: unix_millis(),
            lease_ms: duration_millis(policy.lease()),
            ack_timeout_ms: duration_millis(policy.ack_timeout()),
            max_attempts: policy.max_attempts,
        }
    }

    #[must_use]
    pub const fn at(mut self, now: i64) -> Self {
        self.now = now;
        self
    }
}

/// Agent-reported outcome for [`DeliveryStore::record_ack`].
#[derive(Debug, Clone, Copy)]
pub struct AckRecord<'a> {
    pub ok: bool,
    pub error: Option<&'a str>,
    pub agent_attempt: i64,
    pub input_method: Option<&'a str>,
    pub duration_ms: i64,
}

impl DeliveryStore {
    // =========================================================================
    // Creation and lookup
    // =========================================================================

    /// Create one `pending` delivery per target agent, atomically.
    pub async fn create_scan(
        &self,
        scan_id: &str,
        eqid: &str,
        barcode: &str,
        pc_ids: &[String],
    ) -> Result<Vec<Delivery>, DatabaseError> {
        let now = unix_millis();
        let mut tx = self.pool().begin().await?;
        let mut deliveries = Vec::with_capacity(pc_ids.len());

        for pc_id in pc_ids {
            let delivery = sqlx::query_as::<_, Delivery>(
                "INSERT INTO scan_deliveries
                     (id, scan_id, eqid, pc_id, barcode, status, server_attempt, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?)
                 RETURNING *",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(scan_id)
            .bind(eqid)
            .bind(pc_id)
            .bind(barcode)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            deliveries.push(delivery);
        }

        tx.commit().await?;
        Ok(deliveries)
    }

    pub async fn get_delivery(&self, id: &str) -> Result<Option<Delivery>, DatabaseError> {
        let delivery = sqlx::query_as::<_, Delivery>("SELECT * FROM scan_deliveries WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(delivery)
    }

    pub async fn deliveries_for_scan(&self, scan_id: &str) -> Result<Vec<Delivery>, DatabaseError> {
        let deliveries = sqlx::query_as::<_, Delivery>(
            "SELECT * FROM scan_deliveries WHERE scan_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(scan_id)
        .fetch_all(self.pool())
        .await?;
        Ok(deliveries)
    }

    /// Most recent delivery of a scan to one agent.
    pub async fn latest_delivery_for(
        &self,
        scan_id: &str,
        pc_id: &str,
    ) -> Result<Option<Delivery>, DatabaseError> {
        let delivery = sqlx::query_as::<_, Delivery>(
            "SELECT * FROM scan_deliveries WHERE scan_id = ? AND pc_id = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(scan_id)
        .bind(pc_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(delivery)
    }

    // =========================================================================
    // Leasing
    // =========================================================================

    /// Lease the oldest eligible delivery.
    ///
    /// Selection and lease happen in one `UPDATE ... RETURNING`, so two
    /// schedulers on the same database can never both win the same row.
    pub async fn claim_next(
        &self,
        params: &ClaimParams<'_>,
    ) -> Result<Option<Delivery>, DatabaseError> {
        let sql = format!(
            "UPDATE scan_deliveries
             SET status = 'dispatching', lock_owner = ?, lock_until = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM scan_deliveries WHERE {ELIGIBLE}
                 ORDER BY created_at ASC, rowid ASC LIMIT 1
             ) AND {ELIGIBLE}
             RETURNING *"
        );
        let claimed = bind_eligible(
            bind_eligible(
                sqlx::query_as::<_, Delivery>(&sql)
                    .bind(params.owner)
                    .bind(params.now + params.lease_ms)
                    .bind(params.now),
                params,
            ),
            params,
        )
        .fetch_optional(self.pool())
        .await?;

        if let Some(d) = &claimed {
            debug!(delivery_id = %d.id, owner = params.owner, "Delivery leased");
        }
        Ok(claimed)
    }

    /// Lease a specific delivery if it is eligible right now.
    pub async fn claim_by_id(
        &self,
        id: &str,
        params: &ClaimParams<'_>,
    ) -> Result<Option<Delivery>, DatabaseError> {
        let sql = format!(
            "UPDATE scan_deliveries
             SET status = 'dispatching', lock_owner = ?, lock_until = ?, updated_at = ?
             WHERE id = ? AND {ELIGIBLE}
             RETURNING *"
        );
        let claimed = bind_eligible(
            sqlx::query_as::<_, Delivery>(&sql)
                .bind(params.owner)
                .bind(params.now + params.lease_ms)
                .bind(params.now)
                .bind(id),
            params,
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(claimed)
    }

    /// Give a lease back so the row is immediately eligible again.
    ///
    /// Only applies while the row is still `dispatching` under `owner`; a row
    /// the gateway has already moved to `sent` is left alone.
    pub async fn release_lease(&self, id: &str, owner: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE scan_deliveries
             SET status = 'pending', lock_owner = NULL, lock_until = NULL, updated_at = ?
             WHERE id = ? AND status = 'dispatching' AND lock_owner = ?",
        )
        .bind(unix_millis())
        .bind(id)
        .bind(owner)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Dispatch side effects
    // =========================================================================

    /// Record a push to the agent: bump `server_attempt` and move to `sent`.
    /// Returns `None` for missing or terminal rows.
    pub async fn mark_sent(&self, id: &str) -> Result<Option<Delivery>, DatabaseError> {
        let now = unix_millis();
        let delivery = sqlx::query_as::<_, Delivery>(
            "UPDATE scan_deliveries
             SET status = 'sent', server_attempt = server_attempt + 1, last_sent_at = ?,
                 lock_owner = NULL, lock_until = NULL, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'dispatching', 'sent')
             RETURNING *",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(delivery)
    }

    /// Undo [`mark_sent`](Self::mark_sent) after the socket write failed. The
    /// attempt is not counted.
    pub async fn requeue(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE scan_deliveries
             SET status = 'pending', server_attempt = MAX(server_attempt - 1, 0),
                 last_sent_at = NULL, lock_owner = NULL, lock_until = NULL, updated_at = ?
             WHERE id = ? AND status = 'sent'",
        )
        .bind(unix_millis())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store an agent ack. An `ack_ok` row is never downgraded; `None` is
    /// returned in that case and for missing rows.
    pub async fn record_ack(
        &self,
        id: &str,
        ack: &AckRecord<'_>,
    ) -> Result<Option<Delivery>, DatabaseError> {
        let status = if ack.ok { "ack_ok" } else { "ack_fail" };
        let delivery = sqlx::query_as::<_, Delivery>(
            "UPDATE scan_deliveries
             SET status = ?, ack_ok = ?, ack_error = ?, agent_attempt = ?, input_method = ?,
                 duration_ms = ?, lock_owner = NULL, lock_until = NULL, updated_at = ?
             WHERE id = ? AND status != 'ack_ok'
             RETURNING *",
        )
        .bind(status)
        .bind(ack.ok)
        .bind(if ack.ok { None } else { ack.error })
        .bind(ack.agent_attempt)
        .bind(ack.input_method)
        .bind(ack.duration_ms)
        .bind(unix_millis())
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(delivery)
    }

    /// Finalise a non-terminal delivery as `ack_fail` with `error`.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
    ) -> Result<Option<Delivery>, DatabaseError> {
        let delivery = sqlx::query_as::<_, Delivery>(
            "UPDATE scan_deliveries
             SET status = 'ack_fail', ack_ok = 0, ack_error = ?,
                 lock_owner = NULL, lock_until = NULL, updated_at = ?
             WHERE id = ? AND status NOT IN ('ack_ok', 'ack_fail')
             RETURNING *",
        )
        .bind(error)
        .bind(unix_millis())
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(delivery)
    }

    /// Fail every `sent` delivery whose ack window has passed on its last
    /// allowed attempt.
    pub async fn fail_exhausted(
        &self,
        now: i64,
        ack_timeout_ms: i64,
        max_attempts: i64,
    ) -> Result<Vec<Delivery>, DatabaseError> {
        let failed = sqlx::query_as::<_, Delivery>(
            "UPDATE scan_deliveries
             SET status = 'ack_fail', ack_ok = 0, ack_error = ?, updated_at = ?
             WHERE status = 'sent' AND last_sent_at <= ? AND server_attempt >= ?
             RETURNING *",
        )
        .bind(ACK_TIMEOUT)
        .bind(now)
        .bind(now - ack_timeout_ms)
        .bind(max_attempts)
        .fetch_all(self.pool())
        .await?;
        Ok(failed)
    }
}

type DeliveryQuery<'q> = sqlx::query::QueryAs<
    'q,
    sqlx::Sqlite,
    Delivery,
    <sqlx::Sqlite as sqlx::Database>::Arguments<'q>,
>;

fn bind_eligible<'q>(query: DeliveryQuery<'q>, params: &ClaimParams<'_>) -> DeliveryQuery<'q> {
    query
        .bind(params.now)
        .bind(params.now - params.ack_timeout_ms)
        .bind(params.max_attempts)
}
