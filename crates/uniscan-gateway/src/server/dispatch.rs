//! Scheduler-facing side of the gateway: pushing leased deliveries to
//! agents, status snapshots for scanners and the ack watchdog.

use std::collections::BTreeSet;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use uniscan_core::db::{duration_millis, unix_millis};
use uniscan_proto::events::{ScanJobUpdate, TargetStatus};
use uniscan_proto::{DispatchOutcome, EventKind, SkipReason, iso_millis};
use uniscan_store::{ACK_TIMEOUT, Delivery};

use super::Gateway;
use super::handler::event;
use crate::error::GatewayError;

const SCAN_KIND: &str = "barcode";

pub(super) fn snapshot(scan_id: &str, eqid: &str, barcode: &str, deliveries: &[Delivery]) -> ScanJobUpdate {
    ScanJobUpdate {
        job_id: scan_id.to_string(),
        eqid: eqid.to_string(),
        kind: SCAN_KIND.to_string(),
        barcode: barcode.to_string(),
        targets: deliveries
            .iter()
            .map(|d| TargetStatus {
                pc_id: d.pc_id.clone(),
                delivery_id: d.id.clone(),
                status: d.status.to_string(),
                attempt: d.server_attempt,
                updated_at: iso_millis(d.updated_at),
                error: d.ack_error.clone(),
            })
            .collect(),
    }
}

impl Gateway {
    /// Push one delivery to its agent.
    ///
    /// `Offline` is not a failure: the caller releases its lease and the
    /// delivery is retried on a later tick.
    #[instrument(skip(self))]
    pub async fn trigger_dispatch(&self, delivery_id: &str) -> Result<DispatchOutcome, GatewayError> {
        let Some(delivery) = self.store.get_delivery(delivery_id).await? else {
            return Ok(DispatchOutcome::NotFound);
        };
        if delivery.is_terminal() {
            return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyAcked));
        }
        if delivery.server_attempt >= self.settings.dispatch.max_attempts {
            if self.store.mark_failed(delivery_id, ACK_TIMEOUT).await?.is_some() {
                warn!(
                    delivery_id,
                    attempts = delivery.server_attempt,
                    "Delivery exhausted its dispatch attempts"
                );
                self.broadcast_snapshot(&delivery.scan_id).await;
            }
            return Ok(DispatchOutcome::Skipped(SkipReason::AttemptsExhausted));
        }

        let Some(agent) = self.connections.agent(&delivery.pc_id).await else {
            debug!(delivery_id, pc_id = %delivery.pc_id, "Agent offline");
            return Ok(DispatchOutcome::Offline);
        };

        let Some(sent) = self.store.mark_sent(delivery_id).await? else {
            // Acked between the lookup and now.
            return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyAcked));
        };

        if !agent.send(self.deliver_event(&sent)) {
            self.store.requeue(delivery_id).await?;
            debug!(delivery_id, pc_id = %sent.pc_id, "Agent socket closed during push");
            return Ok(DispatchOutcome::Offline);
        }

        info!(
            delivery_id,
            pc_id = %sent.pc_id,
            scan_id = %sent.scan_id,
            attempt = sent.server_attempt,
            "Delivery pushed to agent"
        );
        self.broadcast_snapshot(&sent.scan_id).await;

        Ok(DispatchOutcome::Delivered {
            attempt: sent.server_attempt,
        })
    }

    /// Current status of a scan, or `None` if it has no deliveries.
    pub async fn scan_snapshot(&self, scan_id: &str) -> Result<Option<ScanJobUpdate>, GatewayError> {
        let deliveries = self.store.deliveries_for_scan(scan_id).await?;
        Ok(deliveries
            .first()
            .map(|d| snapshot(scan_id, &d.eqid, &d.barcode, &deliveries)))
    }

    /// Send the current `scanJobUpdate` to every socket of the scan's eqid.
    pub async fn broadcast_snapshot(&self, scan_id: &str) {
        match self.scan_snapshot(scan_id).await {
            Ok(Some(update)) => self.publish_snapshot(&update).await,
            Ok(None) => {}
            Err(e) => warn!(scan_id, error = %e, "Failed to build scan snapshot"),
        }
    }

    pub(super) async fn publish_snapshot(&self, update: &ScanJobUpdate) {
        let msg = event(EventKind::ScanJobUpdate, update);
        self.connections.broadcast_to_scanners(&update.eqid, &msg).await;
    }

    /// Fail `sent` deliveries that used their last attempt without an ack.
    /// Returns how many were failed.
    pub async fn sweep_exhausted(&self) -> Result<usize, GatewayError> {
        let policy = &self.settings.dispatch;
        let failed = self
            .store
            .fail_exhausted(
                unix_millis(),
                duration_millis(policy.ack_timeout()),
                policy.max_attempts,
            )
            .await?;

        let mut scans = BTreeSet::new();
        for d in &failed {
            warn!(
                delivery_id = %d.id,
                pc_id = %d.pc_id,
                attempts = d.server_attempt,
                "Delivery timed out waiting for ack"
            );
            scans.insert(d.scan_id.as_str());
        }
        for scan_id in scans {
            self.broadcast_snapshot(scan_id).await;
        }
        Ok(failed.len())
    }

    /// Run [`sweep_exhausted`](Self::sweep_exhausted) every poll interval
    /// until `shutdown` flips.
    ///
    /// `ACK_TIMEOUT` finalization lives here in the gateway, not in the
    /// dispatcher. The dispatcher's claim only re-leases deliveries still
    /// below `max_attempts`, so a `sent` row that used its last attempt is
    /// never picked up again and is failed by this loop once its ack window
    /// lapses.
    pub async fn run_ack_watchdog(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.dispatch.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.settings.dispatch.poll_interval_ms, "Ack watchdog started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_exhausted().await {
                        warn!(error = %e, "Ack watchdog sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Ack watchdog stopped");
    }
}
