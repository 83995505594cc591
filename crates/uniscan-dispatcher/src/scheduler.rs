//! Lease loop with a bounded worker pool.
//!
//! Each tick takes a pool permit, claims the oldest eligible delivery with
//! that permit, and hands both to a task that calls the dispatch target.
//! Claiming stops as soon as either permits or eligible rows run out.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use uniscan_proto::DispatchOutcome;
use uniscan_store::{ClaimParams, Delivery, DeliveryStore};

use crate::config::SchedulerConfig;
use crate::target::DispatchTarget;

struct Inner {
    store: DeliveryStore,
    target: Arc<dyn DispatchTarget>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// One scheduler instance. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: DeliveryStore,
        target: Arc<dyn DispatchTarget>,
        config: SchedulerConfig,
    ) -> Self {
        let capacity = config.policy.concurrency();
        Self {
            inner: Arc::new(Inner {
                store,
                target,
                config,
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    /// Dispatches currently holding a pool permit.
    pub fn in_flight(&self) -> usize {
        self.inner.capacity - self.inner.permits.available_permits()
    }

    fn claim_params(&self) -> ClaimParams<'_> {
        ClaimParams::from_policy(&self.inner.config.instance_id, &self.inner.config.policy)
    }

    fn try_permit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.inner.permits).try_acquire_owned().ok()
    }

    /// Claim and start dispatches until the pool is full or nothing is
    /// eligible. Returns how many were started.
    pub async fn tick(&self) -> usize {
        let mut started = 0;
        while let Some(permit) = self.try_permit() {
            match self.inner.store.claim_next(&self.claim_params()).await {
                Ok(Some(delivery)) => {
                    self.spawn_dispatch(delivery, permit);
                    started += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    // No partial state: the claim either happened or it did not.
                    warn!(error = %e, "Claim failed, retrying next tick");
                    break;
                }
            }
        }
        started
    }

    /// Fast path for freshly created deliveries.
    ///
    /// Only claims with free permits; whatever is left over is found by the
    /// poll loop. Returns how many were started.
    pub async fn enqueue(&self, delivery_ids: &[String]) -> usize {
        let mut queued = 0;
        for id in delivery_ids {
            let Some(permit) = self.try_permit() else {
                debug!(
                    skipped = delivery_ids.len() - queued,
                    "Pool busy, leaving hinted work to the poll loop"
                );
                break;
            };
            match self.inner.store.claim_by_id(id, &self.claim_params()).await {
                Ok(Some(delivery)) => {
                    self.spawn_dispatch(delivery, permit);
                    queued += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(delivery_id = %id, error = %e, "Enqueue claim failed"),
            }
        }
        queued
    }

    fn spawn_dispatch(&self, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            dispatch_one(&inner, &delivery).await;
            drop(permit);
        });
    }

    /// Poll until `shutdown` flips, then wait for in-flight dispatches.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let policy = &self.inner.config.policy;
        info!(
            instance_id = %self.instance_id(),
            concurrency = self.inner.capacity,
            poll_ms = policy.poll_interval_ms,
            lease_ms = policy.lease_ms,
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(policy.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = self.tick().await;
                    if started > 0 {
                        debug!(started, "Dispatches started");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.wait_idle().await;
        info!(instance_id = %self.instance_id(), "Scheduler stopped");
    }

    /// Wait until every in-flight dispatch has finished.
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.inner.capacity).unwrap_or(u32::MAX);
        if let Ok(permits) = self.inner.permits.acquire_many(all).await {
            drop(permits);
        }
    }
}

async fn dispatch_one(inner: &Inner, delivery: &Delivery) {
    let id = delivery.id.as_str();
    let release = match inner.target.dispatch(id).await {
        // The gateway moved the row to `sent`; nothing left for us to do.
        Ok(DispatchOutcome::Delivered { attempt }) => {
            debug!(delivery_id = %id, pc_id = %delivery.pc_id, attempt, "Delivery pushed");
            false
        }
        Ok(DispatchOutcome::Offline) => {
            debug!(delivery_id = %id, pc_id = %delivery.pc_id, "Agent offline, releasing lease");
            true
        }
        Ok(DispatchOutcome::Skipped(reason)) => {
            debug!(delivery_id = %id, reason = reason.as_str(), "Dispatch skipped");
            true
        }
        Ok(DispatchOutcome::NotFound) => {
            warn!(delivery_id = %id, "Gateway does not know this delivery");
            true
        }
        Err(e) => {
            warn!(delivery_id = %id, error = %e, "Dispatch failed, releasing lease");
            true
        }
    };

    if release {
        // Guarded by owner and status, so a terminal or `sent` row is untouched.
        if let Err(e) = inner
            .store
            .release_lease(id, &inner.config.instance_id)
            .await
        {
            warn!(delivery_id = %id, error = %e, "Lease release failed, it will expire instead");
        }
    }
}
