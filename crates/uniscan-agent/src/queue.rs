//! Sequential, idempotent execution queue.
//!
//! One worker drains deliveries in arrival order because the input
//! capability is a single physical resource. A scan that already succeeded
//! is acknowledged again without typing it twice. Acks leave through an
//! outbox channel that does not care which connection is currently up.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use uniscan_proto::events::DeliverBarcode;
use uniscan_proto::messages::DeliverAck;

use crate::config::{ExecutionPolicy, TargetWindow};
use crate::input::{ExecError, InputDriver, SuffixKey, execute_once};

/// How long a completed scan id suppresses re-execution.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(6 * 60 * 60);
/// Expired entries are only swept once the log grows past this.
pub const COMPLETED_PRUNE_ABOVE: usize = 2000;
/// `inputMethod` reported for a redelivered scan.
pub const DUPLICATE_METHOD: &str = "duplicate";

/// One delivered barcode waiting for execution.
#[derive(Debug, Clone)]
pub struct DeliveryItem {
    pub scan_id: String,
    pub delivery_id: Option<String>,
    pub server_attempt: i64,
    pub barcode: String,
    pub suffix_key: SuffixKey,
    pub received_at: Instant,
}

impl DeliveryItem {
    /// `default_suffix` applies when the event carries no suffix key.
    pub fn from_event(event: &DeliverBarcode, default_suffix: SuffixKey) -> Self {
        let scan_id = if event.scan_id.is_empty() {
            event.job_id.clone()
        } else {
            event.scan_id.clone()
        };
        let suffix_key = if event.suffix_key.trim().is_empty() {
            default_suffix
        } else {
            SuffixKey::parse(&event.suffix_key)
        };
        Self {
            scan_id,
            delivery_id: Some(event.delivery_id.clone()).filter(|id| !id.is_empty()),
            server_attempt: event.attempt,
            barcode: event.barcode.clone(),
            suffix_key,
            received_at: Instant::now(),
        }
    }
}

/// Outcome of the most recent item, for the surrounding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastResult {
    pub scan_id: String,
    pub ok: bool,
    pub error: Option<String>,
    pub input_method: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue_len: usize,
    pub last_result: Option<LastResult>,
}

/// Scan ids that already executed successfully.
#[derive(Debug)]
pub struct CompletedScans {
    done: HashMap<String, Instant>,
    retention: Duration,
    prune_above: usize,
}

impl CompletedScans {
    pub fn new(retention: Duration, prune_above: usize) -> Self {
        Self {
            done: HashMap::new(),
            retention,
            prune_above,
        }
    }

    pub fn contains(&self, scan_id: &str, now: Instant) -> bool {
        self.done
            .get(scan_id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.retention)
    }

    pub fn record(&mut self, scan_id: &str, now: Instant) {
        self.done.insert(scan_id.to_string(), now);
        if self.done.len() > self.prune_above {
            let retention = self.retention;
            self.done
                .retain(|_, at| now.saturating_duration_since(*at) < retention);
        }
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub policy: ExecutionPolicy,
    pub target: Option<TargetWindow>,
    pub retention: Duration,
    pub prune_above: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            policy: ExecutionPolicy::default(),
            target: None,
            retention: COMPLETED_RETENTION,
            prune_above: COMPLETED_PRUNE_ABOVE,
        }
    }
}

/// Handle to the queue. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionQueue {
    tx: mpsc::UnboundedSender<DeliveryItem>,
    pending: Arc<AtomicUsize>,
    status: watch::Receiver<QueueStatus>,
}

impl ExecutionQueue {
    /// Start the worker. Returns the queue handle, the ack outbox and the
    /// worker task.
    pub fn spawn(
        driver: Arc<dyn InputDriver>,
        settings: QueueSettings,
    ) -> (Self, mpsc::UnboundedReceiver<DeliverAck>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(QueueStatus::default());
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            driver,
            completed: CompletedScans::new(settings.retention, settings.prune_above),
            settings,
            pending: Arc::clone(&pending),
            acks: ack_tx,
            status: status_tx,
        };
        let handle = tokio::spawn(worker.run(rx));

        (
            Self {
                tx,
                pending,
                status: status_rx,
            },
            ack_rx,
            handle,
        )
    }

    /// Append to the queue. `false` once the worker has stopped.
    pub fn push(&self, item: DeliveryItem) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Items not yet picked up by the worker.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> watch::Receiver<QueueStatus> {
        self.status.clone()
    }
}

struct Worker {
    driver: Arc<dyn InputDriver>,
    settings: QueueSettings,
    completed: CompletedScans,
    pending: Arc<AtomicUsize>,
    acks: mpsc::UnboundedSender<DeliverAck>,
    status: watch::Sender<QueueStatus>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DeliveryItem>) {
        while let Some(item) = rx.recv().await {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let ack = self.process(&item).await;

            self.status.send_replace(QueueStatus {
                queue_len: self.pending.load(Ordering::SeqCst),
                last_result: Some(LastResult {
                    scan_id: item.scan_id.clone(),
                    ok: ack.ok,
                    error: ack.error.clone(),
                    input_method: ack.input_method.clone(),
                }),
            });

            if self.acks.send(ack).is_err() {
                debug!("Ack outbox closed, stopping execution queue");
                break;
            }
        }
    }

    async fn process(&mut self, item: &DeliveryItem) -> DeliverAck {
        let ack = DeliverAck {
            scan_id: Some(item.scan_id.clone()),
            delivery_id: item.delivery_id.clone(),
            attempt: item.server_attempt,
            ..DeliverAck::default()
        };

        if self.completed.contains(&item.scan_id, Instant::now()) {
            info!(scan_id = %item.scan_id, "Scan already typed, acknowledging duplicate");
            return DeliverAck {
                ok: true,
                agent_attempt: 0,
                input_method: Some(DUPLICATE_METHOD.to_string()),
                ..ack
            };
        }

        let started = Instant::now();
        let max_attempts = self.settings.policy.max_attempts();
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match self.attempt(item).await {
                Ok(method) => {
                    self.completed.record(&item.scan_id, Instant::now());
                    info!(
                        scan_id = %item.scan_id,
                        agent_attempt = attempt,
                        method = %method,
                        "Barcode typed"
                    );
                    return DeliverAck {
                        ok: true,
                        agent_attempt: attempt_i64(attempt),
                        input_method: Some(method),
                        duration_ms: elapsed_ms(started),
                        ..ack
                    };
                }
                Err(e) => {
                    warn!(
                        scan_id = %item.scan_id,
                        agent_attempt = attempt,
                        code = e.code(),
                        error = %e,
                        "Input attempt failed"
                    );
                    last_error = Some(e);
                    if let Some(delay) = self.settings.policy.delay_after(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        DeliverAck {
            ok: false,
            error: last_error.map(|e| e.code().to_string()),
            agent_attempt: attempt_i64(max_attempts),
            duration_ms: elapsed_ms(started),
            ..ack
        }
    }

    async fn attempt(&self, item: &DeliveryItem) -> Result<String, ExecError> {
        let driver = Arc::clone(&self.driver);
        let target = self.settings.target.clone().filter(TargetWindow::is_configured);
        let barcode = item.barcode.clone();
        let suffix = item.suffix_key;
        tokio::task::spawn_blocking(move || {
            execute_once(driver.as_ref(), target.as_ref(), &barcode, suffix)
        })
        .await
        .unwrap_or_else(|e| Err(ExecError::SendInputFail(format!("input task failed: {e}"))))
    }
}

fn attempt_i64(attempt: usize) -> i64 {
    i64::try_from(attempt).unwrap_or(i64::MAX)
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
