//! In-memory registry of live scanner and agent connections.
//!
//! Scanners are keyed by eqid and may hold several connections each; agents
//! are keyed by pcId with at most one connection, a newer one replacing the
//! older. Both maps sit behind one lock so a lookup never sees them
//! half-updated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use uniscan_proto::ServerMessage;

/// Identifies one socket for the lifetime of the process.
pub type ConnId = u64;

/// Outbound side of one socket.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: ConnId,
    tx: mpsc::Sender<ServerMessage>,
}

impl ClientHandle {
    pub const fn new(conn_id: ConnId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { conn_id, tx }
    }

    /// Queue a frame for the socket writer. Returns `false` if the socket is
    /// gone or its outbound queue is full.
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = self.conn_id, "Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct Connections {
    scanners: HashMap<String, HashMap<ConnId, ClientHandle>>,
    agents: HashMap<String, ClientHandle>,
}

/// Thread-safe registry of live connections.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Connections>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // === Scanners ===

    pub async fn register_scanner(&self, eqid: &str, handle: ClientHandle) {
        let conn_id = handle.conn_id;
        let mut inner = self.inner.write().await;
        let sockets = inner.scanners.entry(eqid.to_string()).or_default();
        if sockets.insert(conn_id, handle).is_none() {
            debug!(eqid, conn_id, sockets = sockets.len(), "Scanner connection registered");
        }
    }

    pub async fn unregister_scanner(&self, eqid: &str, conn_id: ConnId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(sockets) = inner.scanners.get_mut(eqid) else {
            return false;
        };
        let removed = sockets.remove(&conn_id).is_some();
        if sockets.is_empty() {
            inner.scanners.remove(eqid);
        }
        removed
    }

    /// Send to every connection of a scanner identity. Returns how many
    /// accepted the frame.
    pub async fn broadcast_to_scanners(&self, eqid: &str, msg: &ServerMessage) -> usize {
        let handles: Vec<ClientHandle> = self
            .inner
            .read()
            .await
            .scanners
            .get(eqid)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        handles.iter().filter(|h| h.send(msg.clone())).count()
    }

    /// Number of live scanner connections across all identities.
    pub async fn scanner_count(&self) -> usize {
        self.inner.read().await.scanners.values().map(HashMap::len).sum()
    }

    // === Agents ===

    /// Register an agent connection, returning the one it replaced.
    pub async fn register_agent(&self, pc_id: &str, handle: ClientHandle) -> Option<ClientHandle> {
        let conn_id = handle.conn_id;
        let previous = self
            .inner
            .write()
            .await
            .agents
            .insert(pc_id.to_string(), handle)
            .filter(|prev| prev.conn_id != conn_id);
        if let Some(prev) = &previous {
            info!(pc_id, conn_id, replaced = prev.conn_id, "Agent connection replaced");
        } else {
            info!(pc_id, conn_id, "Agent connection registered");
        }
        previous
    }

    /// Remove an agent connection, but only if `conn_id` is still the
    /// registered one (a replaced socket closing must not evict its
    /// successor).
    pub async fn unregister_agent(&self, pc_id: &str, conn_id: ConnId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.agents.get(pc_id).is_some_and(|h| h.conn_id == conn_id) {
            inner.agents.remove(pc_id);
            info!(pc_id, conn_id, "Agent connection unregistered");
            true
        } else {
            false
        }
    }

    pub async fn agent(&self, pc_id: &str) -> Option<ClientHandle> {
        self.inner.read().await.agents.get(pc_id).cloned()
    }

    /// Whether `conn_id` is the socket currently registered for `pc_id`.
    pub async fn is_current_agent(&self, pc_id: &str, conn_id: ConnId) -> bool {
        self.inner
            .read()
            .await
            .agents
            .get(pc_id)
            .is_some_and(|h| h.conn_id == conn_id)
    }

    pub async fn is_agent_online(&self, pc_id: &str) -> bool {
        self.inner.read().await.agents.contains_key(pc_id)
    }

    pub async fn send_to_agent(&self, pc_id: &str, msg: ServerMessage) -> bool {
        match self.agent(pc_id).await {
            Some(handle) => handle.send(msg),
            None => false,
        }
    }

    pub async fn agent_count(&self) -> usize {
        self.inner.read().await.agents.len()
    }
}
