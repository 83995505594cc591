//! Gateway core: shared state, per-connection state and the HTTP/WebSocket
//! surface.

mod dispatch;
mod handler;
pub mod http;
mod ws;

#[cfg(test)]
mod handler_tests;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use uniscan_core::{DispatchPolicy, GatewayConfig};
use uniscan_proto::{ClientType, ServerMessage};
use uniscan_store::DeliveryStore;

use crate::notifier::WorkNotifier;
use crate::pairing::PairingRegistry;
use crate::registry::{ClientHandle, ConnId, ConnectionRegistry};

/// Frames buffered per socket before new ones are dropped.
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct GatewaySettings {
    pub gateway: GatewayConfig,
    pub dispatch: DispatchPolicy,
    /// Shared secret for `/internal/*`. `None` leaves the surface open.
    pub internal_token: Option<String>,
}

/// What the gateway knows about one socket. Owned by that socket's receive
/// loop and handed to every handler.
#[derive(Debug)]
pub struct ConnectionState {
    pub conn_id: ConnId,
    pub handle: ClientHandle,
    pub client_type: Option<ClientType>,
    /// Scanner identities this socket is registered under.
    pub eqids: BTreeSet<String>,
    pub pc_id: Option<String>,
}

impl ConnectionState {
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.handle.send(msg)
    }

    pub const fn is_agent(&self) -> bool {
        matches!(self.client_type, Some(ClientType::PcAgent)) && self.pc_id.is_some()
    }
}

/// Shared gateway state. Cheap to clone; every clone sees the same
/// registries and store.
#[derive(Clone)]
pub struct Gateway {
    store: DeliveryStore,
    connections: ConnectionRegistry,
    pairing: PairingRegistry,
    notifier: Option<Arc<dyn WorkNotifier>>,
    settings: Arc<GatewaySettings>,
    next_conn_id: Arc<AtomicU64>,
}

impl Gateway {
    pub fn new(store: DeliveryStore, settings: GatewaySettings) -> Self {
        let pairing = PairingRegistry::new(store.clone(), &settings.gateway);
        Self {
            store,
            connections: ConnectionRegistry::new(),
            pairing,
            notifier: None,
            settings: Arc::new(settings),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn WorkNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub const fn store(&self) -> &DeliveryStore {
        &self.store
    }

    pub const fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub const fn pairing(&self) -> &PairingRegistry {
        &self.pairing
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Allocate state for a new socket whose outbound frames go to `tx`.
    pub fn open_connection(&self, tx: mpsc::Sender<ServerMessage>) -> ConnectionState {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        ConnectionState {
            conn_id,
            handle: ClientHandle::new(conn_id, tx),
            client_type: None,
            eqids: BTreeSet::new(),
            pc_id: None,
        }
    }

    /// Check the internal token, if one is configured.
    pub fn authorize_internal(&self, presented: Option<&str>) -> bool {
        match &self.settings.internal_token {
            Some(expected) => presented == Some(expected.as_str()),
            None => true,
        }
    }
}
