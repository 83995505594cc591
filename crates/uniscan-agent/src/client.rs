//! Gateway client with automatic reconnection.
//!
//! Every fresh connection re-announces the agent with `pcAgentHello`. The
//! execution queue is not tied to a connection: deliveries keep running
//! while the socket is down and their acks are written once it is back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use uniscan_proto::events::{DeliverBarcode, Paired, PairingCode, RegisteredScanners};
use uniscan_proto::messages::{DeliverAck, HelloReply, PcAgentHello};
use uniscan_proto::{ClientEnvelope, ClientType, EventKind, MessageKind, Response, ServerMessage};

use crate::config::{AgentConfig, ReconnectPolicy};
use crate::error::AgentClientError;
use crate::input::SuffixKey;
use crate::queue::{DeliveryItem, ExecutionQueue};

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsConn, Message>;
type WsStream = SplitStream<WsConn>;

/// Keepalive `ping` period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// What the agent currently knows about itself, for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentState {
    pub connected: bool,
    pub pc_id: Option<String>,
    /// `code-pin` as typed into a scanner.
    pub pairing_code: Option<String>,
    pub pairing_expires_at: Option<String>,
    pub paired_eqids: Vec<String>,
    pub registered_scanners: i64,
}

pub struct AgentClient {
    config: AgentConfig,
    reconnect: ReconnectPolicy,
    heartbeat_interval: Duration,
    default_suffix: SuffixKey,
    queue: ExecutionQueue,
    acks: mpsc::UnboundedReceiver<DeliverAck>,
    /// Acks whose write failed; sent first on the next connection.
    unsent: VecDeque<DeliverAck>,
    state: watch::Sender<AgentState>,
    seq: AtomicU64,
}

impl AgentClient {
    pub fn new(
        config: AgentConfig,
        queue: ExecutionQueue,
        acks: mpsc::UnboundedReceiver<DeliverAck>,
    ) -> Self {
        let default_suffix = SuffixKey::parse(&config.barcode_suffix_key);
        Self {
            config,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            default_suffix,
            queue,
            acks,
            unsent: VecDeque::new(),
            state: watch::Sender::new(AgentState::default()),
            seq: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub const fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` flips, reconnecting with backoff.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Agent client shutting down");
                return;
            }

            match self.connect_and_run(&mut shutdown).await {
                Ok(()) => {
                    info!("Gateway connection closed cleanly");
                    return;
                }
                Err((established, e)) => {
                    if established {
                        attempt = 0;
                    }
                    let delay = self.reconnect.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting to gateway");

                    tokio::select! {
                        () = sleep(delay) => {}
                        _ = shutdown.changed() => {
                            info!("Agent client shutting down during reconnect wait");
                            return;
                        }
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// One connection lifetime. The error side says whether the socket was
    /// ever established, which resets the backoff.
    async fn connect_and_run(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), (bool, AgentClientError)> {
        let (ws, _) = connect_async(self.config.server_url.as_str())
            .await
            .map_err(|e| (false, AgentClientError::Connection(e.to_string())))?;
        let (mut sink, mut stream) = ws.split();
        info!(url = %self.config.server_url, "Connected to gateway");

        let result = self.session(&mut sink, &mut stream, shutdown).await;
        self.state.send_modify(|s| s.connected = false);
        result.map_err(|e| (true, e))
    }

    async fn session(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AgentClientError> {
        let hello = PcAgentHello {
            pc_id: None,
            group: Some(self.config.group.clone()),
            device_name: Some(self.config.device_name.clone()),
            machine_id: self.config.machine_id.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };
        self.send_request(sink, MessageKind::PcAgentHello, &hello)
            .await?;
        self.state.send_modify(|s| s.connected = true);

        while let Some(ack) = self.unsent.pop_front() {
            if let Err(e) = self.send_ack(sink, &ack).await {
                self.unsent.push_front(ack);
                return Err(e);
            }
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return Err(AgentClientError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                Some(ack) = self.acks.recv() => {
                    if let Err(e) = self.send_ack(sink, &ack).await {
                        self.unsent.push_back(ack);
                        return Err(e);
                    }
                }
                _ = heartbeat.tick() => {
                    self.send_request(sink, MessageKind::Ping, &serde_json::json!({})).await?;
                }
                _ = shutdown.changed() => {
                    info!("Agent client received shutdown signal");
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "WebSocket close failed");
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn send_request<T: Serialize>(
        &self,
        sink: &mut WsSink,
        kind: MessageKind,
        data: &T,
    ) -> Result<(), AgentClientError> {
        let request_id = format!("{}-{}", kind.as_str(), self.seq.fetch_add(1, Ordering::Relaxed));
        let envelope = ClientEnvelope::request(kind.as_str(), request_id, ClientType::PcAgent, data)?;
        sink.send(Message::text(serde_json::to_string(&envelope)?))
            .await?;
        Ok(())
    }

    async fn send_ack(&self, sink: &mut WsSink, ack: &DeliverAck) -> Result<(), AgentClientError> {
        let mut ack = ack.clone();
        if ack.pc_id.is_none() {
            ack.pc_id.clone_from(&self.state.borrow().pc_id);
        }
        self.send_request(sink, MessageKind::DeliverAck, &ack).await?;
        debug!(scan_id = ?ack.scan_id, ok = ack.ok, "Ack sent");
        Ok(())
    }

    /// Apply one inbound frame.
    pub fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Response(response)) => self.handle_response(&response),
            Ok(ServerMessage::Event(event)) => self.handle_event(&event.event, &event.data),
            Err(e) => debug!(error = %e, "Ignoring unparseable frame"),
        }
    }

    fn handle_response(&self, response: &Response) {
        let request_id = response.request_id.as_deref().unwrap_or_default();
        if !response.ok {
            if let Some(err) = &response.error {
                warn!(request_id, code = ?err.code, message = %err.message, "Gateway rejected request");
            }
            return;
        }
        if !request_id.starts_with(MessageKind::PcAgentHello.as_str()) {
            return;
        }
        if let Some(reply) = response.data.as_ref().and_then(decode::<HelloReply>) {
            info!(pc_id = %reply.pc_id, "Registered with gateway");
            self.state.send_modify(|s| s.pc_id = Some(reply.pc_id));
        }
    }

    fn handle_event(&self, name: &str, data: &Value) {
        match EventKind::parse(name) {
            Some(EventKind::PairingCode) => {
                if let Some(code) = decode::<PairingCode>(data) {
                    info!(
                        pc_id = %code.pc_id,
                        expires_at = %code.expires_at,
                        "Pairing code {}-{}",
                        code.code,
                        code.pin
                    );
                    self.state.send_modify(|s| {
                        s.pc_id = Some(code.pc_id);
                        s.pairing_code = Some(format!("{}-{}", code.code, code.pin));
                        s.pairing_expires_at = Some(code.expires_at);
                    });
                }
            }
            Some(EventKind::Paired) => {
                if let Some(paired) = decode::<Paired>(data) {
                    info!(eqid = %paired.eqid, "Paired with scanner");
                    self.state.send_modify(|s| {
                        if !s.paired_eqids.contains(&paired.eqid) {
                            s.paired_eqids.push(paired.eqid);
                        }
                    });
                }
            }
            Some(EventKind::RegisteredScanners) => {
                if let Some(reg) = decode::<RegisteredScanners>(data) {
                    debug!(count = reg.count, "Registered scanners updated");
                    self.state.send_modify(|s| s.registered_scanners = reg.count);
                }
            }
            Some(EventKind::DeliverBarcode) => {
                if let Some(delivery) = decode::<DeliverBarcode>(data) {
                    let item = DeliveryItem::from_event(&delivery, self.default_suffix);
                    debug!(
                        scan_id = %item.scan_id,
                        attempt = item.server_attempt,
                        queued = self.queue.len(),
                        "Delivery received"
                    );
                    if !self.queue.push(item) {
                        error!("Execution queue has stopped, dropping delivery");
                    }
                }
            }
            Some(EventKind::ScanJobUpdate) | None => {}
        }
    }
}

fn decode<T: DeserializeOwned>(data: &Value) -> Option<T> {
    match T::deserialize(data) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "Malformed event payload");
            None
        }
    }
}
