//! Client message handlers.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use uniscan_proto::events::{DeliverBarcode, Paired, PairingCode, RegisteredScanners};
use uniscan_proto::messages::{
    AckReply, AppInit, AppInitReply, DeliverAck, HelloReply, PairList, PairListReply, PairReply,
    PairRequest, PairSetEnabled, PcAgentHello, Pong, ScanBarcode, ScanReply,
};
use uniscan_proto::{
    ClientEnvelope, ClientType, ErrorCode, EventKind, MessageKind, ServerMessage, WireError,
    iso_millis,
};
use uniscan_store::{AckRecord, Delivery, DeviceParams, is_valid_eqid};

use super::dispatch::snapshot;
use super::{ConnectionState, Gateway};
use crate::error::GatewayError;

type HandlerResult = Result<Value, GatewayError>;

/// Error recorded for a failed ack that carries no code of its own.
const AGENT_FAIL: &str = "AGENT_FAIL";

fn reply<T: Serialize>(body: &T) -> HandlerResult {
    serde_json::to_value(body).map_err(|e| GatewayError::invalid(e.to_string()))
}

fn payload<T: DeserializeOwned>(env: &ClientEnvelope) -> Result<T, GatewayError> {
    env.payload()
        .map_err(|e| GatewayError::invalid(format!("malformed {} payload: {e}", env.kind)))
}

fn required<'a>(value: &'a str, what: &str) -> Result<&'a str, GatewayError> {
    let value = value.trim();
    if value.is_empty() {
        Err(GatewayError::invalid(format!("{what} required")))
    } else {
        Ok(value)
    }
}

pub(super) fn event<T: Serialize>(kind: EventKind, body: &T) -> ServerMessage {
    ServerMessage::event(kind.as_str(), serde_json::to_value(body).unwrap_or_default())
}

/// Short random suffix used when an agent reports no machine id.
fn random_machine_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl Gateway {
    /// Handle one inbound text frame. Replies and events are queued on the
    /// connection; nothing here closes the socket.
    pub async fn handle_text(&self, conn: &mut ConnectionState, text: &str) {
        let env: ClientEnvelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                debug!(conn_id = conn.conn_id, error = %e, "Rejecting malformed frame");
                conn.send(ServerMessage::error(
                    None,
                    WireError::new(ErrorCode::BadJson, "invalid json"),
                ));
                return;
            }
        };

        if conn.client_type.is_none() {
            conn.client_type = env.client_type();
        }

        let request_id = env.request_id.clone();
        let result = match MessageKind::parse(&env.kind) {
            Some(kind) => self.dispatch_message(conn, kind, &env).await,
            None => Err(GatewayError::UnknownType(env.kind.clone())),
        };

        let frame = match result {
            Ok(data) => ServerMessage::ok(request_id, data),
            Err(e) => {
                if e.is_internal() {
                    error!(conn_id = conn.conn_id, kind = %env.kind, error = %e, "Handler failed");
                } else {
                    debug!(conn_id = conn.conn_id, kind = %env.kind, error = %e, "Request rejected");
                }
                ServerMessage::error(request_id, e.to_wire())
            }
        };
        conn.send(frame);
    }

    async fn dispatch_message(
        &self,
        conn: &mut ConnectionState,
        kind: MessageKind,
        env: &ClientEnvelope,
    ) -> HandlerResult {
        match kind {
            MessageKind::AppInit => self.app_init(conn, payload(env)?).await,
            MessageKind::PcAgentHello => self.pc_agent_hello(conn, payload(env)?).await,
            MessageKind::PairRequest => self.pair_request(conn, payload(env)?).await,
            MessageKind::PairList => self.pair_list(payload(env)?).await,
            MessageKind::PairSetEnabled => self.pair_set_enabled(payload(env)?).await,
            MessageKind::ScanBarcode => self.scan_barcode(conn, payload(env)?).await,
            MessageKind::DeliverAck => self.deliver_ack(conn, payload(env)?).await,
            MessageKind::Ping => reply(&Pong { pong: true }),
        }
    }

    async fn attach_scanner(&self, conn: &mut ConnectionState, eqid: &str) {
        if conn.client_type.is_none() {
            conn.client_type = Some(ClientType::App);
        }
        if conn.eqids.insert(eqid.to_string()) {
            self.connections
                .register_scanner(eqid, conn.handle.clone())
                .await;
        }
    }

    // =========================================================================
    // Scanner identity
    // =========================================================================

    #[instrument(skip_all, fields(conn_id = conn.conn_id))]
    async fn app_init(&self, conn: &mut ConnectionState, req: AppInit) -> HandlerResult {
        let eqid = req.eqid.as_deref().map(str::trim).filter(|e| !e.is_empty());
        if let Some(eqid) = eqid
            && !is_valid_eqid(eqid)
        {
            return Err(GatewayError::invalid(format!(
                "eqid must be 6 characters of A-Z0-9, got {eqid:?}"
            )));
        }
        let app = self.store.resolve_app(eqid, req.alias.as_deref()).await?;
        conn.client_type = Some(ClientType::App);
        self.attach_scanner(conn, &app.eqid).await;
        debug!(eqid = %app.eqid, "Scanner initialised");
        reply(&AppInitReply {
            eqid: app.eqid,
            alias: app.alias,
        })
    }

    // =========================================================================
    // Agent identity
    // =========================================================================

    #[instrument(skip_all, fields(conn_id = conn.conn_id))]
    async fn pc_agent_hello(&self, conn: &mut ConnectionState, req: PcAgentHello) -> HandlerResult {
        fn field(value: Option<String>, default: &str) -> String {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        }

        let group = field(req.group, "default");
        let device_name = field(req.device_name, "pc");
        let machine_id = req
            .machine_id
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let pc_id = req
            .pc_id
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| {
                let mid = machine_id.clone().unwrap_or_else(random_machine_suffix);
                format!("{group}:{device_name}:{mid}")
            });

        // A socket re-announcing under a different id gives up the old one.
        if let Some(old) = conn.pc_id.take().filter(|old| *old != pc_id) {
            self.release_agent(conn.conn_id, &old).await;
        }

        self.store
            .upsert_device(&DeviceParams {
                pc_id: &pc_id,
                group: &group,
                device_name: &device_name,
                machine_id: machine_id.as_deref().unwrap_or_default(),
            })
            .await?;

        conn.client_type = Some(ClientType::PcAgent);
        conn.pc_id = Some(pc_id.clone());
        if let Some(replaced) = self
            .connections
            .register_agent(&pc_id, conn.handle.clone())
            .await
        {
            debug!(pc_id = %pc_id, replaced = replaced.conn_id, "Previous agent socket superseded");
        }

        let challenge = self.pairing.issue_challenge(&pc_id).await?;
        let expires_at = iso_millis(challenge.expires_at);
        conn.send(event(
            EventKind::PairingCode,
            &PairingCode {
                code: challenge.code.clone(),
                pin: challenge.pin.clone(),
                pc_id: pc_id.clone(),
                expires_at: expires_at.clone(),
            },
        ));
        let count = self.store.count_enabled_scanners(&pc_id).await?;
        conn.send(event(
            EventKind::RegisteredScanners,
            &RegisteredScanners { count },
        ));

        info!(
            pc_id = %pc_id,
            version = req.version.as_deref().unwrap_or("unknown"),
            scanners = count,
            "Agent connected"
        );

        reply(&HelloReply {
            pc_id,
            code: challenge.code,
            pin: challenge.pin,
            expires_at,
        })
    }

    // =========================================================================
    // Pairing
    // =========================================================================

    #[instrument(skip_all, fields(conn_id = conn.conn_id))]
    async fn pair_request(&self, conn: &mut ConnectionState, req: PairRequest) -> HandlerResult {
        let eqid = required(&req.eqid, "eqid")?;
        let code = required(&req.code, "code")?;

        let pairing = self
            .pairing
            .redeem_challenge(eqid, code, req.pin.as_deref())
            .await?;
        self.attach_scanner(conn, eqid).await;

        let paired = event(
            EventKind::Paired,
            &Paired {
                eqid: pairing.eqid.clone(),
                pc_id: pairing.pc_id.clone(),
            },
        );
        self.connections
            .broadcast_to_scanners(&pairing.eqid, &paired)
            .await;
        self.connections.send_to_agent(&pairing.pc_id, paired).await;
        self.push_scanner_count(&pairing.pc_id).await;

        reply(&PairReply {
            eqid: pairing.eqid,
            pc_id: pairing.pc_id,
            enabled: pairing.enabled,
        })
    }

    async fn pair_list(&self, req: PairList) -> HandlerResult {
        let eqid = required(&req.eqid, "eqid")?;
        let list = self.pairing.list(eqid, &self.connections).await?;
        reply(&PairListReply {
            eqid: eqid.to_string(),
            list,
        })
    }

    async fn pair_set_enabled(&self, req: PairSetEnabled) -> HandlerResult {
        let eqid = required(&req.eqid, "eqid")?;
        let pc_id = required(&req.pc_id, "pcId")?;
        let pairing = self.pairing.set_enabled(eqid, pc_id, req.enabled).await?;
        self.push_scanner_count(pc_id).await;
        reply(&PairReply {
            eqid: pairing.eqid,
            pc_id: pairing.pc_id,
            enabled: pairing.enabled,
        })
    }

    /// Tell a connected agent how many scanners currently target it.
    async fn push_scanner_count(&self, pc_id: &str) {
        match self.store.count_enabled_scanners(pc_id).await {
            Ok(count) => {
                self.connections
                    .send_to_agent(
                        pc_id,
                        event(EventKind::RegisteredScanners, &RegisteredScanners { count }),
                    )
                    .await;
            }
            Err(e) => warn!(pc_id, error = %e, "Failed to count scanners for agent"),
        }
    }

    // =========================================================================
    // Scans
    // =========================================================================

    #[instrument(skip_all, fields(conn_id = conn.conn_id))]
    async fn scan_barcode(&self, conn: &mut ConnectionState, req: ScanBarcode) -> HandlerResult {
        let eqid = required(&req.eqid, "eqid")?;
        let barcode = required(&req.barcode, "barcode")?;
        self.attach_scanner(conn, eqid).await;

        let targets = self.store.enabled_targets(eqid).await?;
        let scan_id = uuid::Uuid::new_v4().to_string();
        let deliveries = self
            .store
            .create_scan(&scan_id, eqid, barcode, &targets)
            .await?;
        let delivery_ids: Vec<String> = deliveries.iter().map(|d| d.id.clone()).collect();

        info!(eqid, scan_id = %scan_id, targets = targets.len(), "Scan accepted");

        // The reply must not wait on the scheduler.
        if !delivery_ids.is_empty()
            && let Some(notifier) = self.notifier.clone()
        {
            let ids = delivery_ids.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&ids).await {
                    debug!(error = %e, "Scheduler hint failed, poll loop will pick up the work");
                }
            });
        }

        self.publish_snapshot(&snapshot(&scan_id, eqid, barcode, &deliveries))
            .await;

        reply(&ScanReply {
            job_id: scan_id.clone(),
            scan_id,
            delivery_ids,
            targets,
        })
    }

    // =========================================================================
    // Acks
    // =========================================================================

    #[instrument(skip_all, fields(conn_id = conn.conn_id))]
    async fn deliver_ack(&self, conn: &mut ConnectionState, req: DeliverAck) -> HandlerResult {
        let Some(pc_id) = conn.pc_id.clone().filter(|_| conn.is_agent()) else {
            return Err(GatewayError::Forbidden(
                "deliverAck is only accepted from agents".into(),
            ));
        };
        if req.pc_id.as_deref().is_some_and(|claimed| claimed != pc_id) {
            return Err(GatewayError::Forbidden(
                "pcId does not match this connection".into(),
            ));
        }
        // A socket superseded by a newer hello for the same pcId no longer
        // speaks for that agent.
        if !self.connections.is_current_agent(&pc_id, conn.conn_id).await {
            return Err(GatewayError::Forbidden(
                "connection was superseded by a newer agent socket".into(),
            ));
        }

        let delivery = self.find_acked_delivery(&pc_id, &req).await?;
        if delivery.pc_id != pc_id {
            return Err(GatewayError::Forbidden(
                "delivery belongs to another agent".into(),
            ));
        }

        let error = (!req.ok).then(|| req.error.as_deref().unwrap_or(AGENT_FAIL));
        let record = AckRecord {
            ok: req.ok,
            error,
            agent_attempt: req.agent_attempt,
            input_method: req.input_method.as_deref(),
            duration_ms: req.duration_ms,
        };
        let updated = match self.store.record_ack(&delivery.id, &record).await? {
            Some(updated) => updated,
            // Already ack_ok; keep it.
            None => delivery,
        };

        info!(
            delivery_id = %updated.id,
            pc_id = %pc_id,
            ok = req.ok,
            status = %updated.status,
            agent_attempt = req.agent_attempt,
            error = error.unwrap_or_default(),
            "Delivery acknowledged"
        );

        self.broadcast_snapshot(&updated.scan_id).await;

        reply(&AckReply {
            received: true,
            status: updated.status.to_string(),
        })
    }

    async fn find_acked_delivery(
        &self,
        pc_id: &str,
        req: &DeliverAck,
    ) -> Result<Delivery, GatewayError> {
        if let Some(id) = req.delivery_id.as_deref().filter(|id| !id.is_empty()) {
            return self
                .store
                .get_delivery(id)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("delivery {id}")));
        }
        let scan_id = req
            .scan_id()
            .ok_or_else(|| GatewayError::invalid("deliveryId or scanId required"))?;
        self.store
            .latest_delivery_for(scan_id, pc_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("delivery for scan {scan_id}")))
    }

    // =========================================================================
    // Disconnect
    // =========================================================================

    /// Finaliser run once a socket's receive loop has exited.
    pub async fn on_disconnect(&self, conn: &ConnectionState) {
        for eqid in &conn.eqids {
            self.connections.unregister_scanner(eqid, conn.conn_id).await;
        }
        if let Some(pc_id) = &conn.pc_id {
            self.release_agent(conn.conn_id, pc_id).await;
        }
        debug!(conn_id = conn.conn_id, "Connection closed");
    }

    async fn release_agent(&self, conn_id: u64, pc_id: &str) {
        // A newer socket for the same agent owns the presence and challenge.
        if !self.connections.unregister_agent(pc_id, conn_id).await {
            return;
        }
        self.pairing.invalidate(pc_id).await;
        if let Err(e) = self.store.set_device_online(pc_id, false).await {
            warn!(pc_id, error = %e, "Failed to mark agent offline");
        }
        info!(pc_id, "Agent disconnected");
    }

    pub(super) fn deliver_event(&self, delivery: &Delivery) -> ServerMessage {
        event(
            EventKind::DeliverBarcode,
            &DeliverBarcode {
                delivery_id: delivery.id.clone(),
                job_id: delivery.scan_id.clone(),
                scan_id: delivery.scan_id.clone(),
                attempt: delivery.server_attempt,
                eqid: delivery.eqid.clone(),
                barcode: delivery.barcode.clone(),
                suffix_key: self.settings.gateway.suffix_key.clone(),
            },
        )
    }
}
