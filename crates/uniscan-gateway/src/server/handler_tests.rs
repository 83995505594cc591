//! Handler tests driven through channel-backed connections.

#![allow(clippy::unwrap_used)]

use serde_json::{Value, json};
use tokio::sync::mpsc;

use uniscan_core::DispatchPolicy;
use uniscan_proto::{DispatchOutcome, Event, Response, ServerMessage, SkipReason};
use uniscan_store::{DeliveryStatus, DeliveryStore};

use super::{ConnectionState, Gateway, GatewaySettings};

const PC_ID: &str = "default:PC-01:MID1";

async fn test_gateway_with(dispatch: DispatchPolicy) -> Gateway {
    let store = DeliveryStore::open_in_memory().await.unwrap();
    Gateway::new(
        store,
        GatewaySettings {
            dispatch,
            ..GatewaySettings::default()
        },
    )
}

async fn test_gateway() -> Gateway {
    test_gateway_with(DispatchPolicy::default()).await
}

struct TestClient {
    conn: ConnectionState,
    rx: mpsc::Receiver<ServerMessage>,
    events: Vec<Event>,
    seq: u32,
}

impl TestClient {
    fn new(gw: &Gateway) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            conn: gw.open_connection(tx),
            rx,
            events: Vec::new(),
            seq: 0,
        }
    }

    async fn raw(&mut self, gw: &Gateway, text: &str) -> Response {
        gw.handle_text(&mut self.conn, text).await;
        let mut response = None;
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                ServerMessage::Response(r) => response = Some(r),
                ServerMessage::Event(e) => self.events.push(e),
            }
        }
        response.unwrap()
    }

    async fn send(&mut self, gw: &Gateway, kind: &str, client_type: &str, data: Value) -> Response {
        self.seq += 1;
        let frame = json!({
            "type": kind,
            "requestId": format!("r{}", self.seq),
            "clientType": client_type,
            "data": data,
        });
        let resp = self.raw(gw, &frame.to_string()).await;
        assert_eq!(resp.request_id.as_deref(), Some(format!("r{}", self.seq).as_str()));
        resp
    }

    /// Pick up frames pushed by other connections' handlers.
    fn pump(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            if let ServerMessage::Event(e) = msg {
                self.events.push(e);
            }
        }
    }

    fn take(&mut self, name: &str) -> Vec<Event> {
        self.pump();
        let (hit, rest) = std::mem::take(&mut self.events)
            .into_iter()
            .partition(|e| e.event == name);
        self.events = rest;
        hit
    }

    fn last(&mut self, name: &str) -> Event {
        self.take(name).pop().unwrap()
    }
}

fn data(resp: &Response) -> &Value {
    assert!(resp.ok, "expected ok response, got {:?}", resp.error);
    resp.data.as_ref().unwrap()
}

fn error_code(resp: &Response) -> String {
    assert!(!resp.ok);
    serde_json::to_value(resp.error.as_ref().unwrap().code)
        .unwrap()
        .as_str()
        .unwrap()
        .to_string()
}

async fn hello(gw: &Gateway, agent: &mut TestClient) -> (String, String) {
    let resp = agent
        .send(
            gw,
            "pcAgentHello",
            "pcAgent",
            json!({"group": "default", "deviceName": "PC-01", "machineId": "MID1"}),
        )
        .await;
    let d = data(&resp);
    (
        d["code"].as_str().unwrap().to_string(),
        d["pin"].as_str().unwrap().to_string(),
    )
}

/// Agent hello, scanner appInit, scanner pairRequest.
async fn paired(gw: &Gateway) -> (TestClient, TestClient) {
    let mut agent = TestClient::new(gw);
    let mut scanner = TestClient::new(gw);
    let (code, pin) = hello(gw, &mut agent).await;
    data(&scanner.send(gw, "appInit", "app", json!({"eqid": "ABC123"})).await);
    data(
        &scanner
            .send(gw, "pairRequest", "app", json!({"eqid": "ABC123", "code": code, "pin": pin}))
            .await,
    );
    agent.pump();
    agent.events.clear();
    scanner.events.clear();
    (agent, scanner)
}

async fn scan(gw: &Gateway, scanner: &mut TestClient, barcode: &str) -> Vec<String> {
    let resp = scanner
        .send(gw, "scanBarcode", "app", json!({"eqid": "ABC123", "barcode": barcode}))
        .await;
    data(&resp)["deliveryIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

// === Protocol basics ===

#[tokio::test]
async fn ping_pongs() {
    let gw = test_gateway().await;
    let mut c = TestClient::new(&gw);
    let resp = c.send(&gw, "ping", "app", json!({})).await;
    assert_eq!(data(&resp)["pong"], true);
}

#[tokio::test]
async fn malformed_json_is_rejected_and_connection_survives() {
    let gw = test_gateway().await;
    let mut c = TestClient::new(&gw);
    let resp = c.raw(&gw, "{nope").await;
    assert_eq!(error_code(&resp), "BAD_JSON");
    assert!(resp.request_id.is_none());

    assert!(c.send(&gw, "ping", "app", json!({})).await.ok);
}

#[tokio::test]
async fn unknown_type_is_rejected() {
    let gw = test_gateway().await;
    let mut c = TestClient::new(&gw);
    let resp = c.send(&gw, "sendImage", "app", json!({})).await;
    assert_eq!(error_code(&resp), "UNKNOWN");
}

#[tokio::test]
async fn missing_fields_are_invalid() {
    let gw = test_gateway().await;
    let mut c = TestClient::new(&gw);
    let resp = c.send(&gw, "scanBarcode", "app", json!({"eqid": "ABC123"})).await;
    assert_eq!(error_code(&resp), "INVALID");
    let resp = c.send(&gw, "pairRequest", "app", json!({"code": "123456"})).await;
    assert_eq!(error_code(&resp), "INVALID");
}

#[tokio::test]
async fn app_init_allocates_or_resolves() {
    let gw = test_gateway().await;
    let mut c = TestClient::new(&gw);
    let resp = c.send(&gw, "appInit", "app", json!({})).await;
    let eqid = data(&resp)["eqid"].as_str().unwrap().to_string();
    assert_eq!(eqid.len(), 6);
    assert_eq!(data(&resp)["alias"], "SCANNER");

    let resp = c.send(&gw, "appInit", "app", json!({"eqid": eqid})).await;
    assert_eq!(data(&resp)["eqid"], eqid.as_str());
    assert_eq!(gw.connections().scanner_count().await, 2);
}

#[tokio::test]
async fn app_init_rejects_malformed_eqid() {
    let gw = test_gateway().await;
    let mut c = TestClient::new(&gw);
    for bad in ["ABC", "ABC1234", "abc123", "AB-123", "../../x"] {
        let resp = c.send(&gw, "appInit", "app", json!({"eqid": bad})).await;
        assert_eq!(error_code(&resp), "INVALID", "{bad} accepted");
        assert!(gw.store().get_app(bad).await.unwrap().is_none());
    }
    assert_eq!(gw.connections().scanner_count().await, 0);

    // Blank means "allocate one".
    let resp = c.send(&gw, "appInit", "app", json!({"eqid": "  "})).await;
    assert_eq!(data(&resp)["eqid"].as_str().unwrap().len(), 6);
}

// === Pairing ===

#[tokio::test]
async fn hello_then_pair_notifies_both_sides() {
    let gw = test_gateway().await;
    let mut agent = TestClient::new(&gw);
    let mut scanner = TestClient::new(&gw);

    let resp = agent
        .send(
            &gw,
            "pcAgentHello",
            "pcAgent",
            json!({"group": "default", "deviceName": "PC-01", "machineId": "MID1"}),
        )
        .await;
    assert_eq!(data(&resp)["pcId"], PC_ID);

    let code_event = agent.last("pairingCode");
    let code = code_event.data["code"].as_str().unwrap().to_string();
    let pin = code_event.data["pin"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 6);
    assert_eq!(pin.len(), 4);
    assert_eq!(agent.last("registeredScanners").data["count"], 0);

    data(&scanner.send(&gw, "appInit", "app", json!({"eqid": "ABC123"})).await);
    let resp = scanner
        .send(&gw, "pairRequest", "app", json!({"eqid": "ABC123", "code": code, "pin": pin}))
        .await;
    assert_eq!(
        data(&resp),
        &json!({"eqid": "ABC123", "pcId": PC_ID, "enabled": true})
    );

    assert_eq!(scanner.last("paired").data["pcId"], PC_ID);
    assert_eq!(agent.last("paired").data["eqid"], "ABC123");
    assert_eq!(agent.last("registeredScanners").data["count"], 1);

    // One-time use.
    let resp = scanner
        .send(&gw, "pairRequest", "app", json!({"eqid": "ABC123", "code": code, "pin": pin}))
        .await;
    assert_eq!(error_code(&resp), "NOT_FOUND");
}

#[tokio::test]
async fn pairing_errors_surface_codes() {
    let gw = test_gateway().await;
    let mut agent = TestClient::new(&gw);
    let mut scanner = TestClient::new(&gw);
    let (code, pin) = hello(&gw, &mut agent).await;
    let wrong = if pin == "0000" { "1111" } else { "0000" };

    let resp = scanner
        .send(&gw, "pairRequest", "app", json!({"eqid": "ABC123", "code": code}))
        .await;
    assert_eq!(error_code(&resp), "PIN_REQUIRED");

    let resp = scanner
        .send(&gw, "pairRequest", "app", json!({"eqid": "ABC123", "code": code, "pin": wrong}))
        .await;
    assert_eq!(error_code(&resp), "PIN_MISMATCH");

    let resp = scanner
        .send(&gw, "pairRequest", "app", json!({"eqid": "ABC123", "code": "000000", "pin": pin}))
        .await;
    assert_eq!(error_code(&resp), "NOT_FOUND");
}

#[tokio::test]
async fn pair_list_and_set_enabled() {
    let gw = test_gateway().await;
    let (_agent, mut scanner) = paired(&gw).await;

    let resp = scanner.send(&gw, "pairList", "app", json!({"eqid": "ABC123"})).await;
    assert_eq!(
        data(&resp)["list"],
        json!([{"pcId": PC_ID, "enabled": true, "online": true}])
    );

    let resp = scanner
        .send(&gw, "pairSetEnabled", "app", json!({"eqid": "ABC123", "pcId": PC_ID, "enabled": false}))
        .await;
    assert_eq!(data(&resp)["enabled"], false);

    let resp = scanner.send(&gw, "pairList", "app", json!({"eqid": "ABC123"})).await;
    assert_eq!(data(&resp)["list"][0]["enabled"], false);
}

// === Scans and dispatch ===

#[tokio::test]
async fn scan_creates_one_pending_delivery_per_enabled_pairing() {
    let gw = test_gateway().await;
    let mut scanner = TestClient::new(&gw);
    for pc in ["pc1", "pc2"] {
        data(
            &scanner
                .send(&gw, "pairSetEnabled", "app", json!({"eqid": "ABC123", "pcId": pc, "enabled": true}))
                .await,
        );
    }
    data(
        &scanner
            .send(&gw, "pairSetEnabled", "app", json!({"eqid": "ABC123", "pcId": "pc3", "enabled": false}))
            .await,
    );

    let resp = scanner
        .send(&gw, "scanBarcode", "app", json!({"eqid": "ABC123", "barcode": "000111"}))
        .await;
    let body = data(&resp);
    assert_eq!(body["deliveryIds"].as_array().unwrap().len(), 2);
    assert_eq!(body["targets"], json!(["pc1", "pc2"]));
    assert_eq!(body["scanId"], body["jobId"]);

    let scan_id = body["scanId"].as_str().unwrap();
    let rows = gw.store().deliveries_for_scan(scan_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|d| d.status == DeliveryStatus::Pending));

    let update = scanner.last("scanJobUpdate");
    assert_eq!(update.data["targets"].as_array().unwrap().len(), 2);
    assert_eq!(update.data["targets"][0]["status"], "pending");
}

#[tokio::test]
async fn scan_dispatch_ack_round_trip() {
    let gw = test_gateway().await;
    let (mut agent, mut scanner) = paired(&gw).await;
    let ids = scan(&gw, &mut scanner, "9999").await;
    assert_eq!(ids.len(), 1);

    let outcome = gw.trigger_dispatch(&ids[0]).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Delivered { attempt: 1 });

    let deliver = agent.last("deliverBarcode");
    assert_eq!(deliver.data["barcode"], "9999");
    assert_eq!(deliver.data["attempt"], 1);
    assert_eq!(deliver.data["deliveryId"], ids[0].as_str());
    assert_eq!(deliver.data["suffixKey"], "Enter");
    assert_eq!(deliver.data["jobId"], deliver.data["scanId"]);
    assert_eq!(scanner.last("scanJobUpdate").data["targets"][0]["status"], "sent");

    let resp = agent
        .send(
            &gw,
            "deliverAck",
            "pcAgent",
            json!({
                "pcId": PC_ID,
                "scanId": deliver.data["scanId"],
                "deliveryId": ids[0],
                "attempt": 1,
                "ok": true,
                "agentAttempt": 1,
                "inputMethod": "scanCode",
                "durationMs": 40,
            }),
        )
        .await;
    assert_eq!(data(&resp), &json!({"received": true, "status": "ack_ok"}));

    let update = scanner.last("scanJobUpdate");
    assert_eq!(update.data["targets"][0]["pcId"], PC_ID);
    assert_eq!(update.data["targets"][0]["status"], "ack_ok");

    let row = gw.store().get_delivery(&ids[0]).await.unwrap().unwrap();
    assert_eq!(row.input_method.as_deref(), Some("scanCode"));
    assert_eq!(row.agent_attempt, Some(1));

    let again = gw.trigger_dispatch(&ids[0]).await.unwrap();
    assert_eq!(again, DispatchOutcome::Skipped(SkipReason::AlreadyAcked));
}

#[tokio::test]
async fn ack_without_delivery_id_matches_by_scan() {
    let gw = test_gateway().await;
    let (mut agent, mut scanner) = paired(&gw).await;
    let ids = scan(&gw, &mut scanner, "42").await;
    gw.trigger_dispatch(&ids[0]).await.unwrap();
    let scan_id = agent.last("deliverBarcode").data["scanId"].clone();

    let resp = agent
        .send(
            &gw,
            "deliverAck",
            "pcAgent",
            json!({"jobId": scan_id, "attempt": 1, "ok": false, "error": "FOCUS_FAIL", "agentAttempt": 5}),
        )
        .await;
    assert_eq!(data(&resp)["status"], "ack_fail");
    let row = gw.store().get_delivery(&ids[0]).await.unwrap().unwrap();
    assert_eq!(row.ack_error.as_deref(), Some("FOCUS_FAIL"));
    assert_eq!(scanner.last("scanJobUpdate").data["targets"][0]["error"], "FOCUS_FAIL");
}

#[tokio::test]
async fn ack_is_only_accepted_from_the_owning_agent() {
    let gw = test_gateway().await;
    let (_agent, mut scanner) = paired(&gw).await;
    let ids = scan(&gw, &mut scanner, "42").await;

    let resp = scanner
        .send(&gw, "deliverAck", "app", json!({"deliveryId": ids[0], "ok": true}))
        .await;
    assert_eq!(error_code(&resp), "FORBIDDEN");

    let mut other = TestClient::new(&gw);
    data(&other.send(&gw, "pcAgentHello", "pcAgent", json!({"pcId": "other-pc"})).await);
    let resp = other
        .send(&gw, "deliverAck", "pcAgent", json!({"deliveryId": ids[0], "ok": true}))
        .await;
    assert_eq!(error_code(&resp), "FORBIDDEN");

    let resp = other
        .send(&gw, "deliverAck", "pcAgent", json!({"deliveryId": "missing", "ok": true}))
        .await;
    assert_eq!(error_code(&resp), "NOT_FOUND");
}

#[tokio::test]
async fn offline_agent_gets_delivery_after_reconnect() {
    let gw = test_gateway().await;
    let (agent, mut scanner) = paired(&gw).await;
    gw.on_disconnect(&agent.conn).await;
    assert!(!gw.store().get_device(PC_ID).await.unwrap().unwrap().online);

    let ids = scan(&gw, &mut scanner, "777").await;
    assert_eq!(gw.trigger_dispatch(&ids[0]).await.unwrap(), DispatchOutcome::Offline);
    let row = gw.store().get_delivery(&ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Pending);
    assert_eq!(row.server_attempt, 0);

    let mut agent = TestClient::new(&gw);
    hello(&gw, &mut agent).await;
    assert_eq!(
        gw.trigger_dispatch(&ids[0]).await.unwrap(),
        DispatchOutcome::Delivered { attempt: 1 }
    );
    assert_eq!(agent.last("deliverBarcode").data["barcode"], "777");
}

#[tokio::test]
async fn closed_agent_socket_requeues_delivery() {
    let gw = test_gateway().await;
    let (agent, mut scanner) = paired(&gw).await;
    let ids = scan(&gw, &mut scanner, "777").await;
    // Socket writer gone but receive loop has not finalised yet.
    drop(agent.rx);

    assert_eq!(gw.trigger_dispatch(&ids[0]).await.unwrap(), DispatchOutcome::Offline);
    let row = gw.store().get_delivery(&ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Pending);
    assert_eq!(row.server_attempt, 0);
}

#[tokio::test]
async fn dispatch_past_attempt_cap_finalises_delivery() {
    let gw = test_gateway_with(DispatchPolicy {
        max_attempts: 1,
        ..DispatchPolicy::default()
    })
    .await;
    let (_agent, mut scanner) = paired(&gw).await;
    let ids = scan(&gw, &mut scanner, "1").await;

    assert_eq!(
        gw.trigger_dispatch(&ids[0]).await.unwrap(),
        DispatchOutcome::Delivered { attempt: 1 }
    );
    assert_eq!(
        gw.trigger_dispatch(&ids[0]).await.unwrap(),
        DispatchOutcome::Skipped(SkipReason::AttemptsExhausted)
    );
    let row = gw.store().get_delivery(&ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::AckFail);
    assert_eq!(row.ack_error.as_deref(), Some("ACK_TIMEOUT"));
    assert_eq!(gw.trigger_dispatch("missing").await.unwrap(), DispatchOutcome::NotFound);
}

#[tokio::test]
async fn watchdog_sweep_fails_unacked_final_attempts() {
    let gw = test_gateway_with(DispatchPolicy {
        max_attempts: 1,
        ack_timeout_ms: 0,
        ..DispatchPolicy::default()
    })
    .await;
    let (_agent, mut scanner) = paired(&gw).await;
    let ids = scan(&gw, &mut scanner, "1").await;
    gw.trigger_dispatch(&ids[0]).await.unwrap();
    scanner.take("scanJobUpdate");

    assert_eq!(gw.sweep_exhausted().await.unwrap(), 1);
    let update = scanner.last("scanJobUpdate");
    assert_eq!(update.data["targets"][0]["status"], "ack_fail");
    assert_eq!(update.data["targets"][0]["error"], "ACK_TIMEOUT");
    assert_eq!(gw.sweep_exhausted().await.unwrap(), 0);
}

// === Disconnect ===

#[tokio::test]
async fn agent_disconnect_invalidates_challenge() {
    let gw = test_gateway().await;
    let mut agent = TestClient::new(&gw);
    let mut scanner = TestClient::new(&gw);
    let (code, pin) = hello(&gw, &mut agent).await;

    gw.on_disconnect(&agent.conn).await;
    assert!(!gw.connections().is_agent_online(PC_ID).await);

    let resp = scanner
        .send(&gw, "pairRequest", "app", json!({"eqid": "ABC123", "code": code, "pin": pin}))
        .await;
    assert_eq!(error_code(&resp), "NOT_FOUND");
}

#[tokio::test]
async fn replaced_agent_socket_closing_keeps_successor() {
    let gw = test_gateway().await;
    let mut first = TestClient::new(&gw);
    let mut second = TestClient::new(&gw);
    hello(&gw, &mut first).await;
    let (code, pin) = hello(&gw, &mut second).await;

    gw.on_disconnect(&first.conn).await;
    assert!(gw.connections().is_agent_online(PC_ID).await);
    assert!(gw.store().get_device(PC_ID).await.unwrap().unwrap().online);

    let mut scanner = TestClient::new(&gw);
    let resp = scanner
        .send(&gw, "pairRequest", "app", json!({"eqid": "ABC123", "code": code, "pin": pin}))
        .await;
    assert!(resp.ok);
}

#[tokio::test]
async fn superseded_agent_socket_cannot_ack() {
    let gw = test_gateway().await;
    let (mut stale, mut scanner) = paired(&gw).await;
    let ids = scan(&gw, &mut scanner, "31337").await;

    let mut current = TestClient::new(&gw);
    hello(&gw, &mut current).await;
    gw.trigger_dispatch(&ids[0]).await.unwrap();
    assert_eq!(current.last("deliverBarcode").data["deliveryId"], ids[0].as_str());

    let ack = json!({"pcId": PC_ID, "deliveryId": ids[0], "attempt": 1, "ok": true, "agentAttempt": 1});
    let resp = stale.send(&gw, "deliverAck", "pcAgent", ack.clone()).await;
    assert_eq!(error_code(&resp), "FORBIDDEN");
    let row = gw.store().get_delivery(&ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Sent);

    let resp = current.send(&gw, "deliverAck", "pcAgent", ack).await;
    assert_eq!(data(&resp)["status"], "ack_ok");
}

#[tokio::test]
async fn scanner_disconnect_unregisters_all_identities() {
    let gw = test_gateway().await;
    let mut c = TestClient::new(&gw);
    data(&c.send(&gw, "appInit", "app", json!({"eqid": "AAA111"})).await);
    data(&c.send(&gw, "scanBarcode", "app", json!({"eqid": "BBB222", "barcode": "1"})).await);
    assert_eq!(gw.connections().scanner_count().await, 2);

    gw.on_disconnect(&c.conn).await;
    assert_eq!(gw.connections().scanner_count().await, 0);
}
