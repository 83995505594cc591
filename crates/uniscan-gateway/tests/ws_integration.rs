#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests over real sockets: scanner and agent WebSockets plus the
//! internal dispatch hook, against an in-memory store.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use uniscan_gateway::notifier::INTERNAL_TOKEN_HEADER;
use uniscan_gateway::server::http::router;
use uniscan_gateway::{Gateway, GatewaySettings};
use uniscan_store::DeliveryStore;

const TOKEN: &str = "test-token";
const WAIT: Duration = Duration::from_secs(5);

async fn spawn_gateway() -> SocketAddr {
    let store = DeliveryStore::open_in_memory().await.unwrap();
    let gateway = Gateway::new(
        store,
        GatewaySettings {
            internal_token: Some(TOKEN.to_string()),
            ..GatewaySettings::default()
        },
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(gateway)).await.unwrap();
    });
    addr
}

struct WsClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    client_type: &'static str,
    pending: VecDeque<Value>,
    seq: u32,
}

impl WsClient {
    async fn connect(addr: SocketAddr, client_type: &'static str) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        Self {
            ws,
            client_type,
            pending: VecDeque::new(),
            seq: 0,
        }
    }

    async fn next_frame(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn request(&mut self, kind: &str, data: Value) -> Value {
        self.seq += 1;
        let request_id = format!("req-{}", self.seq);
        let frame = json!({
            "type": kind,
            "requestId": request_id,
            "clientType": self.client_type,
            "data": data,
        });
        self.ws
            .send(Message::text(frame.to_string()))
            .await
            .unwrap();
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == "response" && frame["requestId"] == request_id.as_str() {
                return frame;
            }
            self.pending.push_back(frame);
        }
    }

    async fn event(&mut self, name: &str) -> Value {
        if let Some(pos) = self.pending.iter().position(|f| f["event"] == name) {
            return self.pending.remove(pos).unwrap()["data"].clone();
        }
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == "event" && frame["event"] == name {
                return frame["data"].clone();
            }
            self.pending.push_back(frame);
        }
    }
}

async fn post_dispatch(addr: SocketAddr, delivery_id: &str, token: Option<&str>) -> (u16, Value) {
    let client = reqwest::Client::new();
    let mut req = client
        .post(format!("http://{addr}/internal/dispatch"))
        .json(&json!({ "deliveryId": delivery_id }));
    if let Some(token) = token {
        req = req.header(INTERNAL_TOKEN_HEADER, token);
    }
    let resp = req.send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn pair_scan_dispatch_and_ack_over_sockets() {
    let addr = spawn_gateway().await;
    let mut agent = WsClient::connect(addr, "pcAgent").await;
    let mut scanner = WsClient::connect(addr, "app").await;

    let hello = agent
        .request(
            "pcAgentHello",
            json!({"group": "line1", "deviceName": "PACK-02", "machineId": "m-42"}),
        )
        .await;
    assert_eq!(hello["ok"], true);
    let pc_id = hello["data"]["pcId"].as_str().unwrap().to_string();
    assert_eq!(pc_id, "line1:PACK-02:m-42");
    let code = agent.event("pairingCode").await;

    let init = scanner.request("appInit", json!({"eqid": "QWE123"})).await;
    assert_eq!(init["data"]["eqid"], "QWE123");

    // Combined code-pin form.
    let combined = format!(
        "{}-{}",
        code["code"].as_str().unwrap(),
        code["pin"].as_str().unwrap()
    );
    let pair = scanner
        .request("pairRequest", json!({"eqid": "QWE123", "code": combined}))
        .await;
    assert_eq!(pair["ok"], true, "{pair}");
    assert_eq!(scanner.event("paired").await["pcId"], pc_id.as_str());
    assert_eq!(agent.event("paired").await["eqid"], "QWE123");

    let scan = scanner
        .request("scanBarcode", json!({"eqid": "QWE123", "barcode": "4006381333931"}))
        .await;
    let delivery_id = scan["data"]["deliveryIds"][0].as_str().unwrap().to_string();

    let (status, body) = post_dispatch(addr, &delivery_id, Some(TOKEN)).await;
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], true);
    assert_eq!(body["attempt"], 1);

    let deliver = agent.event("deliverBarcode").await;
    assert_eq!(deliver["barcode"], "4006381333931");

    let ack = agent
        .request(
            "deliverAck",
            json!({
                "pcId": pc_id,
                "scanId": deliver["scanId"],
                "deliveryId": delivery_id,
                "attempt": deliver["attempt"],
                "ok": true,
                "agentAttempt": 1,
                "inputMethod": "unicode",
            }),
        )
        .await;
    assert_eq!(ack["data"]["status"], "ack_ok");

    loop {
        let update = scanner.event("scanJobUpdate").await;
        if update["targets"][0]["status"] == "ack_ok" {
            break;
        }
    }
}

#[tokio::test]
async fn dispatch_hook_requires_token_and_reports_offline() {
    let addr = spawn_gateway().await;
    let mut scanner = WsClient::connect(addr, "app").await;
    scanner
        .request(
            "pairSetEnabled",
            json!({"eqid": "ZZZ999", "pcId": "nobody", "enabled": true}),
        )
        .await;
    let scan = scanner
        .request("scanBarcode", json!({"eqid": "ZZZ999", "barcode": "1"}))
        .await;
    let delivery_id = scan["data"]["deliveryIds"][0].as_str().unwrap().to_string();

    let (status, _) = post_dispatch(addr, &delivery_id, None).await;
    assert_eq!(status, 401);

    let (status, body) = post_dispatch(addr, &delivery_id, Some(TOKEN)).await;
    assert_eq!(status, 202);
    assert_eq!(body["queued"], true);
    assert_eq!(body["reason"], "pc_offline");

    let (status, _) = post_dispatch(addr, "missing", Some(TOKEN)).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn health_counts_live_sockets() {
    let addr = spawn_gateway().await;
    let mut agent = WsClient::connect(addr, "pcAgent").await;
    agent.request("pcAgentHello", json!({"pcId": "pc-h"})).await;

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["ok"], true);
    assert_eq!(health["agents"], 1);
    assert_eq!(health["scanners"], 0);
}

#[tokio::test]
async fn bad_frames_get_error_responses() {
    let addr = spawn_gateway().await;
    let mut client = WsClient::connect(addr, "app").await;
    client.ws.send(Message::text("not json")).await.unwrap();
    let frame = client.next_frame().await;
    assert_eq!(frame["ok"], false);
    assert_eq!(frame["error"]["code"], "BAD_JSON");

    let resp = client.request("ping", json!({})).await;
    assert_eq!(resp["data"]["pong"], true);
}
