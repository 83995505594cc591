//! Request payloads and reply bodies, keyed by envelope `type`.

use serde::{Deserialize, Serialize};

/// Message types the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    AppInit,
    PcAgentHello,
    PairRequest,
    PairList,
    PairSetEnabled,
    ScanBarcode,
    DeliverAck,
    Ping,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "appInit" => Self::AppInit,
            "pcAgentHello" => Self::PcAgentHello,
            "pairRequest" => Self::PairRequest,
            "pairList" => Self::PairList,
            "pairSetEnabled" => Self::PairSetEnabled,
            "scanBarcode" => Self::ScanBarcode,
            "deliverAck" => Self::DeliverAck,
            "ping" => Self::Ping,
            _ => return None,
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AppInit => "appInit",
            Self::PcAgentHello => "pcAgentHello",
            Self::PairRequest => "pairRequest",
            Self::PairList => "pairList",
            Self::PairSetEnabled => "pairSetEnabled",
            Self::ScanBarcode => "scanBarcode",
            Self::DeliverAck => "deliverAck",
            Self::Ping => "ping",
        }
    }
}

// =========================================================================
// Requests
// =========================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInit {
    #[serde(default)]
    pub eqid: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcAgentHello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pc_id: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    #[serde(default)]
    pub eqid: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub pin: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairList {
    #[serde(default)]
    pub eqid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairSetEnabled {
    #[serde(default)]
    pub eqid: String,
    #[serde(default)]
    pub pc_id: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanBarcode {
    #[serde(default)]
    pub eqid: String,
    #[serde(default)]
    pub barcode: String,
}

/// Outcome of one delivery, reported by the agent.
///
/// Older agents send `jobId` instead of `scanId`; both carry the same value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(default)]
    pub attempt: i64,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub agent_attempt: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_method: Option<String>,
    #[serde(default)]
    pub duration_ms: i64,
}

impl DeliverAck {
    pub fn scan_id(&self) -> Option<&str> {
        self.scan_id
            .as_deref()
            .or(self.job_id.as_deref())
            .filter(|s| !s.is_empty())
    }
}

// =========================================================================
// Replies
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInitReply {
    pub eqid: String,
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    pub pc_id: String,
    pub code: String,
    pub pin: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairReply {
    pub eqid: String,
    pub pc_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingView {
    pub pc_id: String,
    pub enabled: bool,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairListReply {
    pub eqid: String,
    pub list: Vec<PairingView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReply {
    pub scan_id: String,
    pub job_id: String,
    pub delivery_ids: Vec<String>,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReply {
    pub received: bool,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub pong: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_round_trips_names() {
        for kind in [
            MessageKind::AppInit,
            MessageKind::PcAgentHello,
            MessageKind::PairRequest,
            MessageKind::PairList,
            MessageKind::PairSetEnabled,
            MessageKind::ScanBarcode,
            MessageKind::DeliverAck,
            MessageKind::Ping,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("sendImage"), None);
    }

    #[test]
    fn deliver_ack_accepts_job_id() {
        let ack: DeliverAck =
            serde_json::from_str(r#"{"jobId":"s1","attempt":2,"ok":true,"agentAttempt":1}"#)
                .unwrap();
        assert_eq!(ack.scan_id(), Some("s1"));
        assert_eq!(ack.attempt, 2);
        assert!(ack.delivery_id.is_none());
    }

    #[test]
    fn deliver_ack_prefers_scan_id() {
        let ack: DeliverAck = serde_json::from_str(r#"{"scanId":"a","jobId":"b"}"#).unwrap();
        assert_eq!(ack.scan_id(), Some("a"));
    }

    #[test]
    fn empty_scan_id_counts_as_missing() {
        let ack: DeliverAck = serde_json::from_str(r#"{"scanId":""}"#).unwrap();
        assert_eq!(ack.scan_id(), None);
    }

    #[test]
    fn hello_fields_are_camel_case() {
        let hello: PcAgentHello = serde_json::from_str(
            r#"{"group":"default","deviceName":"PC-01","machineId":"MID1"}"#,
        )
        .unwrap();
        assert_eq!(hello.device_name.as_deref(), Some("PC-01"));
        assert_eq!(hello.machine_id.as_deref(), Some("MID1"));
        assert!(hello.pc_id.is_none());
    }
}
