//! Server-pushed event payloads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PairingCode,
    Paired,
    RegisteredScanners,
    ScanJobUpdate,
    DeliverBarcode,
}

impl EventKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pairingCode" => Self::PairingCode,
            "paired" => Self::Paired,
            "registeredScanners" => Self::RegisteredScanners,
            "scanJobUpdate" => Self::ScanJobUpdate,
            "deliverBarcode" => Self::DeliverBarcode,
            _ => return None,
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PairingCode => "pairingCode",
            Self::Paired => "paired",
            Self::RegisteredScanners => "registeredScanners",
            Self::ScanJobUpdate => "scanJobUpdate",
            Self::DeliverBarcode => "deliverBarcode",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub code: String,
    pub pin: String,
    pub pc_id: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paired {
    pub eqid: String,
    pub pc_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredScanners {
    pub count: i64,
}

/// Per-target line of a [`ScanJobUpdate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub pc_id: String,
    pub delivery_id: String,
    pub status: String,
    pub attempt: i64,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate status snapshot of every delivery sharing one scan id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobUpdate {
    pub job_id: String,
    pub eqid: String,
    pub kind: String,
    pub barcode: String,
    pub targets: Vec<TargetStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverBarcode {
    pub delivery_id: String,
    pub job_id: String,
    pub scan_id: String,
    pub attempt: i64,
    pub eqid: String,
    pub barcode: String,
    pub suffix_key: String,
}
