//! Data models for the delivery store.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct App {
    pub eqid: String,
    pub alias: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub pc_id: String,
    pub group_name: String,
    pub device_name: String,
    pub machine_id: String,
    pub online: bool,
    pub last_seen_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Pairing {
    pub eqid: String,
    pub pc_id: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Delivery lifecycle.
///
/// `pending -> dispatching -> sent -> {ack_ok | ack_fail}`; `dispatching`
/// falls back to `pending` when a lease is released or expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Dispatching,
    Sent,
    AckOk,
    AckFail,
}

impl DeliveryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatching => "dispatching",
            Self::Sent => "sent",
            Self::AckOk => "ack_ok",
            Self::AckFail => "ack_fail",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::AckOk | Self::AckFail)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `status` column value outside the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown delivery status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl TryFrom<String> for DeliveryStatus {
    type Error = UnknownStatus;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(Self::Pending),
            "dispatching" => Ok(Self::Dispatching),
            "sent" => Ok(Self::Sent),
            "ack_ok" => Ok(Self::AckOk),
            "ack_fail" => Ok(Self::AckFail),
            _ => Err(UnknownStatus(s)),
        }
    }
}

/// One unit of dispatch work: one barcode to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    pub id: String,
    pub scan_id: String,
    pub eqid: String,
    pub pc_id: String,
    pub barcode: String,
    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,
    pub server_attempt: i64,
    pub last_sent_at: Option<i64>,
    pub lock_owner: Option<String>,
    pub lock_until: Option<i64>,
    pub ack_ok: Option<bool>,
    pub ack_error: Option<String>,
    pub agent_attempt: Option<i64>,
    pub input_method: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Delivery {
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
