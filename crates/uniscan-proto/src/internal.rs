//! Bodies for the internal HTTP surface between gateway and dispatcher.

use serde::{Deserialize, Serialize};

/// `POST /internal/dispatch` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub delivery_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyAcked,
    AttemptsExhausted,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyAcked => "already_acked",
            Self::AttemptsExhausted => "attempts_exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "already_acked" => Some(Self::AlreadyAcked),
            "attempts_exhausted" => Some(Self::AttemptsExhausted),
            _ => None,
        }
    }
}

/// Result of asking the gateway to push one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Pushed to the agent socket as server attempt `attempt`.
    Delivered { attempt: i64 },
    /// No live socket for the target agent (`pc_offline`).
    Offline,
    /// Nothing to do for this delivery.
    Skipped(SkipReason),
    NotFound,
}

pub const PC_OFFLINE: &str = "pc_offline";

/// Header carrying the shared secret on internal HTTP calls.
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

/// Wire form of a [`DispatchOutcome`]; only the fields relevant to the
/// outcome are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchOutcome {
    /// HTTP status used by `POST /internal/dispatch`.
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Delivered { .. } | Self::Skipped(_) => 200,
            Self::Offline => 202,
            Self::NotFound => 404,
        }
    }

    pub fn to_reply(self, delivery_id: &str) -> DispatchReply {
        let delivery_id = Some(delivery_id.to_string());
        match self {
            Self::Delivered { attempt } => DispatchReply {
                delivered: Some(true),
                delivery_id,
                attempt: Some(attempt),
                ..DispatchReply::default()
            },
            Self::Offline => DispatchReply {
                queued: Some(true),
                reason: Some(PC_OFFLINE.to_string()),
                delivery_id,
                ..DispatchReply::default()
            },
            Self::Skipped(reason) => DispatchReply {
                skipped: Some(true),
                reason: Some(reason.as_str().to_string()),
                delivery_id,
                ..DispatchReply::default()
            },
            Self::NotFound => DispatchReply {
                error: Some("not_found".to_string()),
                delivery_id,
                ..DispatchReply::default()
            },
        }
    }

    /// Interpret an HTTP reply. Returns `None` for anything the protocol
    /// does not define.
    pub fn from_reply(status: u16, reply: &DispatchReply) -> Option<Self> {
        match status {
            404 => Some(Self::NotFound),
            202 if reply.queued == Some(true) => Some(Self::Offline),
            200 if reply.delivered == Some(true) => Some(Self::Delivered {
                attempt: reply.attempt.unwrap_or(0),
            }),
            200 if reply.skipped == Some(true) => reply
                .reason
                .as_deref()
                .and_then(SkipReason::parse)
                .map(Self::Skipped),
            _ => None,
        }
    }
}

/// `POST /enqueue` request (gateway to dispatcher).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(default)]
    pub delivery_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReply {
    pub ok: bool,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub ok: bool,
    pub ts: String,
    pub scanners: usize,
    pub agents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherHealth {
    pub ok: bool,
    pub service_id: String,
    pub ts: String,
    pub in_flight: usize,
}
