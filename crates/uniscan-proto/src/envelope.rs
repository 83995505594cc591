//! Frame envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side of the system a connection claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientType {
    App,
    PcAgent,
}

impl ClientType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "app" => Some(Self::App),
            "pcAgent" => Some(Self::PcAgent),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::PcAgent => "pcAgent",
        }
    }
}

/// Inbound frame: `{type, requestId?, clientType?, data}`.
///
/// `type` and `clientType` stay as raw strings so an unrecognised value can
/// still be answered with a structured error instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl ClientEnvelope {
    /// Build an outbound request (used by the agent).
    pub fn request(
        kind: &str,
        request_id: impl Into<String>,
        client_type: ClientType,
        data: &impl Serialize,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            request_id: Some(request_id.into()),
            client_type: Some(client_type.as_str().to_string()),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn client_type(&self) -> Option<ClientType> {
        self.client_type.as_deref().and_then(ClientType::parse)
    }

    /// Decode `data` into a typed payload. A missing `data` field decodes as
    /// an empty object so payloads made of defaults still parse.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        match &self.data {
            Value::Null => serde_json::from_value(Value::Object(serde_json::Map::new())),
            other => T::deserialize(other),
        }
    }
}

/// Structured error codes carried in `response.error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Invalid,
    BadJson,
    Unknown,
    NotFound,
    PinRequired,
    PinMismatch,
    Forbidden,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Reply correlated to a request by `requestId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    pub timestamp: String,
}

/// Fire-and-forget notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    pub data: Value,
    pub timestamp: String,
}

/// Outbound frame, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Response(Response),
    Event(Event),
}

impl ServerMessage {
    pub fn ok(request_id: Option<String>, data: Value) -> Self {
        Self::Response(Response {
            request_id,
            ok: true,
            data: Some(data),
            error: None,
            timestamp: crate::now_iso(),
        })
    }

    pub fn error(request_id: Option<String>, error: WireError) -> Self {
        Self::Response(Response {
            request_id,
            ok: false,
            data: None,
            error: Some(error),
            timestamp: crate::now_iso(),
        })
    }

    pub fn event(name: &str, data: Value) -> Self {
        Self::Event(Event {
            event: name.to_string(),
            data,
            timestamp: crate::now_iso(),
        })
    }

    pub fn to_json(&self) -> String {
        // Serializing these types cannot fail: every map key is a string.
        serde_json::to_string(self).unwrap_or_default()
    }
}
