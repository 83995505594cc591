//! UniScan wire protocol.
//!
//! Every process in the workspace speaks the same JSON dialect:
//! - `envelope` -- inbound `{type, requestId, clientType, data}` and the
//!   outbound `response` / `event` frames
//! - `messages` -- request payloads and reply bodies for each message type
//! - `events` -- server-pushed event payloads
//! - `internal` -- gateway/dispatcher HTTP bodies

pub mod envelope;
pub mod events;
pub mod internal;
pub mod messages;

pub use envelope::{ClientEnvelope, ClientType, ErrorCode, Event, Response, ServerMessage, WireError};
pub use events::EventKind;
pub use internal::{DispatchOutcome, SkipReason};
pub use messages::MessageKind;

/// Format a Unix millisecond timestamp as ISO-8601 (`2024-01-01T00:00:00.000Z`).
pub fn iso_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Current wall-clock time as ISO-8601.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
