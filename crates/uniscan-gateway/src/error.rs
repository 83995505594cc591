//! Gateway error type and its mapping to wire errors.

use uniscan_core::db::DatabaseError;
use uniscan_proto::{ErrorCode, WireError};

use crate::pairing::PairingError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl GatewayError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Structured error sent back to the client. Internal failures are not
    /// described beyond a generic message.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Invalid(msg) => WireError::new(ErrorCode::Invalid, msg.clone()),
            Self::UnknownType(_) => WireError::new(ErrorCode::Unknown, "unknown message type"),
            Self::NotFound(msg) => WireError::new(ErrorCode::NotFound, msg.clone()),
            Self::Forbidden(msg) => WireError::new(ErrorCode::Forbidden, msg.clone()),
            Self::Pairing(e) => e.to_wire(),
            Self::Database(_) => WireError::new(ErrorCode::Internal, "internal error"),
        }
    }

    /// Whether the failure is the server's fault rather than the client's.
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Pairing(PairingError::CodeSpaceExhausted))
    }
}
