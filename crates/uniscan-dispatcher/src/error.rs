//! Dispatch error types.

use uniscan_store::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway answered with unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
