//! Errors raised while loading shared settings.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read settings file {path}: {source}")]
    ReadSettings {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse settings file {path}: {source}")]
    ParseSettings {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A `DispatchPolicy` combination that would break leasing.
    #[error("invalid dispatch policy: {0}")]
    InvalidPolicy(String),
}
