//! `UniScan` Core Library
//!
//! Shared functionality for the gateway, dispatcher and agent:
//! - `SQLite` pool helpers and the millisecond clock
//! - Hierarchical configuration, including the server-side dispatch policy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::{Config, DispatchPolicy, GatewayConfig};
pub use error::{Error, Result};
