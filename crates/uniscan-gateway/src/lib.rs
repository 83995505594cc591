//! `UniScan` realtime gateway.
//!
//! Terminates scanner and agent WebSocket connections, runs the pairing
//! handshake, turns scans into deliveries and pushes leased deliveries to
//! connected agents on behalf of the dispatch scheduler.

pub mod error;
pub mod notifier;
pub mod pairing;
pub mod registry;
pub mod server;

pub use error::GatewayError;
pub use server::{ConnectionState, Gateway, GatewaySettings};
