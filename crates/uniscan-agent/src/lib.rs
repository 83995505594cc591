//! `UniScan` PC agent.
//!
//! Keeps one connection to the gateway alive, feeds delivered barcodes into
//! a single sequential execution queue, and reports every outcome back as a
//! `deliverAck`. The queue outlives individual connections.

pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod input;
pub mod queue;

pub use client::{AgentClient, AgentState};
pub use config::{AgentConfig, ExecutionPolicy, ReconnectPolicy};
pub use error::{AgentClientError, ConfigError};
pub use input::{ExecError, InputDriver, LogDriver, SuffixKey};
pub use queue::{ExecutionQueue, QueueStatus};
