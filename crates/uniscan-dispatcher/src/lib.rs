//! `UniScan` dispatch scheduler.
//!
//! Leases eligible deliveries from the shared store and asks the gateway to
//! push them. Any number of instances may run against one database; the
//! store's single-statement claim is the only coordination between them.

pub mod config;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod target;

pub use config::SchedulerConfig;
pub use error::DispatchError;
pub use scheduler::Scheduler;
pub use target::{DispatchTarget, HttpDispatchTarget};
