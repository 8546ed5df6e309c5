//! Symbion IPMI manager: coordinates a fixed pool of IPMI pollers.
//!
//! The [`Manager`] owns every piece of mutable state and is driven by a
//! single inbound channel of [`ManagerEvent`]s; transports (MQTT, in-process
//! channels), the HTTP API and the health publisher only ever talk to it
//! through that channel.

pub mod balancer;
pub mod config;
pub mod directory;
pub mod error;
pub mod health;
pub mod history;
pub mod hosts;
pub mod http;
pub mod manager;
pub mod models;
pub mod mqtt;
pub mod pool;
pub mod protocol;
pub mod schedule;
pub mod transport;
pub mod worker;

pub use config::{ManagerConfig, WorkerLossPolicy};
pub use error::ManagerError;
pub use manager::{Manager, ManagerStats};
pub use transport::{ManagerEvent, WorkerLink};
