//! Heartbeat Module
//!
//! Slave liveness reporting.
//!
//! ## Components
//! - **`service`**: the slave side. A fixed-delay schedule sends one report
//!   per interval to the master and recovers from failed reports by
//!   re-resolving the master.
//! - **`manager`**: the master side. Serves the `heartbeat/report` RPC and
//!   keeps the latest report of every slave.
//! - **`resolver`**: where the master currently lives.
//! - **`types`**: wire messages, the stub and the listener hook.

pub mod manager;
pub mod resolver;
pub mod service;
pub mod types;

pub use manager::HeartbeatManager;
pub use resolver::{MasterResolver, StaticMasterResolver};
pub use service::HeartbeatService;
pub use types::{HeartbeatListener, HeartbeatRecord, HeartbeatRequest, HeartbeatResponse, HeartbeatStub};

#[cfg(test)]
mod tests;
