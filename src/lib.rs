//! Cluster Node Runtime
//!
//! The coordination substrate of a master/slave data-cluster node: governed
//! thread pools, node-to-node RPC, and the heartbeat-driven lifecycle that
//! keeps a slave attached to its master. Business services plug into a
//! [`lifecycle::Node`] as sub-services.
//!
//! ## Architecture Modules
//! - **`config`**: the single `NodeConfig` value, loaded from TOML or built in code.
//! - **`error`**: the shared `ClusterError`/`TransportError` taxonomy.
//! - **`executor`**: resource-budgeted pools and the task scheduler on top of them.
//! - **`identity`**: `(host, port, start_time)` process identities.
//! - **`transport`**: HTTP/2 + bincode channels, pools, stubs, registry and server.
//! - **`heartbeat`**: slave reports, master-side slave table, master resolution.
//! - **`lifecycle`**: node flags, idle sleeper, task monitor and the ordered
//!   startup/shutdown of a node.

pub mod config;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod identity;
pub mod lifecycle;
pub mod transport;
