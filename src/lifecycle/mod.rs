//! Node Lifecycle Module
//!
//! Startup, idle and teardown of a master or slave process.
//!
//! ## Submodules
//! - **`flags`**: independent atomic status facets (`stopped`, `aborted`, ...).
//! - **`sleeper`**: the interruptible idle-loop sleep.
//! - **`monitor`**: progress records for long-running node activities.
//! - **`node`**: the `Node` orchestrator, its shared `NodeContext` and the
//!   `SubService` contract components implement.

pub mod flags;
pub mod monitor;
pub mod node;
pub mod sleeper;

pub use flags::{FlagSnapshot, NodeFlags};
pub use monitor::{MonitoredTask, TaskMonitor, TaskState, TaskStatusSnapshot};
pub use node::{LifecycleHandle, Node, NodeContext, SubService};
pub use sleeper::Sleeper;
