//! Governed Executor Module
//!
//! Owns every thread the node runs work on. Pools are registered once at
//! startup against global thread budgets and then addressed by
//! [`ExecutorType`](types::ExecutorType).
//!
//! ## Architecture Overview
//! 1. **Governor**: `ResourceGovernor` checks each pool against the per-pool
//!    and global caps, builds it, and keeps the registered totals.
//! 2. **Pools**: a `GovernedPool` is a dedicated tokio runtime with bounded
//!    admission (max threads + queue) and a rejection policy. The single
//!    `ScheduledPool` runs delayed and cyclic work.
//! 3. **Scheduling**: `TaskScheduler` routes `TaskEnvelope`s by type, falling
//!    back to DEFAULT, chains follow-up stages, and drives
//!    `CyclicTaskEnvelope`s so that one failed run never ends a schedule.
//!
//! ## Submodules
//! - **`types`**: executor types, pool descriptors, caps and latency stats.
//! - **`pool`**: runtimes, task handles and the cyclic driver.
//! - **`governor`**: registration and accounting.
//! - **`envelope`**: one-shot and cyclic work units.
//! - **`scheduler`**: the submission API.

pub mod envelope;
pub mod governor;
pub mod pool;
pub mod scheduler;
pub mod types;

pub use envelope::{CyclicTaskEnvelope, TaskEnvelope};
pub use governor::ResourceGovernor;
pub use pool::{CyclicTaskHandle, GovernedPool, ScheduledPool, TaskHandle};
pub use scheduler::TaskScheduler;
pub use types::{ExecutorType, PoolDescriptor, QueueCapacity, RejectionPolicy, ResourceCaps};

#[cfg(test)]
mod tests;
