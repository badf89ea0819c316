use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ClusterError;

/// Role of a governed pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    /// Catch-all pool, also runs fallback submissions and chained stages.
    Default,
    /// The single periodic-execution pool.
    Scheduled,
    Archive,
    Compact,
}

impl ExecutorType {
    pub const ALL: [ExecutorType; 4] = [
        ExecutorType::Default,
        ExecutorType::Scheduled,
        ExecutorType::Archive,
        ExecutorType::Compact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorType::Default => "default",
            ExecutorType::Scheduled => "scheduled",
            ExecutorType::Archive => "archive",
            ExecutorType::Compact => "compact",
        }
    }

    /// Prefix used for worker thread names.
    pub fn thread_prefix(&self) -> &'static str {
        match self {
            ExecutorType::Scheduled => "schedule",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorType {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutorType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ClusterError::config(format!("unknown executor type: {}", s)))
    }
}

/// What a saturated pool does with a new submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Fail the submission.
    #[default]
    Abort,
    /// Drop the task; its handle resolves to a rejection.
    Discard,
    /// Run the task on the submitter's own runtime instead.
    CallerRuns,
}

/// Waiting room in front of a pool's running slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCapacity {
    /// Hand-off only: a task is admitted only when a running slot is free.
    Rendezvous,
    Bounded(usize),
}

impl QueueCapacity {
    /// Maps the configured size, where anything `<= 0` means rendezvous.
    pub fn from_config(size: i64) -> Self {
        if size <= 0 {
            QueueCapacity::Rendezvous
        } else {
            QueueCapacity::Bounded(size as usize)
        }
    }

    pub fn waiting_slots(&self) -> usize {
        match self {
            QueueCapacity::Rendezvous => 0,
            QueueCapacity::Bounded(n) => *n,
        }
    }
}

/// Everything needed to build one normal pool.
#[derive(Debug, Clone)]
pub struct PoolDescriptor {
    pub executor_type: ExecutorType,
    pub core_threads: usize,
    pub max_threads: usize,
    pub queue: QueueCapacity,
    pub keep_alive: Duration,
    pub daemon: bool,
    pub thread_prefix: String,
    pub rejection: RejectionPolicy,
}

impl PoolDescriptor {
    pub fn new(executor_type: ExecutorType, core_threads: usize, max_threads: usize) -> Self {
        Self {
            executor_type,
            core_threads,
            max_threads,
            queue: QueueCapacity::Bounded(100),
            keep_alive: Duration::from_millis(1000),
            daemon: true,
            thread_prefix: executor_type.thread_prefix().to_string(),
            rejection: RejectionPolicy::Abort,
        }
    }

    pub fn with_queue(mut self, queue: QueueCapacity) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn with_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }

    pub fn with_rejection(mut self, rejection: RejectionPolicy) -> Self {
        self.rejection = rejection;
        self
    }

    /// Running slots plus waiting slots.
    pub fn capacity(&self) -> usize {
        self.max_threads + self.queue.waiting_slots()
    }
}

/// Global thread budgets enforced at registration time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceCaps {
    /// Largest core size a single normal pool may ask for.
    pub per_pool_core: usize,
    /// Largest max size a single normal pool may ask for.
    pub per_pool_max: usize,
    /// Sum of core threads over all normal pools.
    pub normal_core_total: usize,
    /// Sum of max threads over all normal pools.
    pub normal_max_total: usize,
    /// Sum of core threads over scheduled pools.
    pub scheduled_core_total: usize,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            per_pool_core: 1000,
            per_pool_max: 10000,
            normal_core_total: 6000,
            normal_max_total: 60000,
            scheduled_core_total: 3000,
        }
    }
}

/// Registered thread totals. Only ever grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadAccounting {
    pub normal_core: usize,
    pub normal_max: usize,
    pub scheduled_core: usize,
}

/// Per-pool execution latency, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LatencyStats {
    count: u64,
    sum_ms: u64,
    min_ms: Option<u64>,
    max_ms: u64,
}

impl LatencyStats {
    pub(crate) fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.count += 1;
        self.sum_ms = self.sum_ms.saturating_add(ms);
        self.min_ms = Some(self.min_ms.map_or(ms, |min| min.min(ms)));
        self.max_ms = self.max_ms.max(ms);
    }

    pub(crate) fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            count: self.count,
            min_ms: self.min_ms.unwrap_or_default(),
            max_ms: self.max_ms,
            avg_ms: if self.count == 0 {
                0
            } else {
                self.sum_ms / self.count
            },
        }
    }
}
