//! Resource Governor
//!
//! Registers pools under the global thread budgets. A registration is
//! checked and applied under one lock: it either fits every cap and is
//! stored, or it is rejected with no change to the pool table or the totals.
//! Totals only grow; [`ResourceGovernor::stop`] clears the table and leaves
//! them as they were.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::pool::{GovernedPool, ScheduledPool};
use super::types::{ExecutorType, LatencySnapshot, PoolDescriptor, ResourceCaps, ThreadAccounting};
use crate::config::ExecutorConfig;
use crate::error::{ClusterError, Result};

#[derive(Default)]
struct GovernorState {
    accounting: ThreadAccounting,
    pools: HashMap<ExecutorType, Arc<GovernedPool>>,
    scheduled: Option<Arc<ScheduledPool>>,
}

pub struct ResourceGovernor {
    caps: ResourceCaps,
    state: Mutex<GovernorState>,
}

impl ResourceGovernor {
    pub fn new(caps: ResourceCaps) -> Self {
        Self {
            caps,
            state: Mutex::new(GovernorState::default()),
        }
    }

    /// Builds a governor and registers every pool the config names, plus
    /// the scheduled pool.
    pub fn from_config(config: &ExecutorConfig) -> Result<Arc<Self>> {
        let governor = Arc::new(Self::new(config.caps.clone()));
        for descriptor in config.descriptors()? {
            governor.register_pool(descriptor)?;
        }
        governor.register_scheduled_pool(config.scheduled.core_threads, config.scheduled.daemon)?;
        Ok(governor)
    }

    pub fn caps(&self) -> &ResourceCaps {
        &self.caps
    }

    pub fn register_pool(&self, descriptor: PoolDescriptor) -> Result<Arc<GovernedPool>> {
        let executor_type = descriptor.executor_type;
        if executor_type == ExecutorType::Scheduled {
            return Err(ClusterError::config(
                "the scheduled pool is registered with register_scheduled_pool",
            ));
        }
        if descriptor.max_threads == 0 || descriptor.core_threads > descriptor.max_threads {
            return Err(ClusterError::config(format!(
                "{} pool needs 0 < core_threads <= max_threads, got {}/{}",
                executor_type, descriptor.core_threads, descriptor.max_threads
            )));
        }
        check_cap("per-pool core threads", descriptor.core_threads, self.caps.per_pool_core)?;
        check_cap("per-pool max threads", descriptor.max_threads, self.caps.per_pool_max)?;

        let mut state = self.state.lock();
        if state.pools.contains_key(&executor_type) {
            return Err(ClusterError::DuplicateRegistration {
                kind: "executor type",
                name: executor_type.to_string(),
            });
        }

        let normal_core = state.accounting.normal_core + descriptor.core_threads;
        let normal_max = state.accounting.normal_max + descriptor.max_threads;
        check_cap("normal core threads", normal_core, self.caps.normal_core_total)?;
        check_cap("normal max threads", normal_max, self.caps.normal_max_total)?;

        let pool = Arc::new(GovernedPool::build(descriptor)?);
        state.pools.insert(executor_type, pool.clone());
        state.accounting.normal_core = normal_core;
        state.accounting.normal_max = normal_max;

        let d = pool.descriptor();
        tracing::info!(
            "Registered {} pool: core={}, max={}, queue={:?}, keep_alive={:?}, daemon={}, rejection={:?}",
            executor_type,
            d.core_threads,
            d.max_threads,
            d.queue,
            d.keep_alive,
            d.daemon,
            d.rejection
        );

        Ok(pool)
    }

    /// Registers the process-wide scheduled pool. Only one may exist.
    pub fn register_scheduled_pool(&self, core_threads: usize, daemon: bool) -> Result<Arc<ScheduledPool>> {
        if core_threads == 0 {
            return Err(ClusterError::config("scheduled pool needs at least one thread"));
        }
        check_cap("per-pool core threads", core_threads, self.caps.per_pool_core)?;

        let mut state = self.state.lock();
        if state.scheduled.is_some() {
            return Err(ClusterError::DuplicateRegistration {
                kind: "scheduled pool",
                name: ExecutorType::Scheduled.to_string(),
            });
        }

        let scheduled_core = state.accounting.scheduled_core + core_threads;
        check_cap("scheduled core threads", scheduled_core, self.caps.scheduled_core_total)?;

        let pool = Arc::new(ScheduledPool::build(core_threads, daemon)?);
        state.scheduled = Some(pool.clone());
        state.accounting.scheduled_core = scheduled_core;

        tracing::info!("Registered scheduled pool: core={}, daemon={}", core_threads, daemon);
        Ok(pool)
    }

    pub fn pool(&self, executor_type: ExecutorType) -> Option<Arc<GovernedPool>> {
        self.state.lock().pools.get(&executor_type).cloned()
    }

    pub fn scheduled_pool(&self) -> Option<Arc<ScheduledPool>> {
        self.state.lock().scheduled.clone()
    }

    pub fn registered_types(&self) -> Vec<ExecutorType> {
        let mut types: Vec<ExecutorType> = self.state.lock().pools.keys().copied().collect();
        types.sort();
        types
    }

    pub fn accounting(&self) -> ThreadAccounting {
        self.state.lock().accounting
    }

    /// Latency of every registered pool, the scheduled pool included.
    pub fn latency_report(&self) -> BTreeMap<ExecutorType, LatencySnapshot> {
        let state = self.state.lock();
        let mut report: BTreeMap<ExecutorType, LatencySnapshot> = state
            .pools
            .iter()
            .map(|(executor_type, pool)| (*executor_type, pool.latency()))
            .collect();
        if let Some(scheduled) = &state.scheduled {
            report.insert(ExecutorType::Scheduled, scheduled.latency());
        }
        report
    }

    /// Force-stops every pool and empties the table.
    pub fn stop(&self) {
        let (pools, scheduled) = {
            let mut state = self.state.lock();
            let pools: Vec<Arc<GovernedPool>> = state.pools.drain().map(|(_, pool)| pool).collect();
            (pools, state.scheduled.take())
        };

        if let Some(scheduled) = scheduled {
            scheduled.shutdown_now();
        }
        for pool in pools {
            pool.shutdown_now();
        }
    }
}

fn check_cap(resource: &'static str, requested: usize, limit: usize) -> Result<()> {
    if requested > limit {
        tracing::error!("Refusing registration: {} {} > {}", resource, requested, limit);
        return Err(ClusterError::ResourceExceeded {
            resource,
            requested,
            limit,
        });
    }
    Ok(())
}
