//! Task Scheduler
//!
//! Routes envelopes onto governed pools. A submission for a type with no
//! registered pool runs on the DEFAULT pool instead, with a warning.

use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::envelope::{CyclicTaskEnvelope, TaskEnvelope};
use super::governor::ResourceGovernor;
use super::pool::{CyclicTaskHandle, GovernedPool, ScheduledPool, TaskHandle};
use super::types::ExecutorType;
use crate::error::{ClusterError, Result};

#[derive(Clone)]
pub struct TaskScheduler {
    governor: Arc<ResourceGovernor>,
    fallbacks: Arc<AtomicU64>,
}

impl TaskScheduler {
    pub fn new(governor: Arc<ResourceGovernor>) -> Self {
        Self {
            governor,
            fallbacks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    /// Submissions rerouted to DEFAULT because their own pool was missing.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    fn resolve(&self, executor_type: ExecutorType, label: &str) -> Result<Arc<GovernedPool>> {
        if let Some(pool) = self.governor.pool(executor_type) {
            return Ok(pool);
        }

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "No {} pool registered, running task {} on the {} pool",
            executor_type,
            label,
            ExecutorType::Default
        );
        self.governor
            .pool(ExecutorType::Default)
            .ok_or_else(|| ClusterError::config("no default pool registered"))
    }

    fn scheduled(&self) -> Result<Arc<ScheduledPool>> {
        self.governor
            .scheduled_pool()
            .ok_or_else(|| ClusterError::config("no scheduled pool registered"))
    }

    pub fn submit<T>(&self, envelope: TaskEnvelope<T>) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
    {
        let (executor_type, label, body) = envelope.into_parts();
        let pool = self.resolve(executor_type, &label)?;
        tracing::debug!("Submitting {} to the {} pool", label, pool.executor_type());
        pool.spawn(&label, body)
    }

    /// Runs `envelope` on its own pool, then `transform` on the DEFAULT pool
    /// with the first stage's value. The returned handle resolves to the
    /// transform's output, or to the first error of either stage.
    ///
    /// The waiter between the two stages holds no pool permit; the DEFAULT
    /// pool admits `transform` only once the first stage has finished.
    pub fn submit_then<T, U, F, Fut>(&self, envelope: TaskEnvelope<T>, transform: F) -> Result<TaskHandle<U>>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        let label = format!("{}-then", envelope.label());
        let default = self.resolve(ExecutorType::Default, &label)?;
        let first = self.submit(envelope)?;

        let pool = default.clone();
        let waiter = default.runtime_handle().spawn(async move {
            let value = first.await?;
            let second = pool.spawn(&label, transform(value).boxed())?;
            Ok::<U, anyhow::Error>(second.await?)
        });

        Ok(TaskHandle::spawned(ExecutorType::Default, waiter))
    }

    /// Runs `envelope` once on the scheduled pool after `delay`.
    pub fn submit_delayed<T>(&self, envelope: TaskEnvelope<T>, delay: Duration) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
    {
        let (_, label, body) = envelope.into_parts();
        self.scheduled()?.spawn_delayed(&label, delay, body)
    }

    pub fn submit_cyclic(&self, envelope: CyclicTaskEnvelope) -> Result<CyclicTaskHandle> {
        self.scheduled()?.spawn_cyclic(envelope)
    }

    pub fn stop(&self) {
        self.governor.stop();
    }
}
