//! Governed Pools
//!
//! Each pool owns a dedicated multi-thread tokio runtime. A normal pool puts
//! two semaphores in front of it: `admission` bounds running plus waiting
//! tasks (the queue), `running` bounds concurrently executing tasks (max
//! threads). A submission that cannot take an admission permit goes through
//! the pool's [`RejectionPolicy`].

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::envelope::CyclicTaskEnvelope;
use super::types::{ExecutorType, LatencySnapshot, LatencyStats, PoolDescriptor, RejectionPolicy};
use crate::error::{ClusterError, Result};

/// Records one execution into the pool's latency stats when dropped, so a
/// failing or panicking body is still counted.
pub(crate) struct TaskTimer {
    started: Instant,
    stats: Arc<Mutex<LatencyStats>>,
}

impl TaskTimer {
    pub(crate) fn start(stats: Arc<Mutex<LatencyStats>>) -> Self {
        Self {
            started: Instant::now(),
            stats,
        }
    }
}

impl Drop for TaskTimer {
    fn drop(&mut self) {
        self.stats.lock().record(self.started.elapsed());
    }
}

/// Runtime, latency and shutdown state shared by normal and scheduled pools.
struct PoolRuntime {
    executor_type: ExecutorType,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    latency: Arc<Mutex<LatencyStats>>,
    shut_down: AtomicBool,
}

impl PoolRuntime {
    fn build(
        executor_type: ExecutorType,
        worker_threads: usize,
        blocking_threads: usize,
        keep_alive: Duration,
        prefix: &str,
    ) -> Result<Self> {
        let counter = Arc::new(AtomicUsize::new(1));
        let name_prefix = format!("thread-{}", prefix);

        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .max_blocking_threads(blocking_threads.max(1))
            .thread_keep_alive(keep_alive)
            .thread_name_fn(move || {
                format!("{}-{}", name_prefix, counter.fetch_add(1, Ordering::Relaxed))
            })
            .enable_all()
            .build()
            .map_err(|e| {
                ClusterError::config(format!("cannot build {} pool runtime: {}", executor_type, e))
            })?;
        let handle = runtime.handle().clone();

        Ok(Self {
            executor_type,
            runtime: Mutex::new(Some(runtime)),
            handle,
            latency: Arc::new(Mutex::new(LatencyStats::default())),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ClusterError::Rejected {
                executor: self.executor_type,
                reason: "pool is shut down",
            });
        }
        Ok(())
    }

    /// Interrupts every task and lets the worker threads exit on their own.
    fn shutdown_now(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }

    fn latency(&self) -> LatencySnapshot {
        self.latency.lock().snapshot()
    }
}

impl Drop for PoolRuntime {
    fn drop(&mut self) {
        // Dropping a Runtime from inside async code panics.
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// A bounded pool for one [`ExecutorType`].
pub struct GovernedPool {
    descriptor: PoolDescriptor,
    inner: PoolRuntime,
    admission: Arc<Semaphore>,
    running: Arc<Semaphore>,
}

impl GovernedPool {
    pub(crate) fn build(descriptor: PoolDescriptor) -> Result<Self> {
        let inner = PoolRuntime::build(
            descriptor.executor_type,
            descriptor.core_threads,
            descriptor.max_threads,
            descriptor.keep_alive,
            &descriptor.thread_prefix,
        )?;

        Ok(Self {
            admission: Arc::new(Semaphore::new(descriptor.capacity())),
            running: Arc::new(Semaphore::new(descriptor.max_threads)),
            descriptor,
            inner,
        })
    }

    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    pub fn executor_type(&self) -> ExecutorType {
        self.descriptor.executor_type
    }

    pub fn latency(&self) -> LatencySnapshot {
        self.inner.latency()
    }

    /// Tasks currently admitted, running or waiting.
    pub fn in_flight(&self) -> usize {
        self.descriptor.capacity() - self.admission.available_permits()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn runtime_handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Runs `body` on this pool.
    pub fn spawn<T>(&self, label: &str, body: BoxFuture<'static, anyhow::Result<T>>) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
    {
        self.inner.ensure_running()?;

        let permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return self.reject(label, body),
        };

        let running = self.running.clone();
        let latency = self.inner.latency.clone();
        let label = label.to_string();
        let task = self.inner.handle.spawn(async move {
            let _admitted = permit;
            let _slot = running
                .acquire_owned()
                .await
                .map_err(|_| anyhow::anyhow!("pool closed before {} started", label))?;
            tracing::trace!("Running task {}", label);
            let _timer = TaskTimer::start(latency);
            body.await
        });

        Ok(TaskHandle::spawned(self.executor_type(), task))
    }

    fn reject<T>(&self, label: &str, body: BoxFuture<'static, anyhow::Result<T>>) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
    {
        let executor = self.executor_type();
        match self.descriptor.rejection {
            RejectionPolicy::Abort => {
                tracing::warn!("{} pool saturated, rejecting task {}", executor, label);
                Err(ClusterError::Rejected {
                    executor,
                    reason: "pool saturated",
                })
            }
            RejectionPolicy::Discard => {
                tracing::debug!("{} pool saturated, discarding task {}", executor, label);
                Ok(TaskHandle::discarded(executor))
            }
            RejectionPolicy::CallerRuns => {
                let caller = Handle::try_current().map_err(|_| ClusterError::Rejected {
                    executor,
                    reason: "pool saturated and the caller has no runtime",
                })?;
                tracing::debug!("{} pool saturated, running task {} on the caller", executor, label);
                let latency = self.inner.latency.clone();
                let task = caller.spawn(async move {
                    let _timer = TaskTimer::start(latency);
                    body.await
                });
                Ok(TaskHandle::spawned(executor, task))
            }
        }
    }

    pub(crate) fn shutdown_now(&self) {
        self.admission.close();
        self.running.close();
        self.inner.shutdown_now();
        tracing::info!("{} pool shut down", self.executor_type());
    }
}

/// The single periodic-execution pool. At most `core_threads` delayed or
/// cyclic bodies run at once; with one thread, periodic work is serialized.
pub struct ScheduledPool {
    core_threads: usize,
    daemon: bool,
    inner: PoolRuntime,
    running: Arc<Semaphore>,
}

impl ScheduledPool {
    pub(crate) fn build(core_threads: usize, daemon: bool) -> Result<Self> {
        let inner = PoolRuntime::build(
            ExecutorType::Scheduled,
            core_threads,
            core_threads,
            Duration::from_secs(10),
            ExecutorType::Scheduled.thread_prefix(),
        )?;

        Ok(Self {
            core_threads,
            daemon,
            inner,
            running: Arc::new(Semaphore::new(core_threads.max(1))),
        })
    }

    pub fn core_threads(&self) -> usize {
        self.core_threads
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn latency(&self) -> LatencySnapshot {
        self.inner.latency()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Runs `body` once, `delay` from now.
    pub fn spawn_delayed<T>(
        &self,
        label: &str,
        delay: Duration,
        body: BoxFuture<'static, anyhow::Result<T>>,
    ) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
    {
        self.inner.ensure_running()?;

        let latency = self.inner.latency.clone();
        let running = self.running.clone();
        let label = label.to_string();
        tracing::debug!("Scheduling {} to run in {:?}", label, delay);
        let task = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _slot = running
                .acquire_owned()
                .await
                .map_err(|_| anyhow::anyhow!("scheduled pool closed before {} started", label))?;
            let _timer = TaskTimer::start(latency);
            body.await
        });

        Ok(TaskHandle::spawned(ExecutorType::Scheduled, task))
    }

    /// Starts a repeating schedule. Each run is isolated: an error or a
    /// panic in the body is logged and the next tick still fires.
    pub fn spawn_cyclic(&self, envelope: CyclicTaskEnvelope) -> Result<CyclicTaskHandle> {
        self.inner.ensure_running()?;
        if envelope.period().is_zero() {
            return Err(ClusterError::config(format!(
                "cyclic task {} needs a non-zero period",
                envelope.label()
            )));
        }

        let executions = Arc::new(AtomicU64::new(0));
        let failures = Arc::new(AtomicU64::new(0));
        let label = envelope.label().to_string();
        let run = CyclicRun {
            envelope,
            executions: executions.clone(),
            failures: failures.clone(),
            latency: self.inner.latency.clone(),
            running: self.running.clone(),
        };

        let task = self.inner.handle.spawn(run.drive());
        tracing::info!("Scheduled cyclic task {}", label);

        Ok(CyclicTaskHandle {
            label,
            task,
            executions,
            failures,
        })
    }

    pub(crate) fn shutdown_now(&self) {
        self.running.close();
        self.inner.shutdown_now();
        tracing::info!("scheduled pool shut down");
    }
}

struct CyclicRun {
    envelope: CyclicTaskEnvelope,
    executions: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    latency: Arc<Mutex<LatencyStats>>,
    running: Arc<Semaphore>,
}

impl CyclicRun {
    async fn drive(self) {
        let initial_delay = self.envelope.initial_delay();
        if !initial_delay.is_zero() {
            tokio::time::sleep(initial_delay).await;
        }

        if self.envelope.is_fixed_rate() {
            let mut ticker = tokio::time::interval(self.envelope.period());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        } else {
            loop {
                self.run_once().await;
                tokio::time::sleep(self.envelope.period()).await;
            }
        }
    }

    async fn run_once(&self) {
        let Ok(_slot) = self.running.acquire().await else {
            return;
        };
        let body = self.envelope.body();
        let outcome = {
            let _timer = TaskTimer::start(self.latency.clone());
            AssertUnwindSafe(async move { body().await })
                .catch_unwind()
                .await
        };
        self.executions.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Cyclic task {} failed: {:#}", self.envelope.label(), e);
            }
            Err(panic) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "Cyclic task {} panicked: {}",
                    self.envelope.label(),
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

enum HandleState<T> {
    Spawned(JoinHandle<anyhow::Result<T>>),
    Discarded,
}

/// Future for one submitted task. Resolves to the body's value, or to an
/// error if the body failed, panicked, was cancelled or was discarded.
pub struct TaskHandle<T> {
    executor: ExecutorType,
    state: HandleState<T>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn spawned(executor: ExecutorType, task: JoinHandle<anyhow::Result<T>>) -> Self {
        Self {
            executor,
            state: HandleState::Spawned(task),
        }
    }

    pub(crate) fn discarded(executor: ExecutorType) -> Self {
        Self {
            executor,
            state: HandleState::Discarded,
        }
    }

    pub fn executor_type(&self) -> ExecutorType {
        self.executor
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self.state, HandleState::Discarded)
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Spawned(task) => task.is_finished(),
            HandleState::Discarded => true,
        }
    }

    pub fn abort(&self) {
        if let HandleState::Spawned(task) = &self.state {
            task.abort();
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let executor = this.executor;
        match &mut this.state {
            HandleState::Spawned(task) => Pin::new(task).poll(cx).map(|joined| match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(ClusterError::Fault(e)),
                Err(e) if e.is_cancelled() => Err(ClusterError::Rejected {
                    executor,
                    reason: "task cancelled",
                }),
                Err(e) => Err(ClusterError::Fault(anyhow::anyhow!(
                    "task on {} pool panicked: {}",
                    executor,
                    e
                ))),
            }),
            HandleState::Discarded => Poll::Ready(Err(ClusterError::Rejected {
                executor,
                reason: "task discarded",
            })),
        }
    }
}

/// Control handle for a repeating schedule.
pub struct CyclicTaskHandle {
    label: String,
    task: JoinHandle<()>,
    executions: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl CyclicTaskHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs started so far, successful or not.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    /// True once cancelled or once the owning pool has shut down.
    pub fn is_cancelled(&self) -> bool {
        self.task.is_finished()
    }
}
