//! Work units handed to the [`TaskScheduler`](super::scheduler::TaskScheduler).

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::types::ExecutorType;

/// Type-erased body of a cyclic task, invoked once per tick.
pub type CyclicBody = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A one-shot unit of work tagged with the pool it should run on.
pub struct TaskEnvelope<T> {
    executor_type: ExecutorType,
    label: String,
    body: BoxFuture<'static, anyhow::Result<T>>,
}

impl<T: Send + 'static> TaskEnvelope<T> {
    pub fn new<F>(executor_type: ExecutorType, label: impl Into<String>, body: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            executor_type,
            label: label.into(),
            body: body.boxed(),
        }
    }

    /// Wraps synchronous work. It runs on the blocking threads of whichever
    /// runtime ends up executing the envelope.
    pub fn blocking<F>(executor_type: ExecutorType, label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let label = label.into();
        let task_label = label.clone();
        let body = async move {
            tokio::task::spawn_blocking(work)
                .await
                .map_err(|e| anyhow::anyhow!("blocking task {} did not complete: {}", task_label, e))?
        };

        Self {
            executor_type,
            label,
            body: body.boxed(),
        }
    }

    pub fn executor_type(&self) -> ExecutorType {
        self.executor_type
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn into_parts(self) -> (ExecutorType, String, BoxFuture<'static, anyhow::Result<T>>) {
        (self.executor_type, self.label, self.body)
    }
}

/// A repeating unit of work for the scheduled pool.
///
/// With `fixed_rate` the cadence is measured from each run's start and late
/// ticks are fired back to back to catch up. Otherwise the next run starts
/// `period` after the previous one finished.
#[derive(Clone)]
pub struct CyclicTaskEnvelope {
    label: String,
    period: Duration,
    initial_delay: Duration,
    fixed_rate: bool,
    body: CyclicBody,
}

impl CyclicTaskEnvelope {
    pub fn new<F, Fut>(label: impl Into<String>, period: Duration, fixed_rate: bool, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let body: CyclicBody = Arc::new(move || body().boxed());

        Self {
            label: label.into(),
            period,
            initial_delay: Duration::ZERO,
            fixed_rate,
            body,
        }
    }

    pub fn fixed_rate<F, Fut>(label: impl Into<String>, period: Duration, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(label, period, true, body)
    }

    pub fn fixed_delay<F, Fut>(label: impl Into<String>, period: Duration, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(label, period, false, body)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn is_fixed_rate(&self) -> bool {
        self.fixed_rate
    }

    pub(crate) fn body(&self) -> CyclicBody {
        self.body.clone()
    }
}

impl std::fmt::Debug for CyclicTaskEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicTaskEnvelope")
            .field("label", &self.label)
            .field("period", &self.period)
            .field("initial_delay", &self.initial_delay)
            .field("fixed_rate", &self.fixed_rate)
            .finish()
    }
}
