use std::time::Duration;
use tokio::sync::Notify;

/// Interruptible sleep for the idle loop.
///
/// A wake issued while nobody is sleeping is remembered, so the next
/// `sleep` returns at once instead of waiting out its period.
#[derive(Debug)]
pub struct Sleeper {
    period: Duration,
    wake: Notify,
}

impl Sleeper {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            wake: Notify::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sleeps one period. Returns true if cut short by a wake.
    pub async fn sleep(&self) -> bool {
        tokio::select! {
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(self.period) => false,
        }
    }

    /// Ends the current (or next) sleep early.
    pub fn skip_sleep_cycle(&self) {
        self.wake.notify_one();
    }
}
