//! Retry timing for reconcilers talking to remote endpoints.
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, Interval};

use crate::shutdown::Shutdown;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets the upper bound of the next wait.
    fn next_duration(&mut self) -> Duration;
    /// Waits a random amount of time between zero and `next_duration`.
    async fn wait(&mut self) {
        tokio::time::sleep(full_jitter(self.next_duration())).await
    }
}

/// A `BackoffStrategy` in which the durations increase exponentially
/// until hitting a cap.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// Starts at 100ms and doubles up to 30s.
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy with a custom base and ceiling.
    pub fn new(base_duration: Duration, cap: Duration) -> Self {
        Self {
            base_duration,
            cap,
            last_duration: Duration::from_secs(0),
        }
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration.saturating_mul(2)
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}

/// Picks a uniformly random duration in `[0, ceiling]`.
pub fn full_jitter(ceiling: Duration) -> Duration {
    if ceiling == Duration::from_secs(0) {
        return ceiling;
    }
    let millis = ceiling.as_millis().min(u128::from(u64::MAX)) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Ticks `interval`, or never when it is disabled.
pub(crate) async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending().await,
    }
}

/// Backs off unless shutdown comes first. Returns false on shutdown.
pub(crate) async fn wait_or_shutdown<B: BackoffStrategy>(
    backoff: &mut B,
    shutdown: &mut Shutdown,
) -> bool {
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = backoff.wait() => true,
    }
}
