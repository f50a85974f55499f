//! Provides backoff timing control for retried provisioning and deletion
//! intents, and for restarting watches after an error.
use std::time::Duration;

use rand::Rng;

const DEFAULT_BASE: Duration = Duration::from_millis(100);
const DEFAULT_CAP: Duration = Duration::from_secs(1000);
const DEFAULT_JITTER: f64 = 0.1;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// A `BackoffStrategy` in which the durations increase exponentially
/// until hitting a cap. Each returned duration is spread by a random jitter
/// factor so that retries of many keys do not line up.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    jitter: f64,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// 100ms doubling up to 1000s, with ±10% jitter.
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy with the given base and cap and the default jitter.
    pub fn new(base_duration: Duration, cap: Duration) -> Self {
        Self {
            base_duration,
            cap,
            jitter: DEFAULT_JITTER,
            last_duration: Duration::from_secs(0),
        }
    }

    /// Sets the jitter factor. A factor of `0.1` spreads every duration
    /// uniformly over ±10% of its nominal value; `0.0` disables jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }

    fn jittered(&self, duration: Duration) -> Duration {
        if self.jitter == 0.0 {
            return duration;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        duration.mul_f64(factor)
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        self.jittered(next_duration)
    }
}
