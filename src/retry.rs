// Shared retry policy: capped exponential backoff with optional jitter.
// Used by the lock manager while waiting for a lease, by the editor for
// transient I/O failures, and by callers wrapping anchor-miss retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(25),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    /// With jitter enabled the result is drawn uniformly from `[delay/2, delay]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(63) as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        let delay = Duration::from_secs_f64(capped);

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = delay - half;
            let extra = rand::rng().random_range(0..=spread.as_micros() as u64);
            half + Duration::from_micros(extra)
        } else {
            delay
        }
    }

    /// Runs `operation` until it succeeds, `should_retry` rejects the error, or
    /// `max_attempts` total attempts have been made.
    pub async fn execute<F, Fut, T, E, P>(&self, mut operation: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    attempt += 1;
                    if attempt >= attempts || !should_retry(&error) {
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
