//! Bounded retries with exponential back-off for file transfers.
//!
//! A [`RetryPolicy`] calls an async operation up to `max_attempts` times. The
//! pause before retry `n` is `initial_delay * multiplier^(n - 1)`, capped at
//! `max_delay`, plus up to 10% random jitter (still under the cap). A caller
//! supplied predicate decides which errors are worth another attempt; anything
//! else is returned straight away.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const JITTER_FRACTION: f64 = 0.1;

/// Back-off settings for one kind of operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries including the first; 1 disables retrying
    pub max_attempts: u32,
    /// Pause before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single pause
    pub max_delay: Duration,
    /// Growth factor between consecutive pauses
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Config with `attempts` tries (at least one) and otherwise default backoff.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Pause before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter {
            return base;
        }
        let extra = base.mul_f64(JITTER_FRACTION * rand::random::<f64>());
        (base + extra).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Run `operation` until it succeeds, fails with an error `retryable`
    /// rejects, or the attempts run out. The last error is returned.
    pub async fn execute_if<F, Fut, T, E, P>(&self, mut operation: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !retryable(&error) {
                return Err(error);
            }
            if attempt == attempts {
                if attempts > 1 {
                    warn!(attempts, error = %error, "Giving up after exhausting retries");
                }
                return Err(error);
            }

            let pause = self.config.delay(attempt);
            warn!(attempt, attempts, error = %error, ?pause, "Attempt failed, retrying");
            sleep(pause).await;
            attempt += 1;
        }
    }
}
