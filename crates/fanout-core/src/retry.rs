//! Bounded retry for upstream bus calls.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`.
//! Only [transient](BusError::is_transient) errors are retried.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::bus::BusError;

/// Retry policy for subscribe/unsubscribe calls and bus reconnects.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of tries, including the first one.
    pub attempts: u32,
    /// Delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            first: Duration::from_millis(50),
            max: Duration::from_secs(1),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    #[must_use]
    pub fn none() -> Self {
        Self {
            attempts: 1,
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Delay to wait after the given (0-indexed) failed attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error seen.
    pub async fn run<T, F, Fut>(&self, op: &str, channel: &str, mut call: F) -> Result<T, BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        op,
                        channel,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
