//! Bounded retries for transport faults.

use crate::config::EntitlementConfig;
use crate::error::{LicenseError, LicenseResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry schedule for one network call.
///
/// Only [`LicenseError::is_retryable`] failures are retried. A rate-limit
/// response waits for the server's `Retry-After`, capped at
/// `max_retry_after`, instead of the backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub attempts: u32,
    /// Delay before the second attempt; doubles after that.
    pub base_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
    /// Cap on a server-requested `Retry-After` wait.
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    /// Builds the policy described by `config`.
    #[must_use]
    pub fn from_config(config: &EntitlementConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retry_after: Duration::ZERO,
        }
    }

    /// Backoff after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error from `op`.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> LicenseResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LicenseResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && err.is_retryable() => {
                    let wait = match &err {
                        LicenseError::RateLimited { retry_after_secs } => {
                            Duration::from_secs(*retry_after_secs).min(self.max_retry_after)
                        }
                        _ => self.delay_for(attempt),
                    };
                    warn!(attempt, attempts, error = %err, "license request failed, retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
