//! Exponential-backoff retry for fallible async operations.
//!
//! Every store read and conditional write goes through [`retry`] (or
//! [`retry_with`] when the caller wants to observe each retry). The delay
//! before retry `n` (1-based) is `min(base_delay * 2^(n-1), max_delay)`.

use std::future::Future;
use std::time::Duration;

use crate::error::CoreError;

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the initial attempt. `0` means a single attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Reject zero delays and a cap below the base delay.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.base_delay.is_zero() || self.max_delay.is_zero() {
            return Err(CoreError::Validation(
                "Retry delays must be greater than zero".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(CoreError::Validation(
                "Retry max_delay must not be less than base_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay to wait after failed attempt `attempt` (0-based).
    ///
    /// Saturates at [`max_delay`](Self::max_delay) instead of overflowing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or retries are exhausted.
///
/// Each retry is logged at warn level. Returns the first success or the
/// last error observed.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with(config, operation, |attempt, error: &E| {
        tracing::warn!(attempt, error = %error, "Operation failed, retrying");
    })
    .await
}

/// Like [`retry`], calling `on_retry(retry_number, &error)` before each wait.
///
/// `retry_number` is 1 for the first retry.
pub async fn retry_with<T, E, F, Fut, R>(
    config: &RetryConfig,
    mut operation: F,
    mut on_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(u32, &E),
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= config.max_retries => return Err(error),
            Err(error) => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                on_retry(attempt, &error);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry",
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
