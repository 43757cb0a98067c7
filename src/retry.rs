//! Retry utilities with exponential backoff
//!
//! The policy is injected through [`RetryConfig`] at construction time; there
//! is no process-wide setting. Only errors whose [`ErrorKind`] is
//! retryable (HTTP 429 and 5xx) are attempted again. Everything else,
//! including transport failures, propagates immediately.
//!
//! # Examples
//!
//! ```rust,no_run
//! use chat_pipeline::retry::{retry_with_backoff, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default()
//!     .with_max_retries(3)
//!     .with_base_delay(Duration::from_millis(500));
//!
//! let result = retry_with_backoff(&config, |_attempt| async {
//!     // Your async operation here
//!     Ok::<_, chat_pipeline::Error>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::ErrorKind;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (attempts = max_retries + 1)
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (2.0 doubles the delay each time)
    pub backoff_multiplier: f64,

    /// Random jitter as a fraction of the delay (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// No delay between attempts. Useful in tests.
    pub fn immediate() -> Self {
        Self::default().with_base_delay(Duration::ZERO)
    }

    /// Single attempt, no retries.
    pub fn disabled() -> Self {
        Self::default().with_max_retries(0)
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor (clamped to 0.0..=1.0)
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the given attempt. Attempt 0 has none; attempt `n`
    /// waits `base_delay * multiplier^(n-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_delay_ms = self.base_delay.as_millis() as f64;
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let exponential_delay = base_delay_ms * self.backoff_multiplier.powi(exponent);

        let capped_delay = exponential_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter_factor == 0.0 {
            return Duration::from_millis(capped_delay as u64);
        }

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_delay = capped_delay + jitter - (jitter_range / 2.0);

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// Determine if the retry loop should attempt again after this error
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Api { retryable, .. } => *retryable,
        _ => false,
    }
}

/// Run `operation` until it succeeds, fails terminally, or retries run out.
///
/// Attempts are strictly sequential. The closure receives the attempt
/// number (0-based). On exhaustion the last error is returned unchanged, so
/// a rate-limit or server error still reports `retryable = true`.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            sleep(delay).await;
        }

        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable_error(&err) || attempt >= config.max_retries {
                    return Err(err);
                }

                log::warn!(
                    "Attempt {}/{} failed ({}); retrying",
                    attempt + 1,
                    config.max_attempts(),
                    err
                );
                attempt += 1;
            }
        }
    }
}

/// Whether a status code would be retried.
pub fn is_retryable_status(status: u16) -> bool {
    ErrorKind::from_status(status).is_some_and(ErrorKind::is_retryable)
}
