//! Exponential backoff retry for device operations.
//!
//! - Default: 3 attempts in total, 500ms then 1s between them
//! - Delays double up to a cap and carry a deterministic jitter derived from a
//!   seed (the interface name), so concurrent runs on different interfaces do
//!   not retry in lockstep while tests stay reproducible.
//!
//! Only [`DeviceErrorKind::Connection`](super::DeviceErrorKind::Connection)
//! errors are retried. Anything else is returned after the first attempt.

use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tracing::warn;

use super::DeviceError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,

    /// Upper bound of the added jitter, as a percentage of the delay (0-100).
    pub jitter_percent: u8,
}

impl RetryConfig {
    /// Default retry configuration for switch operations.
    ///
    /// - 3 attempts with 500ms, 1s delays (before jitter)
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        backoff_multiplier: 2.0,
        jitter_percent: 20,
    };

    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        jitter_percent: u8,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter_percent: jitter_percent.min(100),
        }
    }

    /// Number of attempts actually made, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (0-indexed), without jitter.
    ///
    /// `initial_delay * backoff_multiplier^retry`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(retry as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    /// Delay before retry number `retry` with jitter for `seed`.
    ///
    /// The same seed and retry number always give the same delay, which lies
    /// in `[base, base * (1 + jitter_percent / 100))`.
    pub fn jittered_delay(&self, retry: u32, seed: &str) -> Duration {
        let base = self.delay_for_attempt(retry);
        if self.jitter_percent == 0 {
            return base;
        }
        let mut hasher = std::hash::DefaultHasher::new();
        seed.hash(&mut hasher);
        retry.hash(&mut hasher);
        let jitter = (hasher.finish() % self.jitter_percent as u64) as f64 / 100.0;
        Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
    }

    /// Returns an iterator over all retry delays, without jitter.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.attempts() - 1).map(|retry| self.delay_for_attempt(retry))
    }

    /// Total time spent sleeping if every attempt fails, without jitter.
    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T> {
    /// The operation succeeded after `attempts` tries.
    Success { value: T, attempts: u32 },

    /// Every attempt failed with a retriable error.
    ExhaustedRetries { last_error: DeviceError, attempts: u32 },

    /// A non-retriable error occurred.
    PermanentError(DeviceError),
}

impl<T> RetryResult<T> {
    /// Converts to a Result, treating exhausted retries and permanent errors as Err.
    pub fn into_result(self) -> Result<T, DeviceError> {
        match self {
            RetryResult::Success { value, .. } => Ok(value),
            RetryResult::ExhaustedRetries { last_error, .. } => Err(last_error),
            RetryResult::PermanentError(e) => Err(e),
        }
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        match self {
            RetryResult::Success { attempts, .. } | RetryResult::ExhaustedRetries { attempts, .. } => {
                attempts.saturating_sub(1)
            }
            RetryResult::PermanentError(_) => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success { .. })
    }
}

/// Executes an async operation with retry.
///
/// The operation is re-run while it fails with a retriable error and attempts
/// remain, sleeping `config.jittered_delay(n, jitter_seed)` in between.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    jitter_seed: &str,
    mut operation: F,
) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeviceError>>,
{
    let max_attempts = config.attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                return RetryResult::Success {
                    value,
                    attempts: attempt,
                };
            }
            Err(e) if !e.is_retriable() => return RetryResult::PermanentError(e),
            Err(e) => {
                if attempt >= max_attempts {
                    return RetryResult::ExhaustedRetries {
                        last_error: e,
                        attempts: attempt,
                    };
                }

                let delay = config.jittered_delay(attempt - 1, jitter_seed);
                warn!(
                    operation = %e.operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient switch error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
