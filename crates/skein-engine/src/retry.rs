//! Bounded retry with exponential backoff and jitter for outbound sends.

use rand::Rng;
use tracing::{debug, warn};

/// Retry configuration for outbound delivery.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first try.
    pub max_attempts: u32,
    /// Minimum delay between retries in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor; the sleep is `delay * (1 + random_fraction * jitter)`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 400,
            max_delay_ms: 15_000,
            jitter: 0.1,
        }
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// The successful result.
        result: T,
        /// Attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// All attempts exhausted.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        /// Attempts made.
        attempts: u32,
    },
}

/// Delay before retry number `attempt` (0-indexed):
/// `min(min_delay * 2^attempt, max_delay)` plus jitter, capped.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);
    if config.jitter <= 0.0 {
        return capped;
    }
    let frac: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let with_jitter = (capped as f64) * (1.0 + frac * config.jitter);
    (with_jitter as u64).min(config.max_delay_ms)
}

/// Run an async operation with bounded retry. Every error is considered
/// retryable; the caller filters non-retryable failures before entering.
pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    for attempt in 0..max {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "send succeeded after retry");
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                if attempt + 1 >= max {
                    warn!(attempts = max, error = %err, "retry budget exhausted");
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: max,
                    };
                }
                let delay_ms = compute_backoff(config, attempt);
                debug!(attempt = attempt + 1, delay_ms, error = %err, "retrying send");
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
    unreachable!("loop returns on last attempt");
}
