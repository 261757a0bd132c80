// pgbackup/src/utils/retry.rs
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Span, info, warn};

use crate::errors::RetryError;

/// Exponential backoff parameters for one retry domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub const fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Policy for `psql`/`pg_dump` queries: five retries starting at 2s, capped at 30s.
    pub const fn query_default() -> Self {
        Self::new(6, Duration::from_secs(2), Duration::from_secs(30), 2.0)
    }

    /// Policy for object storage operations.
    pub const fn storage_default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(10), 2.0)
    }

    /// The waits taken before attempts 1, 2, 3, ... (never exceeding `max_delay`
    /// once the first multiplication happens).
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            multiplier: self.multiplier,
        }
    }
}

/// Unbounded iterator over successive backoff delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        let scaled = current.as_secs_f64() * self.multiplier;
        self.next = if scaled.is_finite() && scaled < self.max.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max
        };
        Some(current)
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable` rejects,
/// runs out of attempts, or `cancel` fires while waiting between attempts.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    span: &Span,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays = policy.delays();
    let mut errors: Vec<E> = Vec::new();

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = delays.next().unwrap_or(policy.max_delay);
            span.in_scope(|| {
                info!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying"
                )
            });
            if !sleep_or_cancel(delay, cancel).await {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    errors,
                });
            }
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    span.in_scope(|| {
                        info!(operation = operation_name, attempts = attempt + 1, "Succeeded after retry")
                    });
                }
                return Ok(value);
            }
            Err(error) => {
                if !is_retryable(&error) {
                    return Err(RetryError::NonRetryable(error));
                }
                span.in_scope(|| {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %error,
                        "Retryable error encountered"
                    )
                });
                errors.push(error);
            }
        }
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
        errors,
    })
}
