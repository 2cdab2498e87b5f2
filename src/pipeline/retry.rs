// Retry policy with exponential backoff
//
// Decides whether a failed unit of work (stage or sub-unit) is retried and
// how long to wait. Classification comes from the agent via ErrorKind.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{ErrorKind, StageError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Result of running an operation under the policy
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, StageError>,
    pub attempts: u32,
    /// Cancellation fired while waiting out a backoff
    pub cancelled: bool,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Policy without waits, for tests and synchronous drivers.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, false)
    }

    /// Un-jittered delay after the given 1-based failed attempt:
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `attempt` is the number of attempts made so far, including the one that just failed.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32, kind: ErrorKind) -> RetryDecision {
        if kind == ErrorKind::Permanent || attempt >= max_attempts {
            return RetryDecision::give_up();
        }

        let delay = self.backoff(attempt);
        RetryDecision {
            retry: true,
            delay: if self.jitter { jittered(delay) } else { delay },
        }
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts `max_attempts`,
    /// or `cancel` fires during a backoff wait.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        max_attempts: u32,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                        cancelled: false,
                    }
                }
                Err(error) => error,
            };

            let decision = self.should_retry(attempt, max_attempts, error.kind());
            if !decision.retry {
                debug!(attempt, max_attempts, error = %error, "Giving up after failed attempt");
                return Attempted {
                    result: Err(error),
                    attempts: attempt,
                    cancelled: false,
                };
            }

            warn!(
                attempt,
                max_attempts,
                delay_ms = decision.delay.as_millis() as u64,
                error = %error,
                "Attempt failed (retryable)"
            );

            if cancel
                .run_until_cancelled(tokio::time::sleep(decision.delay))
                .await
                .is_none()
            {
                return Attempted {
                    result: Err(error),
                    attempts: attempt,
                    cancelled: true,
                };
            }
        }
    }
}

/// Uniform delay in `[delay / 2, delay]`.
fn jittered(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis < 2 {
        return delay;
    }
    Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
}
