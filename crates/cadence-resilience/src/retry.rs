//! Retry with exponential backoff and jitter

use cadence_core::Classify;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry configuration.
///
/// The delay before attempt `n + 1` is
/// `min(max_delay, base_delay * 2^(n-1)) * (1 ± jitter_ratio)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomised in both directions (0.0 - 1.0)
    pub jitter_ratio: f64,
    /// Hard ceiling on wall time spent in the retry loop, sleeps included
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_ratio: 0.2,
            max_elapsed_ms: 120_000,
        }
    }
}

/// Why the retry loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// `max_attempts` reached
    Exhausted,
    /// The error was classified as fatal
    NotRetryable,
    /// The next sleep would cross `max_elapsed_ms`
    DeadlineExceeded,
}

impl Display for GiveUpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "retries exhausted"),
            Self::NotRetryable => write!(f, "non-retryable failure"),
            Self::DeadlineExceeded => write!(f, "retry deadline exceeded"),
        }
    }
}

/// Final error of a retry loop, annotated with the attempt count
#[derive(Debug, thiserror::Error)]
#[error("{reason} after {attempts} attempt(s): {source}")]
pub struct RetryError<E> {
    pub attempts: u32,
    pub reason: GiveUpReason,
    #[source]
    pub source: E,
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        self.source
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn class(&self) -> cadence_core::ErrorClass {
        self.source.class()
    }
}

impl RetryPolicy {
    /// Policy that never sleeps; handy for tests and fail-fast callers
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ratio: 0.0,
            ..Default::default()
        }
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(exponential_ms(self.base_delay_ms, self.max_delay_ms, attempt))
    }

    /// Jittered delay after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        jittered(self.backoff(attempt), self.jitter_ratio)
    }

    /// Run `op` using the error's own [`Classify`] to decide retryability
    pub async fn run<F, Fut, T, E>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.run_with(op, |e: &E| e.is_retryable()).await
    }

    /// Run `op` with a caller-supplied retryability predicate
    pub async fn run_with<F, Fut, T, E, C>(&self, mut op: F, is_retryable: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let ceiling = Duration::from_millis(self.max_elapsed_ms);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                tracing::warn!(attempt, error = %error, "Non-retryable failure");
                return Err(RetryError {
                    attempts: attempt,
                    reason: GiveUpReason::NotRetryable,
                    source: error,
                });
            }

            if attempt >= max_attempts {
                tracing::error!(attempt, error = %error, "Retry exhausted");
                return Err(RetryError {
                    attempts: attempt,
                    reason: GiveUpReason::Exhausted,
                    source: error,
                });
            }

            let delay = self.delay_for(attempt);
            if started.elapsed() + delay > ceiling {
                tracing::error!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    max_elapsed_ms = self.max_elapsed_ms,
                    error = %error,
                    "Retry deadline exceeded"
                );
                return Err(RetryError {
                    attempts: attempt,
                    reason: GiveUpReason::DeadlineExceeded,
                    source: error,
                });
            }

            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Free-function form of [`RetryPolicy::run`]
pub async fn run_with_retry<F, Fut, T, E>(op: F, policy: &RetryPolicy) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    policy.run(op).await
}

/// `min(max_ms, base_ms * 2^(attempt-1))` without overflow
pub(crate) fn exponential_ms(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1);
    let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

/// Scale `delay` by a random factor in `[1 - ratio, 1 + ratio]`
pub fn jittered(delay: Duration, ratio: f64) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    if ratio == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 + rand::rng().random_range(-ratio..=ratio);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
