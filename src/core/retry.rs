//! Retry with exponential backoff.
//!
//! Shared by the pipeline executor and the scheduler's workers. A unit with
//! `retry_count = n` is invoked at most `n + 1` times; between attempts the
//! caller sleeps `base_delay * 2^attempt` (attempt is 0-based), capped at
//! `max_delay`. No lock is held while sleeping.

use crate::error::ExecutionError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Default cap on a single backoff sleep.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Backoff timing between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Retry immediately, without sleeping.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Sleep to insert after the failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Final outcome of a unit after all of its attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub result: std::result::Result<Value, ExecutionError>,
    /// How many times the unit's logic was invoked.
    pub attempts: u32,
}

/// Invoke `attempt_fn` until it succeeds or `retry_count + 1` attempts ran.
///
/// Each attempt is bounded by `timeout` when given; an elapsed timeout is a
/// failed attempt. When `cancel` has fired by the time an attempt fails, no
/// further attempt is started and the error becomes `ExecutionError::Cancelled`.
pub async fn run_with_retry<F, Fut>(
    label: &str,
    retry_count: u32,
    timeout: Option<Duration>,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut attempt_fn: F,
) -> AttemptOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<Value, String>>,
{
    let max_attempts = retry_count.saturating_add(1);
    let mut attempts = 0;

    loop {
        let fut = attempt_fn(attempts);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(r) => r.map_err(ExecutionError::Failed),
                Err(_) => Err(ExecutionError::Timeout(limit)),
            },
            None => fut.await.map_err(ExecutionError::Failed),
        };
        attempts += 1;

        let error = match result {
            Ok(value) => {
                debug!(unit = label, attempts, "attempt succeeded");
                return AttemptOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(e) => e,
        };

        if cancel.is_some_and(|token| token.is_cancelled()) {
            return AttemptOutcome {
                result: Err(ExecutionError::Cancelled(format!(
                    "cancelled after attempt {}: {}",
                    attempts, error
                ))),
                attempts,
            };
        }

        if attempts >= max_attempts {
            warn!(unit = label, attempts, error = %error, "attempts exhausted");
            return AttemptOutcome {
                result: Err(error),
                attempts,
            };
        }

        let delay = policy.delay_for(attempts - 1);
        warn!(
            unit = label,
            attempt = attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Turn a panic inside one attempt into a failed attempt.
///
/// Covers both the synchronous part of `start`, which builds the attempt's
/// future, and the polling of that future. The error reads
/// `"<what> panicked: <message>"`.
pub fn catch_panic<F, Fut>(
    what: &'static str,
    start: F,
) -> BoxFuture<'static, std::result::Result<Value, String>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    let started = std::panic::catch_unwind(AssertUnwindSafe(start))
        .map_err(|payload| panic_message(what, payload.as_ref()));
    async move {
        let fut = started?;
        AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_message(what, payload.as_ref())))
    }
    .boxed()
}

fn panic_message(what: &str, payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
    match detail {
        Some(detail) => format!("{} panicked: {}", what, detail),
        None => format!("{} panicked", what),
    }
}
