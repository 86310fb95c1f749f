//! Bounded retry with linear backoff.
//!
//! One attempt loop drives both queries and mutations. The policy is uniform
//! across error kinds: a `response` classified from a 400 retries exactly like
//! one from a 503. Callers that need to distinguish permanent failures must do
//! so in their fetcher before the error reaches this loop.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::FetchError;

/// Retry bounds for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; an operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Base delay; the wait before retry `n` is `base_delay * n`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Linear backoff: the delay after the `attempt`-th failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Why the attempt loop stopped without a success.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Cancelled,
    Exhausted(FetchError),
}

/// Run `operation` until it succeeds, the retry budget is spent, or the
/// cancellation token fires. Both the operation and the backoff sleeps race
/// against cancellation.
pub(crate) async fn run_attempts<T, F, Fut, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    operation: F,
) -> Result<T, AttemptError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<FetchError>,
{
    let mut attempt: u32 = 1;
    loop {
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(AttemptError::Cancelled),
            outcome = operation() => outcome,
        };

        let error: FetchError = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error.into(),
        };

        warn!(
            label,
            attempt,
            max_attempts = policy.max_retries + 1,
            error_kind = error.kind(),
            error = %error,
            "Attempt failed"
        );

        if attempt > policy.max_retries {
            return Err(AttemptError::Exhausted(error));
        }

        tokio::select! {
            () = cancel.cancelled() => return Err(AttemptError::Cancelled),
            () = sleep(policy.delay_for(attempt)) => {}
        }
        attempt += 1;
    }
}
