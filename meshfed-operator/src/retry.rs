//! Fibonacci backoff retry for federation message handlers.

use crate::error::{OperatorError, OperatorResult};
use backoff::backoff::Backoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Base delay of the handler retry loop.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Fibonacci sequence of delays: `base, base, 2*base, 3*base, 5*base, ...`.
///
/// Unbounded unless a ceiling is set; arithmetic saturates.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    base: Duration,
    current: Duration,
    next: Duration,
    max: Option<Duration>,
}

impl FibonacciBackoff {
    /// Start a sequence at `base`.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
            next: base,
            max: None,
        }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE)
    }
}

impl Backoff for FibonacciBackoff {
    fn reset(&mut self) {
        self.current = self.base;
        self.next = self.base;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.current;
        let following = self.current.saturating_add(self.next);
        self.current = self.next;
        self.next = following;
        Some(match self.max {
            Some(max) => delay.min(max),
            None => delay,
        })
    }
}

/// How a retry loop ended.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// An attempt succeeded.
    Succeeded(T),
    /// An attempt failed with a non-transient error.
    Failed(OperatorError),
    /// The token was cancelled before an attempt succeeded.
    Cancelled,
}

fn classify(err: OperatorError) -> backoff::Error<OperatorError> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

/// Run `op` until it succeeds, fails fatally, or `token` is cancelled.
///
/// Transient errors (see [`OperatorError::is_transient`]) sleep for the next
/// backoff step and try again.
pub async fn retry<T, F, Fut>(
    token: &CancellationToken,
    backoff: FibonacciBackoff,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OperatorResult<T>>,
{
    let attempts = backoff::future::retry_notify(
        backoff,
        || {
            let attempt = op();
            async move { attempt.await.map_err(classify) }
        },
        |err: OperatorError, delay: Duration| {
            tracing::debug!(error = %err, ?delay, "Transient failure, retrying");
        },
    );

    tokio::select! {
        biased;
        _ = token.cancelled() => RetryOutcome::Cancelled,
        result = attempts => match result {
            Ok(value) => RetryOutcome::Succeeded(value),
            Err(err) => RetryOutcome::Failed(err),
        },
    }
}
