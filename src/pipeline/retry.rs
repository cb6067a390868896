//! Retry policy for pipeline stages.
//!
//! Provides bounded exponential backoff for transient failures. Callers decide
//! which errors are transient; everything else is returned on first failure.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just try once)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration (caps exponential growth)
    pub max_backoff: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Result of [`RetryPolicy::execute`] plus the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Creates a policy with no retries (fail immediately).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Runs `operation`, retrying while `is_retryable` accepts the error and
    /// the retry budget lasts.
    ///
    /// # Example
    /// ```rust,ignore
    /// let outcome = policy
    ///     .execute(|| resolver.resolve(request.clone()), ResolutionError::is_retryable)
    ///     .await;
    /// ```
    pub async fn execute<F, Fut, T, E, P>(&self, mut operation: F, is_retryable: P) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempts = 0;
        let mut backoff = self.initial_backoff.min(self.max_backoff);

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => {
                    if attempts > 1 {
                        tracing::info!(
                            target: "auditor::pipeline::retry",
                            "Operation succeeded after {} attempt(s)",
                            attempts
                        );
                    }
                    return RetryOutcome {
                        result: Ok(result),
                        attempts,
                    };
                }
                Err(err) if !is_retryable(&err) => {
                    return RetryOutcome {
                        result: Err(err),
                        attempts,
                    };
                }
                Err(err) => {
                    if attempts > self.max_retries {
                        tracing::warn!(
                            target: "auditor::pipeline::retry",
                            "Operation failed after {} attempts: {}",
                            attempts,
                            err
                        );
                        return RetryOutcome {
                            result: Err(err),
                            attempts,
                        };
                    }

                    tracing::warn!(
                        target: "auditor::pipeline::retry",
                        "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempts,
                        self.max_retries + 1,
                        err,
                        backoff
                    );

                    sleep(backoff).await;

                    backoff = Duration::from_secs_f64(
                        (backoff.as_secs_f64() * self.backoff_multiplier)
                            .min(self.max_backoff.as_secs_f64()),
                    );
                }
            }
        }
    }
}
