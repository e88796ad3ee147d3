use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{Error, Result};

/// Bounded exponential backoff for transient fetch failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap for exponential growth
    pub max_backoff: Duration,
    /// Multiplier applied per attempt (2.0 doubles)
    pub backoff_multiplier: f64,
    /// Overall budget across all attempts
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            deadline: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0 means the first try).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
        let backoff_ms = self.initial_backoff.as_millis() as f64 * multiplier;
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);

        Duration::from_millis(capped_ms as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// deadline passes. The last error is returned on exhaustion; a deadline hit
    /// before any error was seen surfaces as `Timeout`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let deadline = started + self.deadline;
        let mut attempt: u32 = 0;

        loop {
            let result = match tokio::time::timeout_at(deadline, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(operation, self.deadline.as_millis() as u64)),
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            let backoff = self.backoff_for_attempt(attempt);
            if Instant::now() + backoff >= deadline {
                warn!(
                    operation,
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %error,
                    "retry deadline exhausted"
                );
                return Err(error);
            }

            warn!(
                operation,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "transient failure, retrying after backoff"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_secs(16));
        assert_eq!(policy.backoff_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.backoff_for_attempt(20), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let counter = calls.clone();
        let value = policy
            .run("fetch", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(Error::Sealed)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = RetryPolicy::default()
            .run("fetch", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::not_found("path", "svc-a"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_total_wait() {
        let policy = RetryPolicy { deadline: Duration::from_secs(10), ..RetryPolicy::default() };
        let started = Instant::now();
        let result: Result<()> = policy.run("fetch", || async { Err(Error::Sealed) }).await;

        assert!(matches!(result, Err(Error::Sealed)));
        assert!(started.elapsed() <= Duration::from_secs(10));
    }
}
