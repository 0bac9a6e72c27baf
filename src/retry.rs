//! Bounded retry with a fixed backoff for remote calls and store commits.

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry transient failures up to `max_attempts` times, sleeping `backoff`
/// between attempts. Non-transient failures return immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy built from `max_retry_count` and `backoff_delay`.
    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.max_retry_count, config.backoff_delay)
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Run `attempt` until it succeeds, fails non-transiently, or the attempts
    /// run out. Exhaustion is reported as [`CoreError::TimeoutExhausted`].
    ///
    /// Once started the loop is not cancellable short of dropping the future.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last = None;

        for n in 1..=self.max_attempts {
            match attempt().await {
                Ok(value) => {
                    if n > 1 {
                        debug!(operation, attempt = n, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    debug!(operation, attempt = n, error = %e, "transient failure");
                    last = Some(e);
                    if n < self.max_attempts && !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let last = last.map(|e| e.to_string()).unwrap_or_default();
        warn!(operation, attempts = self.max_attempts, last = %last, "retries exhausted");
        Err(CoreError::TimeoutExhausted {
            operation: operation.to_string(),
            attempts: self.max_attempts,
            last,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let calls = &AtomicU32::new(0);

        let value = policy
            .run("op", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::Transient("flaky".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let calls = &AtomicU32::new(0);

        let err = policy
            .run("notify", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoreError::Transient("down".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            CoreError::TimeoutExhausted {
                operation,
                attempts,
                last,
            } => {
                assert_eq!(operation, "notify");
                assert_eq!(attempts, 3);
                assert!(last.contains("down"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let calls = &AtomicU32::new(0);

        let err = policy
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoreError::NotFound("topic".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts_only() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let started = tokio::time::Instant::now();

        let _ = policy
            .run("op", || async { Err::<(), _>(CoreError::Transient("x".into())) })
            .await;

        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }
}
