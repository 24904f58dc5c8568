//! Retry with exponential backoff for transient upstream failures.
//!
//! The schedule is `base * factor^n`, capped at `max_delay`. A rate-limit
//! hint from the engine stretches a single wait up to the cap.

use std::future::Future;
use std::time::Duration;

use askdb_core::ReasonerError;
use tracing::warn;

/// Default attempts per call, the first one included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_FACTOR: u32 = 2;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            factor: DEFAULT_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(retry);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    fn delay_after(&self, retry: u32, err: &ReasonerError) -> Duration {
        let scheduled = self.delay_for(retry);
        match err {
            ReasonerError::RateLimited { retry_after_secs } => scheduled
                .max(Duration::from_secs(*retry_after_secs))
                .min(self.max_delay),
            _ => scheduled,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget runs out.
///
/// Exhaustion yields [`ReasonerError::Exhausted`] wrapping the last error.
/// Non-retryable errors are returned unchanged on first sight.
pub async fn with_retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, ReasonerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReasonerError>>,
    P: Fn(&ReasonerError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err(err),
            Err(err) if attempt >= max_attempts => {
                return Err(ReasonerError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Err(err) => {
                let delay = policy.delay_after(attempt - 1, &err);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient reasoning failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn schedule_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn rate_limit_hint_is_capped() {
        let policy = RetryPolicy::default();
        let hint = ReasonerError::RateLimited { retry_after_secs: 5 };
        assert_eq!(policy.delay_after(0, &hint), Duration::from_secs(5));
        let huge = ReasonerError::RateLimited { retry_after_secs: 600 };
        assert_eq!(policy.delay_after(0, &huge), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let started = tokio::time::Instant::now();
        let result = with_retry(&RetryPolicy::default(), ReasonerError::is_transient, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ReasonerError::Network("connection reset".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff under paused time
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> =
            with_retry(&RetryPolicy::default(), ReasonerError::is_transient, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ReasonerError::Timeout("30s".into()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            ReasonerError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ReasonerError::Timeout(_)));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> =
            with_retry(&RetryPolicy::default(), ReasonerError::is_transient, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ReasonerError::AuthenticationFailed("bad key".into()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap_err(),
            ReasonerError::AuthenticationFailed(_)
        ));
    }

    #[tokio::test]
    async fn single_attempt_policy_never_sleeps() {
        let policy = RetryPolicy::new(1, Duration::from_secs(60));
        let result: Result<(), _> = with_retry(&policy, ReasonerError::is_transient, || async {
            Err(ReasonerError::Network("down".into()))
        })
        .await;
        assert!(matches!(
            result.unwrap_err(),
            ReasonerError::Exhausted { attempts: 1, .. }
        ));
    }
}
