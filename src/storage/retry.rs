//! Retry wrapper with exponential backoff, composed with the circuit breaker.
//!
//! Grounded on the teacher's `with_retry` (lock-error backoff over rusqlite),
//! generalized to the async repository surface and to observing the breaker.

use std::future::Future;
use std::time::Duration;

use crate::error::{RepositoryError, Result};
use crate::storage::circuit_breaker::CircuitBreaker;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(self.factor.saturating_pow(attempt));
        scaled.min(self.cap)
    }
}

/// Run `op` under the retry policy and circuit breaker. Only errors that
/// `is_transient` flags as transport-level are retried; everything else
/// surfaces immediately. Exhausting retries surfaces as `ConnectionError`.
pub async fn with_retry<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !breaker.allow() {
        return Err(RepositoryError::connection(
            "circuit breaker open: rejecting call",
        ));
    }

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) if is_transient(&err) && attempt < policy.max_retries => {
                breaker.record_failure();
                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt, ?delay, "retrying transient storage error: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
                if !breaker.allow() {
                    return Err(RepositoryError::connection(
                        "circuit breaker open after failed attempt",
                    ));
                }
            }
            Err(err) if is_transient(&err) => {
                breaker.record_failure();
                return Err(RepositoryError::connection(format!(
                    "retries exhausted: {err}"
                )));
            }
            Err(err) => {
                // Non-transient errors do not count against the breaker.
                return Err(err);
            }
        }
    }
}

fn is_transient(err: &RepositoryError) -> bool {
    matches!(err, RepositoryError::Connection(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let breaker = CircuitBreaker::default();
        let result: Result<i32> = with_retry(&breaker, RetryPolicy::default(), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let breaker = CircuitBreaker::default();
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            ..Default::default()
        };
        let result: Result<i32> = with_retry(&breaker, policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RepositoryError::connection("transient"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_surface_immediately() {
        let breaker = CircuitBreaker::default();
        let attempts = AtomicU32::new(0);
        let result: Result<i32> = with_retry(&breaker, RetryPolicy::default(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RepositoryError::validation("bad input")) }
        })
        .await;
        assert!(matches!(result, Err(RepositoryError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_connection_error() {
        let breaker = CircuitBreaker::default();
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_retries: 2,
            ..Default::default()
        };
        let result: Result<i32> =
            with_retry(&breaker, policy, || async { Err(RepositoryError::connection("down")) }).await;
        assert!(matches!(result, Err(RepositoryError::Connection(_))));
    }
}
