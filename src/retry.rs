//! Bounded exponential backoff shared by the remote embedders and the
//! label client.
//!
//! Delays grow as `base, 2×base, 4×base, …`, capped at `32×base`. The
//! first attempt never waits.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Policy with no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(5);
        self.base_delay * (1u32 << exp)
    }
}

/// Whether a failed attempt may be retried.
#[derive(Debug)]
pub enum Attempt<E> {
    Retry(E),
    Fatal(E),
}

/// Outcome of an exhausted or aborted retry loop.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds, fails fatally, or the policy is spent.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let mut attempt = 1;
    loop {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(e)) => {
                warn!(what, attempt, error = %e, "non-retryable failure");
                return Err(RetryFailure {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(Attempt::Retry(e)) => {
                warn!(what, attempt, max = policy.max_attempts, error = %e, "attempt failed");
                if attempt >= policy.max_attempts {
                    return Err(RetryFailure {
                        attempts: attempt,
                        last_error: e,
                    });
                }
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy::new(10, Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::ZERO);
        assert_eq!(p.delay_for(2), Duration::from_millis(100));
        assert_eq!(p.delay_for(3), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(400));
        assert_eq!(p.delay_for(9), Duration::from_millis(3200));
    }

    #[test]
    fn zero_attempts_is_clamped() {
        assert_eq!(RetryPolicy::immediate(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry_with_backoff(&RetryPolicy::immediate(3), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Attempt::Retry(format!("boom {attempt}")))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_keeps_last_error() {
        let err = retry_with_backoff(&RetryPolicy::immediate(4), "test", |attempt| async move {
            Err::<(), _>(Attempt::Retry(format!("boom {attempt}")))
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error, "boom 4");
    }

    #[tokio::test]
    async fn fatal_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&RetryPolicy::immediate(5), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Attempt::Fatal("bad request".to_string())) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
