//! Bounded retry with exponential backoff, shared by every network operation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// How many times to try and how long to wait in between.
///
/// The delay before attempt `n + 1` is `base_delay * multiplier^(n - 1)`,
/// capped at `max_delay`. A multiplier of 1 gives a fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Same delay between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            multiplier: 1,
        }
    }

    /// Doubling delay starting at `base_delay`, capped at `max_delay`.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2,
        }
    }

    /// Delay to sleep after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay.max(self.base_delay))
    }
}

impl Default for RetryPolicy {
    /// Store default: 3 attempts, 1 s apart.
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is spent.
///
/// Every failure is logged at `warn`; the final one is wrapped in
/// [`StoreError::Exhausted`] carrying the last error message.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> StoreResult<T>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_reason = err.to_string();
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %last_reason,
                    "attempt failed"
                );
                if attempt < max_attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }
    }

    Err(StoreError::Exhausted {
        operation: operation.to_string(),
        attempts: max_attempts,
        reason: last_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fixed_delay_is_constant() {
        let p = RetryPolicy::fixed(3, Duration::from_millis(200));
        assert_eq!(p.delay_after(1), Duration::from_millis(200));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let p = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(p.delay_after(1), Duration::from_secs(1));
        assert_eq!(p.delay_after(2), Duration::from_secs(2));
        assert_eq!(p.delay_after(3), Duration::from_secs(4));
        assert_eq!(p.delay_after(7), Duration::from_secs(60));
        assert_eq!(p.delay_after(40), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let value = retry(&policy, "flaky", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("failure {n}"))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let err = retry(&policy, "always-down", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("connection refused")
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            StoreError::Exhausted {
                attempts, reason, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "connection refused");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(0, Duration::from_millis(10));
        let _ = retry(&policy, "once", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("nope")
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
