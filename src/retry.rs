//! Bounded retry with backoff for unreliable I/O.
//!
//! One helper shared by the LLM adapter, browser navigation, and store
//! writes, instead of inline retry loops at every call site.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Backoff policy: fixed or exponential delay between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// 1.0 keeps the delay fixed; >1.0 grows it per attempt.
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(delay_ms),
            multiplier: 1.0,
            max_delay: Duration::from_millis(delay_ms),
        }
    }

    /// Exponential backoff, doubling per attempt and capped at 30s.
    pub fn exponential(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(initial_delay_ms),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Delay to sleep before the given retry (attempt index starts at 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, a non-retryable error occurs, or attempts
/// are exhausted. `is_retryable` decides which errors are worth another
/// attempt; the last error is returned on exhaustion.
pub async fn retry<T, F, Fut, P>(policy: &RetryPolicy, is_retryable: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && is_retryable(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after failure"
                );
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Internal("retry loop exited unexpectedly".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, 1);
        let result = retry(&policy, Error::is_transient, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::LlmTransport("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, 1);
        let result: Result<()> = retry(&policy, Error::is_transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Config("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let policy = RetryPolicy::fixed(2, 1);
        let result: Result<()> = retry(&policy, Error::is_transient, || async {
            Err(Error::LlmTransport("always".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::LlmTransport(_))));
    }

    #[test]
    fn exponential_delays_grow_and_cap() {
        let policy = RetryPolicy::exponential(5, 1_000);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }
}
