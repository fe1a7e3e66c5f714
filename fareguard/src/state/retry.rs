// fareguard/src/state/retry.rs
//
// Bounded exponential retry for single store operations.
// Each attempt runs under its own timeout; a timeout counts as a retryable
// failure. Non-retryable errors return immediately.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts:      u32,
    pub base_delay_ms: u64,
    pub multiplier:    u32,
    pub op_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts:      3,
            base_delay_ms: 100,
            multiplier:    2,
            op_timeout_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n + 1` (n starts at 1).
    pub fn delay(&self, n: u32) -> Duration {
        let factor = (self.multiplier.max(1) as u64).saturating_pow(n.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, StoreError>
where
    F:   FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.attempts.max(1);
    let mut n = 0;
    loop {
        n += 1;
        let result = match tokio::time::timeout(policy.op_timeout(), op()).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout(policy.op_timeout())),
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && n < attempts => {
                let wait = policy.delay(n);
                debug!(op = what, attempt = n, error = %e, wait_ms = wait.as_millis() as u64, "retrying store op");
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy { attempts: 3, base_delay_ms: 1, multiplier: 2, op_timeout_ms: 50 }
    }

    #[test]
    fn delays_grow_exponentially() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = with_retry(&fast(), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Connection("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = with_retry(&fast(), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Connection("down".into()))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn command_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = with_retry(&fast(), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Command("WRONGTYPE".into()))
        })
        .await;
        assert!(matches!(out, Err(StoreError::Command(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_ops_time_out() {
        let out: Result<(), _> = with_retry(&fast(), "test", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(out, Err(StoreError::Timeout(Duration::from_millis(50))));
    }
}
