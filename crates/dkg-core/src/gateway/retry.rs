//! Deadlines and bounded retries for gateway calls
//!
//! Every gateway call runs under a deadline. Reads that fail transiently are
//! retried with exponential backoff plus jitter; writes are never retried
//! here. Only the coordinator decides whether a write is resubmitted.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::{GatewayError, GatewayResult};
use crate::finalization::Backoff;

/// Retry policy for idempotent gateway reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Deadline applied to each individual call
    pub call_timeout: Duration,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(5), 2),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl ReadRetryPolicy {
    /// Delay before retry `attempt`, with up to 10% random jitter
    fn delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

/// Run a gateway call under a deadline
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(deadline)),
    }
}

/// Run an idempotent read, retrying transient failures
pub async fn retry_read<T, F, Fut>(
    policy: &ReadRetryPolicy,
    operation: &str,
    mut call: F,
) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match with_deadline(policy.call_timeout, call()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempts < policy.max_attempts => {
                let backoff = policy.delay(attempts);
                warn!(
                    operation = operation,
                    attempt = attempts,
                    wait_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Gateway read failed, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> ReadRetryPolicy {
        ReadRetryPolicy {
            max_attempts,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_read(&policy(3), "get_owner", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Transient("connection reset".into()))
                } else {
                    Ok(42u64)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: GatewayResult<u64> = retry_read(&policy(2), "get_owner", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Transient("down".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(GatewayError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_definitive_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: GatewayResult<u64> = retry_read(&policy(5), "get_owner", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::NotFound("token 9".into()))
            }
        })
        .await;

        assert_eq!(result, Err(GatewayError::NotFound("token 9".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_turns_hang_into_timeout() {
        let result: GatewayResult<()> = with_deadline(Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(GatewayError::Timeout(Duration::from_secs(2))));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = policy(3);
        for attempt in 1..5 {
            let base = policy.backoff.delay(attempt);
            let delay = policy.delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 10);
        }
    }
}
