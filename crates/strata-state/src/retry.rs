// RETRY WITH BACKOFF
// Transient failures (unreachable participants) are retried with exponential
// backoff and jitter; everything else is surfaced immediately

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use log::warn;

use strata_core::{Result, RetryPolicy, StrataError};

/// Policy delay for `attempt` with "equal jitter": half fixed, half random
pub fn jittered_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let millis = policy.delay_for(attempt).as_millis() as u64;
    if millis < 2 {
        return Duration::from_millis(millis);
    }
    let half = millis / 2;
    Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy, or `cancel` fires
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.allows_attempt(attempt.saturating_add(1)) => {
                let delay = jittered_delay(policy, attempt);
                warn!("{} failed (attempt {}): {}; retrying in {:?}", what, attempt + 1, e, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(StrataError::Interrupted(format!("{} cancelled during retry", what)));
                    }
                }
                attempt = attempt.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use strata_core::ShardId;

    fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy { initial_backoff_ms: 1, max_backoff_ms: 4, multiplier: 2.0, max_attempts }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy { initial_backoff_ms: 100, max_backoff_ms: 100, multiplier: 2.0, max_attempts: None };
        for _ in 0..50 {
            let d = jittered_delay(&policy, 3);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(None), "send", &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(StrataError::ParticipantUnreachable(vec![ShardId(1)]))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_and_exhaustion_surface() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_policy(None), "commit", &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StrataError::invalid_state("too early")) }
        })
        .await;
        assert!(matches!(result, Err(StrataError::InvalidState(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_policy(Some(3)), "send", &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StrataError::ParticipantUnreachable(vec![ShardId(2)])) }
        })
        .await;
        assert!(matches!(result, Err(StrataError::ParticipantUnreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
