//! Transient-failure retry loop with jittered exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::ClientResult;

/// Backoff schedule for transient failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the supplied attempt ceiling and delays.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Returns the maximum number of attempts (including the first).
    #[must_use]
    pub const fn max_attempts(self) -> u32 {
        self.max_attempts
    }

    /// Computes the backoff before retry number `attempt` (zero-based):
    /// `base · 2^attempt`, clamped to the maximum, plus up to 50% jitter.
    #[must_use]
    pub fn delay_for(self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ceiling = exponential.as_millis() / 2;
        if jitter_ceiling == 0 {
            return exponential;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        exponential + Duration::from_millis(u64::try_from(jitter).unwrap_or(u64::MAX))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(5))
    }
}

/// Runs `operation` until it succeeds, fails non-transiently, or the
/// attempt budget is spent.
///
/// The closure receives the zero-based attempt number. Only errors whose
/// [`is_transient`](crate::ClientError::is_transient) returns `true` are
/// retried.
///
/// # Errors
///
/// Returns the last error produced by `operation`.
pub async fn run<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> ClientResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts() => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn delay_doubles_and_clamps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(300));
        // Jitter adds at most 50%, so bounds are [exp, 1.5·exp].
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = policy.delay_for(2);
        assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = run(policy(), move |_attempt| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClientError::transport("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let err = run(policy(), move |_attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClientError::Status {
                    status: 400,
                    body: "bad request".into(),
                })
            }
        })
        .await
        .expect_err("must not retry");

        assert!(matches!(err, ClientError::Status { status: 400, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_budget_is_exhausted() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let err = run(policy(), move |_attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClientError::transport("still down"))
            }
        })
        .await
        .expect_err("must exhaust");

        assert!(matches!(err, ClientError::Transport { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
