use std::future::Future;
use std::time::Duration;

use crate::orchestration::OrchestrationResult;

/// Exponential backoff: `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn allows_another_attempt(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(5))
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// the policy runs out of attempts.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> OrchestrationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestrationResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.kind.is_transient() && policy.allows_another_attempt(attempt) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    kind = ?error.kind,
                    message = %error.message,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::{RetryPolicy, retry_transient};
    use crate::models::{CoreError, CoreErrorKind};

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let value = retry_transient(&policy, "publish", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(CoreError::new(CoreErrorKind::BrokerUnavailable, "down"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_surface_immediately() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let error = retry_transient(&policy, "publish", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(CoreError::new(CoreErrorKind::InvalidInput, "bad")) }
        })
        .await
        .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
