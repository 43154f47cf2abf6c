//! Retry policy for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExecutionConfig;
use crate::error::ProviderError;

/// Bounds on how a single provider operation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
    /// Deadline for one attempt. Expiry counts as a transient failure.
    pub call_timeout: Duration,
}

/// Outcome of a retried operation plus the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, ProviderError>,
    /// Attempts made.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl RetryPolicy {
    /// Builds the policy described by the execution settings.
    #[must_use]
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }

    /// Delay before retry number `retry` (1-based): `initial * 2^(retry-1)`, capped.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                let delay = self.backoff(attempt - 1);
                debug!("Retry attempt {attempt} of {} for {what} in {delay:?}", self.max_attempts);
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::transient(format!(
                    "{what} exceeded the {}s call deadline",
                    self.call_timeout.as_secs()
                ))),
            };

            match result {
                Err(e) if e.transient && attempt < self.max_attempts => {
                    warn!("Transient failure on {what} (attempt {attempt}): {e}");
                }
                result => {
                    return Attempted {
                        result,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CreatedResource, MockProvider, Properties, Provider};
    use mockall::Sequence;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(1),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let mut provider = MockProvider::new();
        let mut seq = Sequence::new();
        provider
            .expect_create_resource()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(ProviderError::transient("throttled")));
        provider
            .expect_create_resource()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(CreatedResource {
                    provider_id: String::from("q-1"),
                    outputs: Properties::new(),
                })
            });

        let props = Properties::new();
        let outcome = fast_policy(5)
            .run("create q", || provider.create_resource("queue", &props))
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap().provider_id, "q-1");
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let mut provider = MockProvider::new();
        provider
            .expect_delete_resource()
            .times(1)
            .returning(|_, _| Err(ProviderError::permanent("forbidden")));

        let outcome = fast_policy(5)
            .run("delete q", || provider.delete_resource("queue", "q-1"))
            .await;

        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.result.unwrap_err().transient);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let mut provider = MockProvider::new();
        provider
            .expect_delete_resource()
            .times(3)
            .returning(|_, _| Err(ProviderError::transient("unavailable")));

        let outcome = fast_policy(3)
            .run("delete q", || provider.delete_resource("queue", "q-1"))
            .await;

        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.unwrap_err().transient);
    }

    #[tokio::test]
    async fn test_deadline_is_transient() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..fast_policy(2)
        };

        let outcome: Attempted<()> = policy
            .run("slow call", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        let err = outcome.result.unwrap_err();
        assert!(err.transient);
        assert!(err.message.contains("deadline"));
    }
}
