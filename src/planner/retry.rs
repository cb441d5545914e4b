//! Bounded retries with exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{ExecutionConfig, ResourceId};
use crate::error::{ProviderError, ProviderResult};

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl RetryPolicy {
    /// Builds the policy from execution settings.
    #[must_use]
    pub const fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): doubles each time, capped.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or
    /// [`ProviderError::RetriesExhausted`] once the bound is reached.
    pub async fn run<T, F, Fut>(&self, id: &ResourceId, mut op: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.backoff(retry);
                    warn!(
                        "Transient failure on {id} ({e}), retry {retry}/{} in {delay:?}",
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    debug!("Giving up on {id} after {} attempts", retry + 1);
                    return Err(ProviderError::RetriesExhausted {
                        attempts: retry + 1,
                        resource: id.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_millis(3000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let id = ResourceId::new("aws", "instance", "web");
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = policy(3)
            .run(&id, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::transient("aws.instance.web", "timeout"))
                } else {
                    Ok("i-1")
                }
            })
            .await;

        assert_eq!(result, Ok("i-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let id = ResourceId::new("aws", "instance", "web");
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: ProviderResult<()> = policy(2)
            .run(&id, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::transient("aws.instance.web", "timeout"))
            })
            .await;

        assert!(matches!(
            result,
            Err(ProviderError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let id = ResourceId::new("aws", "instance", "web");
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: ProviderResult<()> = policy(5)
            .run(&id, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::fatal("aws.instance.web", "bad ami"))
            })
            .await;

        assert!(result.is_err_and(|e| !e.is_retryable()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
