//! Re-running writes that lose the compare-and-swap on a secret head.
//!
//! A conflicting write is re-run from scratch: it re-reads the head,
//! re-encrypts under the current data key, and re-submits. Each wait is
//! drawn uniformly from a window that doubles per conflict up to a cap, so
//! writers that collided on one head spread out.
//!
//! Only `ConcurrentModification` is re-run here. `KeyUnavailable` is
//! retryable for callers, but each attempt already waited out the KMS
//! timeout, so it goes straight back to them.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use vaultline_common::{Error, Result};

/// How write conflicts are re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Re-runs allowed after the first conflict. Zero surfaces it at once.
    pub max_conflicts: u32,
    /// Wait window after the first conflict.
    pub base_delay: Duration,
    /// Cap on any wait window.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Upper bound of the wait before re-run `attempt`, counting from 1.
    pub fn window(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn wait(&self, attempt: u32) -> Duration {
        self.window(attempt).mul_f64(rand::random::<f64>())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_conflicts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
        }
    }
}

/// Runs a write, re-running it after each `ConcurrentModification`.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation`, re-running it from scratch after each conflict.
    ///
    /// # Errors
    /// - The last `ConcurrentModification` once `max_conflicts` re-runs are spent
    /// - Any other error from `operation`, unchanged and without a re-run
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut conflicts = 0;
        loop {
            let err = match operation().await {
                Ok(result) => {
                    if conflicts > 0 {
                        debug!(conflicts, "Write landed after conflict");
                    }
                    return Ok(result);
                }
                Err(err) => err,
            };
            if !matches!(err, Error::ConcurrentModification(_)) {
                return Err(err);
            }
            conflicts += 1;
            if conflicts > self.config.max_conflicts {
                warn!(conflicts, error = %err, "Write kept conflicting, giving up");
                return Err(err);
            }
            let wait = self.config.wait(conflicts);
            debug!(conflicts, ?wait, "Write conflict, re-running");
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_conflicts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig {
            max_conflicts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        })
    }

    async fn count_runs(
        executor: &RetryExecutor,
        err: fn(u32) -> Option<Error>,
    ) -> (Result<u32>, u32) {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let result = executor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    match err(n) {
                        Some(e) => Err(e),
                        None => Ok(n),
                    }
                }
            })
            .await;
        (result, runs.load(Ordering::SeqCst))
    }

    #[test]
    fn test_wait_window_doubles_to_cap() {
        let config = RetryConfig {
            max_conflicts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(25),
        };

        assert_eq!(config.window(1), Duration::from_millis(10));
        assert_eq!(config.window(2), Duration::from_millis(20));
        assert_eq!(config.window(3), Duration::from_millis(25));
        assert_eq!(config.window(64), Duration::from_millis(25));
        for attempt in 1..6 {
            assert!(config.wait(attempt) <= config.window(attempt));
        }
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let (result, runs) = count_runs(&fast(3), |n| {
            (n < 2).then(|| Error::ConcurrentModification("head moved".to_string()))
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(runs, 3);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let (result, runs) =
            count_runs(&fast(3), |_| Some(Error::DecryptionFailed("tag".to_string()))).await;

        assert!(matches!(result, Err(Error::DecryptionFailed(_))));
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_key_unavailable_goes_straight_back() {
        let (result, runs) = count_runs(&fast(3), |_| {
            Some(Error::KeyUnavailable("kms timed out".to_string()))
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, Error::KeyUnavailable(_)));
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_conflicts() {
        let (result, runs) = count_runs(&fast(2), |_| {
            Some(Error::ConcurrentModification("always".to_string()))
        })
        .await;

        assert!(matches!(result, Err(Error::ConcurrentModification(_))));
        assert_eq!(runs, 3);

        let (_, runs) = count_runs(&fast(0), |_| {
            Some(Error::ConcurrentModification("always".to_string()))
        })
        .await;
        assert_eq!(runs, 1);
    }
}
