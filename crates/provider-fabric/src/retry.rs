use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::errors::FabricError;

/// Exponential backoff with jitter, per spec.md §4.A.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the computed backoff added as jitter, in `[0, jitter_fraction]`.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let base_ms = (self.initial_backoff.as_millis() as f64 * exp)
            .min(self.max_backoff.as_millis() as f64);
        let jitter_ms = if self.jitter_fraction > 0.0 {
            rand::thread_rng().gen_range(0.0..=base_ms * self.jitter_fraction)
        } else {
            0.0
        };
        Duration::from_millis((base_ms + jitter_ms) as u64)
    }

    /// Runs `op` up to `max_attempts` times, retrying only errors that
    /// classify as retryable (spec.md §4.A, P10), and giving up early if
    /// `deadline` has already elapsed — this is how a cancelled/expired
    /// *caller* context (as opposed to a single RPC's own deadline) is
    /// distinguished from an ordinary retryable timeout.
    pub async fn call<T, F, Fut>(
        &self,
        deadline: tokio::time::Instant,
        mut op: F,
    ) -> Result<T, FabricError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, tonic::Status>>,
    {
        let mut attempt = 0u32;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(FabricError::Rpc(tonic::Status::deadline_exceeded(
                    "caller context deadline exceeded",
                )));
            }

            match op().await {
                Ok(v) => return Ok(v),
                Err(status) => {
                    attempt += 1;
                    let retryable = FabricError::is_retryable(&status);
                    if !retryable || attempt >= self.max_attempts {
                        debug!(
                            attempt,
                            retryable,
                            code = ?status.code(),
                            "giving up on rpc call"
                        );
                        return Err(FabricError::Rpc(status));
                    }
                    let backoff = self.backoff_for_attempt(attempt - 1);
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, code = ?status.code(), "retrying rpc call");
                    tokio::time::sleep(backoff.min(
                        deadline.saturating_duration_since(tokio::time::Instant::now()),
                    ))
                    .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_up_to_max_attempts_on_unavailable() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter_fraction: 0.0,
            ..Default::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let calls2 = calls.clone();
        let result: Result<(), FabricError> = policy
            .call(deadline, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(tonic::Status::unavailable("down"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_not_found() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let calls2 = calls.clone();
        let result: Result<(), FabricError> = policy
            .call(deadline, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(tonic::Status::not_found("missing"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter_fraction: 0.0,
            ..Default::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let calls2 = calls.clone();
        let result = policy
            .call(deadline, || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(tonic::Status::unavailable("down"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }
}
