use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::FabricError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    pub open_timeout: Duration,
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

/// Per-store circuit breaker, spec.md §3/§4.A/P9.
///
/// `last_failure_at` is stored as millis-since-process-start so the whole
/// struct stays `Sync` without pulling in a wall-clock dependency on the hot
/// path; `Instant` itself isn't atomically swappable.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    half_open_in_flight: AtomicU32,
    last_failure_at: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            last_failure_at: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.lock().await
    }

    /// Runs `op` through the breaker: short-circuits without invoking `op`
    /// while `Open` (unless the open timeout has elapsed, which admits the
    /// call as a half-open probe), and updates state from the outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, FabricError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, FabricError>>,
    {
        if !self.admit().await {
            return Err(FabricError::CircuitOpen);
        }

        let result = op().await;
        self.record(result.is_ok()).await;
        result
    }

    /// Decides whether a call may proceed, transitioning `Open -> HalfOpen`
    /// when `openTimeout` has elapsed (P9) and bounding concurrent probes to
    /// `halfOpenMax`.
    async fn admit(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let in_flight = self.half_open_in_flight.fetch_add(1, Ordering::SeqCst);
                if in_flight < self.config.half_open_max {
                    true
                } else {
                    self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
                    false
                }
            }
            CircuitState::Open => {
                let elapsed_ms = self.now_millis().saturating_sub(self.last_failure_at.load(Ordering::SeqCst));
                if elapsed_ms >= self.config.open_timeout.as_millis() as u64 {
                    info!("circuit breaker open_timeout elapsed, admitting half-open probe");
                    *state = CircuitState::HalfOpen;
                    self.half_open_in_flight.store(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record(&self, success: bool) {
        let mut state = self.state.lock().await;
        match *state {
            CircuitState::HalfOpen => {
                self.half_open_in_flight.store(0, Ordering::SeqCst);
                if success {
                    info!("circuit breaker probe succeeded, closing");
                    *state = CircuitState::Closed;
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                } else {
                    warn!("circuit breaker probe failed, reopening");
                    *state = CircuitState::Open;
                    self.last_failure_at.store(self.now_millis(), Ordering::SeqCst);
                }
            }
            CircuitState::Closed => {
                if success {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                } else {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    self.last_failure_at.store(self.now_millis(), Ordering::SeqCst);
                    if failures >= self.config.max_failures {
                        warn!(failures, "circuit breaker tripped, opening");
                        *state = CircuitState::Open;
                    }
                }
            }
            CircuitState::Open => {
                // A call raced the Open->HalfOpen transition; record failure time again.
                if !success {
                    self.last_failure_at.store(self.now_millis(), Ordering::SeqCst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail() -> Result<(), FabricError> {
        Err(FabricError::Rpc(tonic::Status::unavailable("down")))
    }
    async fn succeed() -> Result<(), FabricError> {
        Ok(())
    }

    #[tokio::test]
    async fn trips_after_max_failures_then_recovers() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 5,
            open_timeout: Duration::from_millis(20),
            half_open_max: 1,
        });

        for _ in 0..5 {
            let _ = cb.call(|| fail()).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        // Fails fast without invoking the op.
        let result = cb.call(|| succeed()).await;
        assert!(matches!(result, Err(FabricError::CircuitOpen)));

        tokio::time::sleep(Duration::from_millis(25)).await;

        let result = cb.call(|| succeed()).await;
        assert!(result.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 1,
            open_timeout: Duration::from_millis(10),
            half_open_max: 1,
        });
        let _ = cb.call(|| fail()).await;
        assert_eq!(cb.state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = cb.call(|| fail()).await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
