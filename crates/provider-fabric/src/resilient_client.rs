//! Component A: the resilient gRPC client, spec.md §4.A.
//!
//! Composes the connection pool, retry policy and per-store circuit breaker
//! into a single `call` entry point: `circuit_breaker.call(|| retry.call(||
//! pool.get -> rpc -> pool.release))`. Callers hand in a closure that issues
//! one RPC given a `Channel`; this module owns checkout/checkin and the
//! resilience wrapping around it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{HistogramVec, IntCounterVec, Registry};
use tonic::transport::Channel;
use tracing::error;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::errors::{ErrorClass, FabricError, Result};
use crate::pool::ConnectionPool;
use crate::retry::RetryPolicy;
use crate::tls::MtlsMaterial;

pub struct ClientMetrics {
    pub rpc_duration: HistogramVec,
    pub rpc_errors: IntCounterVec,
}

impl ClientMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let rpc_duration = HistogramVec::new(
            prometheus::histogram_opts!(
                "provider_fabric_rpc_duration_seconds",
                "Resilient client RPC duration in seconds"
            ),
            &["method"],
        )?;
        let rpc_errors = IntCounterVec::new(
            prometheus::opts!(
                "provider_fabric_rpc_errors_total",
                "Resilient client RPC failures by class"
            ),
            &["method", "class"],
        )?;
        registry.register(Box::new(rpc_duration.clone()))?;
        registry.register(Box::new(rpc_errors.clone()))?;
        Ok(Self { rpc_duration, rpc_errors })
    }
}

/// One resilient client per backend address, holding the breaker that
/// tracks that backend's health independently of every other store
/// (spec.md §3: circuit breaker state is per-store, not global).
pub struct ResilientClient {
    address: String,
    tls: Option<MtlsMaterial>,
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ResilientClient {
    pub fn new(
        address: String,
        tls: Option<MtlsMaterial>,
        pool: Arc<ConnectionPool>,
        retry: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            address,
            tls,
            pool,
            retry,
            breaker: CircuitBreaker::new(breaker_config),
            metrics,
        }
    }

    /// Issues one RPC, identified by `method` for observability, through the
    /// full resilience stack: circuit breaker admission, pooled channel
    /// checkout, retry-with-backoff, and guaranteed checkin.
    ///
    /// `op` is handed a fresh `Channel` clone per attempt (tonic channels are
    /// cheaply cloneable multiplexed handles) and returns a `tonic::Status`
    /// on failure so the retry policy can classify it.
    pub async fn call<T, F, Fut>(&self, method: &str, timeout: Duration, op: F) -> Result<T>
    where
        F: Fn(Channel) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, tonic::Status>>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let start = tokio::time::Instant::now();

        let result = self
            .breaker
            .call(|| async {
                let channel = self.pool.get(&self.address, self.tls.as_ref()).await?;
                let outcome = self
                    .retry
                    .call(deadline, || op(channel.clone()))
                    .await;
                self.pool.release(&self.address, self.tls.is_some()).await;
                outcome
            })
            .await;

        self.observe(method, start.elapsed(), &result);
        result
    }

    fn observe<T>(&self, method: &str, elapsed: Duration, result: &Result<T>) {
        let Some(metrics) = &self.metrics else { return };
        metrics
            .rpc_duration
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
        if let Err(err) = result {
            let class = match err {
                FabricError::Rpc(status) => FabricError::classify(status),
                FabricError::CircuitOpen => ErrorClass::Unavailable,
                FabricError::Transport(_) | FabricError::PoolExhausted(_) | FabricError::Tls(_) => {
                    ErrorClass::ConnectionRefused
                }
            };
            metrics
                .rpc_errors
                .with_label_values(&[method, class.as_str()])
                .inc();
            error!(method, class = class.as_str(), "resilient client call failed");
        }
    }
}

/// Per-provider-address registry of `ResilientClient`s, the piece of
/// component C (Client Manager) that provider-fabric owns: one client per
/// `(address, tls)` pair, independent of the v1-store-generation cache the
/// reconciler layer adds on top (spec.md §4.C).
pub struct ResilientClientRegistry {
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    metrics: Option<Arc<ClientMetrics>>,
    clients: tokio::sync::RwLock<HashMap<String, Arc<ResilientClient>>>,
}

impl ResilientClientRegistry {
    pub fn new(
        pool: Arc<ConnectionPool>,
        retry: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            pool,
            retry,
            breaker_config,
            metrics,
            clients: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, address: &str, tls: Option<MtlsMaterial>) -> Arc<ResilientClient> {
        if let Some(client) = self.clients.read().await.get(address) {
            return client.clone();
        }
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(address) {
            return client.clone();
        }
        let client = Arc::new(ResilientClient::new(
            address.to_string(),
            tls,
            self.pool.clone(),
            self.retry.clone(),
            self.breaker_config.clone(),
            self.metrics.clone(),
        ));
        clients.insert(address.to_string(), client.clone());
        client
    }

    pub async fn remove(&self, address: &str) {
        self.clients.write().await.remove(address);
    }
}
