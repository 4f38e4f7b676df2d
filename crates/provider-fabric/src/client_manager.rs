//! Component C (provider-fabric half): caches one `ResilientClient` per
//! provider, invalidated when the caller's generation digest changes
//! (spec.md §4.C, §4.G `syncedResourceVersion`). The reconciler-side half of
//! component C (in `push-secrets::client_manager`) owns v1-vs-v2 resolution
//! and calls into this cache only for v2 backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::pool::ConnectionPool;
use crate::resilient_client::{ClientMetrics, ResilientClient};
use crate::retry::RetryPolicy;
use crate::tls::MtlsMaterial;

struct CachedClient {
    generation: String,
    client: Arc<ResilientClient>,
}

/// Keyed by an opaque caller-chosen string (the reconciler uses
/// `namespace/name` or `name` for cluster-scoped providers). A cache hit
/// requires both the key and the generation digest to match; any digest
/// change rebuilds the client rather than mutating the cached one in place.
pub struct ClientManager {
    clients: RwLock<HashMap<String, CachedClient>>,
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ClientManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        retry: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            pool,
            retry,
            breaker_config,
            metrics,
        }
    }

    pub async fn get(
        &self,
        key: &str,
        generation: &str,
        address: &str,
        tls: Option<MtlsMaterial>,
    ) -> Arc<ResilientClient> {
        if let Some(cached) = self.clients.read().await.get(key) {
            if cached.generation == generation {
                return cached.client.clone();
            }
        }

        let mut clients = self.clients.write().await;
        if let Some(cached) = clients.get(key) {
            if cached.generation == generation {
                return cached.client.clone();
            }
        }

        let client = Arc::new(ResilientClient::new(
            address.to_string(),
            tls,
            self.pool.clone(),
            self.retry.clone(),
            self.breaker_config.clone(),
            self.metrics.clone(),
        ));
        clients.insert(
            key.to_string(),
            CachedClient { generation: generation.to_string(), client: client.clone() },
        );
        client
    }

    pub async fn invalidate(&self, key: &str) {
        self.clients.write().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }
}

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
