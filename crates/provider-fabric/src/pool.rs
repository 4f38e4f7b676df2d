//! Process-global gRPC connection pool, spec.md §4.B.
//!
//! Keyed by `(address, tls_enabled)`. Entries are reference-counted so a
//! connection in active use is never evicted by the background maintenance
//! ticker (P8).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::{IntGaugeVec, Registry};
use tokio::sync::{Mutex, RwLock};
use tonic::transport::{Channel, ClientTlsConfig};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::errors::{FabricError, Result};
use crate::tls::MtlsMaterial;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub address: String,
    pub tls_enabled: bool,
}

/// Mutable bookkeeping for one pooled channel, guarded by a single lock so
/// `references` and `last_used` stay consistent without nested locking
/// (spec.md §5: per-entry mutex, independent of the pool-wide map lock).
struct EntryState {
    references: u32,
    last_used: Instant,
}

struct Entry {
    channel: Channel,
    created: Instant,
    state: Mutex<EntryState>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle: Duration,
    pub max_lifetime: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(5 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

pub struct PoolMetrics {
    pub connections: IntGaugeVec,
}

impl PoolMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let connections = IntGaugeVec::new(
            prometheus::opts!(
                "provider_fabric_pool_connections",
                "gRPC connections held by the provider connection pool"
            ),
            &["state"],
        )?;
        registry.register(Box::new(connections.clone()))?;
        Ok(Self { connections })
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    entries: RwLock<HashMap<PoolKey, Arc<Entry>>>,
    metrics: Option<Arc<PoolMetrics>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, metrics: Option<Arc<PoolMetrics>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: RwLock::new(HashMap::new()),
            metrics,
        })
    }

    /// Spawns the background maintenance ticker (spec.md §4.B). The
    /// returned handle is aborted when the pool is dropped via `close()`.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.health_check_interval);
            loop {
                ticker.tick().await;
                pool.run_maintenance().await;
            }
        })
    }

    async fn run_maintenance(&self) {
        let mut to_remove = Vec::new();
        {
            let entries = self.entries.read().await;
            for (key, entry) in entries.iter() {
                let last_used_elapsed = {
                    let state = entry.state.lock().await;
                    if state.references > 0 {
                        continue;
                    }
                    state.last_used.elapsed()
                };
                // tonic's `Channel` doesn't expose TransientFailure/Shutdown
                // inspection publicly; an idle channel in either state is
                // caught here by probing readiness instead of a state read.
                let unhealthy = entry.channel.clone().ready().await.is_err();
                let reason = if entry.created.elapsed() > self.config.max_lifetime {
                    Some("max_lifetime")
                } else if last_used_elapsed > self.config.max_idle {
                    Some("idle_timeout")
                } else if unhealthy {
                    Some("health_check")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    debug!(address = %key.address, reason, "evicting pooled connection");
                    to_remove.push(key.clone());
                }
            }
        }
        if !to_remove.is_empty() {
            let mut entries = self.entries.write().await;
            for key in &to_remove {
                entries.remove(key);
            }
        }
        self.publish_gauges().await;
    }

    async fn publish_gauges(&self) {
        let Some(metrics) = &self.metrics else { return };
        let entries = self.entries.read().await;
        let mut active = 0i64;
        let mut idle = 0i64;
        for entry in entries.values() {
            if entry.state.lock().await.references > 0 {
                active += 1;
            } else {
                idle += 1;
            }
        }
        metrics.connections.with_label_values(&["active"]).set(active);
        metrics.connections.with_label_values(&["idle"]).set(idle);
        metrics
            .connections
            .with_label_values(&["total"])
            .set(active + idle);
    }

    /// Returns a channel for `address`, dialing a fresh one if the cached
    /// entry is stale or missing. Increments the entry's reference count;
    /// the caller must pair this with exactly one `release`.
    pub async fn get(
        &self,
        address: &str,
        tls: Option<&MtlsMaterial>,
    ) -> Result<Channel> {
        let key = PoolKey {
            address: address.to_string(),
            tls_enabled: tls.is_some(),
        };

        if let Some(entry) = self.entries.read().await.get(&key) {
            if entry.created.elapsed() < self.config.max_lifetime {
                let mut state = entry.state.lock().await;
                state.references += 1;
                state.last_used = Instant::now();
                return Ok(entry.channel.clone());
            }
        }

        let channel = self.dial(address, tls).await?;
        let entry = Arc::new(Entry {
            channel: channel.clone(),
            created: Instant::now(),
            state: Mutex::new(EntryState {
                references: 1,
                last_used: Instant::now(),
            }),
        });
        self.entries.write().await.insert(key, entry);
        self.publish_gauges().await;
        Ok(channel)
    }

    async fn dial(&self, address: &str, tls: Option<&MtlsMaterial>) -> Result<Channel> {
        let mut endpoint = Channel::from_shared(address.to_string())
            .map_err(|e| FabricError::Tls(e.to_string()))?
            .tcp_keepalive(Some(Duration::from_secs(10)))
            .keep_alive_timeout(Duration::from_secs(5))
            .keep_alive_while_idle(true);

        if let Some(tls) = tls {
            let tls_config: ClientTlsConfig = tls.client_tls_config(address)?;
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(FabricError::Transport)?;
        }

        info!(address, "dialing provider channel");
        endpoint.connect().await.map_err(FabricError::Transport)
    }

    /// Decrements the reference count for `(address, tls)`; never goes
    /// below zero (P8).
    pub async fn release(&self, address: &str, tls_enabled: bool) {
        let key = PoolKey {
            address: address.to_string(),
            tls_enabled,
        };
        if let Some(entry) = self.entries.read().await.get(&key) {
            let mut state = entry.state.lock().await;
            if state.references > 0 {
                state.references -= 1;
            } else {
                warn!(address, "pool release with zero references, ignoring");
            }
        }
    }

    pub async fn close(&self) {
        self.entries.write().await.clear();
    }
}
