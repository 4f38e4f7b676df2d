//! Shared controller scaffolding for components E/F/G, in the teacher's
//! `State`/`Context`/`Diagnostics` shape (see `branch_controller.rs`).

pub mod cluster_push_secret;
pub mod provider;
pub mod push_secret;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, Utc};
use kube::runtime::events::{Recorder, Reporter};
use kube::{Client, Resource};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Duration;

use provider_fabric::client_manager::ClientManager as FabricClientManager;
use provider_fabric::tls::MtlsMaterial;

use crate::client_manager::{ClientManager, ClientManagerConfig};
use crate::generators::GeneratorRegistry;
use crate::locks::RemoteKeyLocks;
use crate::metrics::Metrics;
use crate::statemanager::{DefaultStateManager, StateManager};
use crate::template::{PassthroughTemplateEngine, TemplateEngine};

/// Ambient tunables shared by all three controllers, independent of any one
/// reconciled object (spec.md §4.C/§6 address/TLS plumbing, §4.F/G requeue
/// intervals).
#[derive(Clone)]
pub struct ControllerConfig {
    pub controller_class: Option<String>,
    pub synthetic_adapter_address: String,
    pub tls: Option<MtlsMaterial>,
    pub require_store_ready: bool,
    pub default_requeue: Duration,
}

impl ControllerConfig {
    pub fn client_manager_config(&self) -> ClientManagerConfig {
        ClientManagerConfig {
            synthetic_adapter_address: self.synthetic_adapter_address.clone(),
            tls: self.tls.clone(),
            require_store_ready: self.require_store_ready,
        }
    }
}

/// State shared between every controller's reconcile loop and the metrics
/// HTTP server (spec.md §6 "Provider-server HTTP metrics endpoint").
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    registry: prometheus::Registry,
}

impl Default for State {
    fn default() -> Self {
        State { diagnostics: Arc::new(RwLock::new(Diagnostics::default())), registry: prometheus::Registry::new() }
    }
}

impl State {
    pub fn metric_families(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Exposes the process-wide registry so the manager binary can register
    /// the provider-fabric pool/client gauges (spec.md §5 "Metrics gauges
    /// and registries are process-global") alongside the reconciler ones.
    pub fn registry(&self) -> &prometheus::Registry {
        &self.registry
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn to_context(&self, client: Client, fabric: Arc<FabricClientManager>, config: ControllerConfig) -> Arc<Context> {
        Arc::new(Context {
            client,
            fabric,
            config,
            metrics: Metrics::default().register(&self.registry).expect("metrics registration is infallible at startup"),
            state_manager: Arc::new(DefaultStateManager),
            template_engine: Arc::new(PassthroughTemplateEngine),
            generators: GeneratorRegistry::new(),
            locks: Arc::new(RemoteKeyLocks::new()),
            diagnostics: self.diagnostics.clone(),
            error_backoff: StdMutex::new(HashMap::new()),
        })
    }
}

pub struct Context {
    pub client: Client,
    pub fabric: Arc<FabricClientManager>,
    pub config: ControllerConfig,
    pub metrics: Metrics,
    pub state_manager: Arc<dyn StateManager>,
    pub template_engine: Arc<dyn TemplateEngine>,
    pub generators: GeneratorRegistry,
    pub locks: Arc<RemoteKeyLocks>,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    error_backoff: StdMutex<HashMap<String, ExponentialBackoff>>,
}

impl Context {
    /// A fresh per-reconcile-pass `ClientManager` layered over the
    /// process-global `fabric` cache (spec.md §4.C, §9 "Per-reconcile client
    /// cache vs. process pool").
    pub fn client_manager(&self) -> ClientManager {
        ClientManager::new(self.client.clone(), self.fabric.clone(), self.config.client_manager_config(), self.config.controller_class.clone())
    }

    /// Per-object exponential backoff for `error_policy` (spec.md §9 "design
    /// notes", §5 concurrency model): 1s, 2s, 4s, ... capped at
    /// `config.default_requeue`, keyed by `"{kind}/{namespace}/{name}"`.
    /// Reset on any `Ready=True` transition.
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut backoffs = self.error_backoff.lock().unwrap();
        let backoff = backoffs
            .entry(key.to_string())
            .or_insert_with(|| ExponentialBuilder::default().with_max_delay(self.config.default_requeue).without_max_times().build());
        backoff.next().unwrap_or(self.config.default_requeue)
    }

    pub fn reset_backoff(&self, key: &str) {
        self.error_backoff.lock().unwrap().remove(key);
    }
}

#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self { last_event: Utc::now(), reporter: "push-secrets-controller".into() }
    }
}

impl Diagnostics {
    pub fn recorder<K: Resource<DynamicType = ()>>(&self, client: Client, obj: &K) -> Recorder {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&()))
    }
}
