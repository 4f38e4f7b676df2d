//! Component C (reconciler half): resolves a `StoreRef` into an active
//! backend client, spec.md §4.C. Wraps `provider_fabric::client_manager`
//! (the process-global, generation-keyed cache of `ResilientClient`s) with
//! the Kubernetes-native resolution steps — v1-vs-v2 dispatch, controller
//! class filtering, cluster-store namespace admission, and the
//! `ClusterProvider` authentication-scope rule.
//!
//! A `ClientManager` value is cheap and built fresh per reconcile pass (the
//! "per-reconcile-pass cache" of spec.md §4.C); the `provider_fabric`
//! manager it wraps is the process-wide one shared across every reconcile,
//! held in the controller `Context`.

use std::collections::HashMap;
use std::sync::Arc;

use kube::ResourceExt;
use tokio::sync::Mutex as AsyncMutex;

use provider_fabric::client_manager::ClientManager as FabricClientManager;
use provider_fabric::errors::FabricError;
use provider_fabric::pb;
use provider_fabric::resilient_client::{ResilientClient, DEFAULT_RPC_TIMEOUT};
use provider_fabric::tls::MtlsMaterial;

use crate::api::v1alpha1::push_secret::{StoreKind, StoreRef};
use crate::api::v2::{AuthenticationScope, ClusterProvider, Provider};
use crate::api::v1beta1::{ClusterSecretStore, ClusterStoreCondition, SecretStore};
use crate::generic_store::{namespace_admitted, GenericStore};
use crate::util::errors::{Error, StdError};

/// A store resolved to a single concrete Kubernetes object, past label
/// selector expansion and controller/deletion filtering (spec.md §4.E step
/// 7). Each variant carries enough to build the gRPC `ProviderReference`
/// the synthetic adapter or a native v2 provider server expects.
#[derive(Clone)]
pub enum ActiveStore {
    NamespaceStore(SecretStore),
    ClusterStore(ClusterSecretStore),
    Provider(Provider),
    ClusterProvider(ClusterProvider),
}

impl ActiveStore {
    pub fn kind(&self) -> &'static str {
        match self {
            ActiveStore::NamespaceStore(_) => "NamespaceStore",
            ActiveStore::ClusterStore(_) => "ClusterStore",
            ActiveStore::Provider(_) => "Provider",
            ActiveStore::ClusterProvider(_) => "ClusterProvider",
        }
    }

    pub fn name(&self) -> String {
        match self {
            ActiveStore::NamespaceStore(s) => s.name_any(),
            ActiveStore::ClusterStore(s) => s.name_any(),
            ActiveStore::Provider(p) => p.name_any(),
            ActiveStore::ClusterProvider(p) => p.name_any(),
        }
    }

    pub fn generation(&self) -> i64 {
        let meta = match self {
            ActiveStore::NamespaceStore(s) => &s.meta().generation,
            ActiveStore::ClusterStore(s) => &s.meta().generation,
            ActiveStore::Provider(p) => &p.meta().generation,
            ActiveStore::ClusterProvider(p) => &p.meta().generation,
        };
        meta.unwrap_or(0)
    }

    pub fn deletion_timestamp_set(&self) -> bool {
        let dt = match self {
            ActiveStore::NamespaceStore(s) => &s.meta().deletion_timestamp,
            ActiveStore::ClusterStore(s) => &s.meta().deletion_timestamp,
            ActiveStore::Provider(p) => &p.meta().deletion_timestamp,
            ActiveStore::ClusterProvider(p) => &p.meta().deletion_timestamp,
        };
        dt.is_some()
    }

    /// Only v1 stores carry a `spec.controller`; v2 providers have no such
    /// field and are always managed by whichever controller reads them.
    pub fn controller(&self) -> Option<String> {
        match self {
            ActiveStore::NamespaceStore(s) => s.spec.controller.clone(),
            ActiveStore::ClusterStore(s) => s.spec.controller.clone(),
            ActiveStore::Provider(_) | ActiveStore::ClusterProvider(_) => None,
        }
    }

    /// The namespace-selector allow-list carried by cluster-scoped kinds
    /// (spec.md §3 "ClusterProvider additionally holds... spec.conditions[]
    /// identical in semantics to ClusterStore"); `None` for namespaced kinds,
    /// which have no such list and admit only their own namespace by
    /// construction.
    pub fn cluster_conditions(&self) -> Option<&[ClusterStoreCondition]> {
        match self {
            ActiveStore::ClusterStore(s) => Some(&s.spec.conditions),
            ActiveStore::ClusterProvider(p) => Some(&p.spec.conditions),
            ActiveStore::NamespaceStore(_) | ActiveStore::Provider(_) => None,
        }
    }

    /// Identifies this store within a single `PushSecret`'s resolution pass,
    /// used to match a `dataTo` entry's own `storeRef` against the active
    /// stores resolved from `spec.storeRefs` (spec.md §4.E.1 step 4). Stable
    /// across the two resolutions only because both run against the same
    /// manifest namespace.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.kind(), self.name())
    }

    /// The cache key used by both the per-reconcile local cache and the
    /// process-wide `provider_fabric::ClientManager` (spec.md §4.C step 3:
    /// `(kind, name, namespace, generation)`).
    fn cache_key(&self, manifest_namespace: &str) -> String {
        let namespace = match self {
            ActiveStore::NamespaceStore(s) => s.namespace().unwrap_or_default(),
            ActiveStore::ClusterStore(_) => String::new(),
            ActiveStore::Provider(_) => manifest_namespace.to_string(),
            ActiveStore::ClusterProvider(_) => String::new(),
        };
        format!("{}/{}/{}", self.kind(), namespace, self.name())
    }
}

/// A backend client scoped to exactly one store, bridging the wire-level
/// `SecretStoreProvider` RPCs onto the `PushSecretData`/`RemoteRef` shapes
/// the reconciler works with.
pub struct SecretsClient {
    resilient: Arc<ResilientClient>,
    provider_ref: pb::ProviderReference,
    source_namespace: String,
}

impl SecretsClient {
    pub async fn push_secret(
        &self,
        secret_data: HashMap<String, Vec<u8>>,
        secret_key: String,
        remote_key: String,
        property: String,
        metadata_json: String,
    ) -> Result<(), FabricError> {
        let provider_ref = self.provider_ref.clone();
        let source_namespace = self.source_namespace.clone();
        self.resilient
            .call("PushSecret", DEFAULT_RPC_TIMEOUT, move |channel| {
                let mut client = pb::secret_store_provider_client::SecretStoreProviderClient::new(channel);
                let request = tonic::Request::new(pb::PushSecretRequest {
                    secret_data: secret_data.clone(),
                    push_data: Some(pb::PushSecretData {
                        secret_key: secret_key.clone(),
                        remote_key: remote_key.clone(),
                        property: property.clone(),
                        metadata_json: metadata_json.clone(),
                    }),
                    provider_ref: Some(provider_ref.clone()),
                    source_namespace: source_namespace.clone(),
                });
                async move { client.push_secret(request).await.map(|r| r.into_inner()) }
            })
            .await?;
        Ok(())
    }

    pub async fn delete_secret(&self, remote_key: String, property: String) -> Result<(), FabricError> {
        let provider_ref = self.provider_ref.clone();
        let source_namespace = self.source_namespace.clone();
        self.resilient
            .call("DeleteSecret", DEFAULT_RPC_TIMEOUT, move |channel| {
                let mut client = pb::secret_store_provider_client::SecretStoreProviderClient::new(channel);
                let request = tonic::Request::new(pb::DeleteSecretRequest {
                    remote_ref: Some(pb::RemoteRef { remote_key: remote_key.clone(), property: property.clone() }),
                    provider_ref: Some(provider_ref.clone()),
                    source_namespace: source_namespace.clone(),
                });
                async move { client.delete_secret(request).await.map(|r| r.into_inner()) }
            })
            .await?;
        Ok(())
    }

    pub async fn secret_exists(&self, remote_key: String, property: String) -> Result<bool, FabricError> {
        let provider_ref = self.provider_ref.clone();
        let source_namespace = self.source_namespace.clone();
        let response = self
            .resilient
            .call("SecretExists", DEFAULT_RPC_TIMEOUT, move |channel| {
                let mut client = pb::secret_store_provider_client::SecretStoreProviderClient::new(channel);
                let request = tonic::Request::new(pb::SecretExistsRequest {
                    remote_ref: Some(pb::RemoteRef { remote_key: remote_key.clone(), property: property.clone() }),
                    provider_ref: Some(provider_ref.clone()),
                    source_namespace: source_namespace.clone(),
                });
                async move { client.secret_exists(request).await.map(|r| r.into_inner()) }
            })
            .await?;
        Ok(response.exists)
    }

    pub async fn validate(&self) -> Result<pb::ValidateResponse, FabricError> {
        let provider_ref = self.provider_ref.clone();
        let source_namespace = self.source_namespace.clone();
        self.resilient
            .call("Validate", DEFAULT_RPC_TIMEOUT, move |channel| {
                let mut client = pb::secret_store_provider_client::SecretStoreProviderClient::new(channel);
                let request = tonic::Request::new(pb::ValidateRequest {
                    provider_ref: Some(provider_ref.clone()),
                    source_namespace: source_namespace.clone(),
                });
                async move { client.validate(request).await.map(|r| r.into_inner()) }
            })
            .await
    }

    /// Capabilities failure is non-fatal at the call site (spec.md §4.G
    /// step 3); this just surfaces the RPC result and lets the caller
    /// decide the fallback.
    pub async fn capabilities(&self) -> Result<pb::CapabilitiesResponse, FabricError> {
        let provider_ref = self.provider_ref.clone();
        let source_namespace = self.source_namespace.clone();
        self.resilient
            .call("Capabilities", DEFAULT_RPC_TIMEOUT, move |channel| {
                let mut client = pb::secret_store_provider_client::SecretStoreProviderClient::new(channel);
                let request = tonic::Request::new(pb::CapabilitiesRequest {
                    provider_ref: Some(provider_ref.clone()),
                    source_namespace: source_namespace.clone(),
                });
                async move { client.capabilities(request).await.map(|r| r.into_inner()) }
            })
            .await
    }
}

/// How the reconciler dials the synthetic-store bridge (spec.md §4.D) for
/// v1-configured stores, and the mTLS material used for every v2 dial.
#[derive(Clone)]
pub struct ClientManagerConfig {
    pub synthetic_adapter_address: String,
    pub tls: Option<MtlsMaterial>,
    /// Store readiness floodgate (spec.md §4.C step 2): when set, a store
    /// whose `Ready` condition isn't `True` is refused rather than used.
    pub require_store_ready: bool,
}

pub struct ClientManager {
    kube_client: kube::Client,
    fabric: Arc<FabricClientManager>,
    config: ClientManagerConfig,
    controller_class: Option<String>,
    local_cache: AsyncMutex<HashMap<String, Arc<SecretsClient>>>,
}

impl ClientManager {
    pub fn new(
        kube_client: kube::Client,
        fabric: Arc<FabricClientManager>,
        config: ClientManagerConfig,
        controller_class: Option<String>,
    ) -> Self {
        Self {
            kube_client,
            fabric,
            config,
            controller_class,
            local_cache: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn kube_client(&self) -> &kube::Client {
        &self.kube_client
    }

    /// Refuses a store whose `spec.controller` names a different
    /// controller class (spec.md glossary "Store controller class").
    pub fn controller_class_admits(&self, store_controller: Option<&str>) -> bool {
        match (store_controller, &self.controller_class) {
            (None, _) | (Some(""), _) => true,
            (Some(c), Some(class)) => c == class,
            (Some(_), None) => false,
        }
    }

    /// Resolves a client for an already-fetched, already-filtered store
    /// (spec.md §4.C). `manifest_namespace` is the `PushSecret`'s own
    /// namespace, used both as the v1 auth namespace and, unless
    /// overridden by `ClusterProvider.authenticationScope`, the v2 one.
    pub async fn get(&self, store: &ActiveStore, manifest_namespace: &str) -> Result<Arc<SecretsClient>, Error> {
        if !self.controller_class_admits(store.controller().as_deref()) {
            return Err(Error::StdError(StdError::StoreMissing(format!(
                "{} {} is not managed by this controller class",
                store.kind(),
                store.name()
            ))));
        }

        let cache_key = store.cache_key(manifest_namespace);
        {
            let cache = self.local_cache.lock().await;
            if let Some(client) = cache.get(&cache_key) {
                return Ok(client.clone());
            }
        }

        if self.config.require_store_ready && !self.store_ready(store) {
            return Err(Error::StdError(StdError::StoreMissing(format!(
                "{} {} is not Ready",
                store.kind(),
                store.name()
            ))));
        }

        let (address, provider_ref, source_namespace) = self.dial_parameters(store, manifest_namespace)?;
        let generation = store.generation().to_string();
        let resilient = self.fabric.get(&cache_key, &generation, &address, self.config.tls.clone()).await;
        let client = Arc::new(SecretsClient { resilient, provider_ref, source_namespace });

        self.local_cache.lock().await.insert(cache_key, client.clone());
        Ok(client)
    }

    fn store_ready(&self, store: &ActiveStore) -> bool {
        match store {
            ActiveStore::NamespaceStore(s) => GenericStore::ready(s),
            ActiveStore::ClusterStore(s) => GenericStore::ready(s),
            ActiveStore::Provider(p) => {
                crate::util::status::is_status_condition_true(&p.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default(), "Ready")
            }
            ActiveStore::ClusterProvider(p) => {
                crate::util::status::is_status_condition_true(&p.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default(), "Ready")
            }
        }
    }

    fn dial_parameters(
        &self,
        store: &ActiveStore,
        manifest_namespace: &str,
    ) -> Result<(String, pb::ProviderReference, String), Error> {
        match store {
            ActiveStore::NamespaceStore(s) => Ok((
                self.config.synthetic_adapter_address.clone(),
                pb::ProviderReference {
                    api_version: "externalsecrets.io/v1beta1".to_string(),
                    kind: "SecretStore".to_string(),
                    name: s.name_any(),
                    namespace: s.namespace().unwrap_or_default(),
                },
                manifest_namespace.to_string(),
            )),
            ActiveStore::ClusterStore(s) => Ok((
                self.config.synthetic_adapter_address.clone(),
                pb::ProviderReference {
                    api_version: "externalsecrets.io/v1beta1".to_string(),
                    kind: "ClusterSecretStore".to_string(),
                    name: s.name_any(),
                    namespace: String::new(),
                },
                manifest_namespace.to_string(),
            )),
            ActiveStore::Provider(p) => Ok((
                p.spec.config.address.clone(),
                pb::ProviderReference {
                    api_version: "externalsecrets.io/v2".to_string(),
                    kind: "Provider".to_string(),
                    name: p.name_any(),
                    namespace: manifest_namespace.to_string(),
                },
                manifest_namespace.to_string(),
            )),
            ActiveStore::ClusterProvider(p) => {
                let auth_namespace = match p.spec.authentication_scope {
                    AuthenticationScope::ProviderNamespace => {
                        p.spec.config.provider_ref.namespace.clone().unwrap_or_default()
                    }
                    AuthenticationScope::ManifestNamespace => manifest_namespace.to_string(),
                };
                Ok((
                    p.spec.config.address.clone(),
                    pb::ProviderReference {
                        api_version: "externalsecrets.io/v2".to_string(),
                        kind: "ClusterProvider".to_string(),
                        name: p.name_any(),
                        namespace: auth_namespace.clone(),
                    },
                    auth_namespace,
                ))
            }
        }
    }
}

/// Resolves one `StoreRef` into the set of concrete stores it names,
/// expanding `labelSelector` by listing, filtering out stores under
/// deletion, those with a mismatched controller class, and — for
/// cluster-scoped kinds — those whose `spec.conditions[]` namespace
/// allow-list does not admit `namespace` (spec.md §4.E step 7, §4.C step 2,
/// P7). `namespace` is always the calling manifest's own namespace.
pub async fn resolve_store_ref(
    client: &kube::Client,
    store_ref: &StoreRef,
    namespace: &str,
) -> Result<Vec<ActiveStore>, Error> {
    use kube::api::{Api, ListParams};

    let list_params = || -> Result<ListParams, Error> {
        let mut lp = ListParams::default();
        if let Some(selector) = &store_ref.label_selector {
            lp = lp.labels(&label_selector_to_query(selector));
        }
        Ok(lp)
    };

    let stores = match store_ref.kind {
        StoreKind::NamespaceStore => {
            let api: Api<SecretStore> = Api::namespaced(client.clone(), namespace);
            if let Some(name) = &store_ref.name {
                vec![api.get(name).await.map(ActiveStore::NamespaceStore).map_err(Error::from)?]
            } else {
                api.list(&list_params()?).await?.items.into_iter().map(ActiveStore::NamespaceStore).collect()
            }
        }
        StoreKind::ClusterStore => {
            let api: Api<ClusterSecretStore> = Api::all(client.clone());
            if let Some(name) = &store_ref.name {
                vec![api.get(name).await.map(ActiveStore::ClusterStore).map_err(Error::from)?]
            } else {
                api.list(&list_params()?).await?.items.into_iter().map(ActiveStore::ClusterStore).collect()
            }
        }
        StoreKind::Provider => {
            let api: Api<Provider> = Api::namespaced(client.clone(), namespace);
            if let Some(name) = &store_ref.name {
                vec![api.get(name).await.map(ActiveStore::Provider).map_err(Error::from)?]
            } else {
                api.list(&list_params()?).await?.items.into_iter().map(ActiveStore::Provider).collect()
            }
        }
        StoreKind::ClusterProvider => {
            let api: Api<ClusterProvider> = Api::all(client.clone());
            if let Some(name) = &store_ref.name {
                vec![api.get(name).await.map(ActiveStore::ClusterProvider).map_err(Error::from)?]
            } else {
                api.list(&list_params()?).await?.items.into_iter().map(ActiveStore::ClusterProvider).collect()
            }
        }
    };

    let mut admitted = Vec::with_capacity(stores.len());
    for store in stores.into_iter().filter(|s| !s.deletion_timestamp_set()) {
        match store.cluster_conditions() {
            Some(conditions) if !namespace_admitted(client, conditions, namespace).await => continue,
            _ => admitted.push(store),
        }
    }
    Ok(admitted)
}

#[cfg(test)]
impl SecretsClient {
    /// Builds a client dialed directly at `address`, bypassing store
    /// resolution entirely — for tests that exercise the wire path against
    /// `crate::fake_provider::FakeProvider` without a Kubernetes API.
    pub(crate) fn for_test(address: &str) -> Self {
        use provider_fabric::circuit_breaker::CircuitBreakerConfig;
        use provider_fabric::pool::{ConnectionPool, PoolConfig};
        use provider_fabric::retry::RetryPolicy;

        Self {
            resilient: Arc::new(ResilientClient::new(
                address.to_string(),
                None,
                ConnectionPool::new(PoolConfig::default(), None),
                RetryPolicy::default(),
                CircuitBreakerConfig::default(),
                None,
            )),
            provider_ref: pb::ProviderReference {
                api_version: "externalsecrets.io/v2".to_string(),
                kind: "Provider".to_string(),
                name: "test".to_string(),
                namespace: "default".to_string(),
            },
            source_namespace: "default".to_string(),
        }
    }
}

pub fn label_selector_to_query(selector: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector) -> String {
    let mut parts = Vec::new();
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            parts.push(format!("{k}={v}"));
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            match expr.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", expr.key, expr.values.clone().unwrap_or_default().join(","))),
                "NotIn" => parts.push(format!("{} notin ({})", expr.key, expr.values.clone().unwrap_or_default().join(","))),
                "Exists" => parts.push(expr.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                _ => {}
            }
        }
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::fake_provider::{FakeProvider, RecordedCall};

    use super::SecretsClient;

    /// Scenario 1: a single push reaches the backend with the expected
    /// remote key and value.
    #[tokio::test]
    async fn push_reaches_fake_backend() {
        let fake = FakeProvider::new();
        let addr = fake.clone().spawn().await;
        let client = SecretsClient::for_test(&format!("http://{addr}"));

        let mut secret_data = HashMap::new();
        secret_data.insert("key".to_string(), b"value".to_vec());
        client
            .push_secret(secret_data, "key".to_string(), "path/to/key".to_string(), String::new(), String::new())
            .await
            .unwrap();

        assert_eq!(fake.remote_value("path/to/key", ""), Some(b"value".to_vec()));
        assert_eq!(
            fake.calls(),
            vec![RecordedCall::Push { remote_key: "path/to/key".to_string(), property: String::new(), value: b"value".to_vec() }]
        );
    }

    /// Building block for scenario 2 (IfNotExists bypass): `secret_exists`
    /// reports what was pre-seeded, independent of `push_secret`.
    #[tokio::test]
    async fn secret_exists_reports_seeded_entry() {
        let fake = FakeProvider::new();
        fake.seed("path/to/key", "", b"old");
        let addr = fake.clone().spawn().await;
        let client = SecretsClient::for_test(&format!("http://{addr}"));

        assert!(client.secret_exists("path/to/key".to_string(), String::new()).await.unwrap());
        assert!(!client.secret_exists("other".to_string(), String::new()).await.unwrap());
    }

    /// Scenario 3 (delete-on-remoteKey-change), the wire half: the old key
    /// is gone from the backend once `delete_secret` returns.
    #[tokio::test]
    async fn delete_removes_from_fake_backend() {
        let fake = FakeProvider::new();
        fake.seed("path/to/key", "", b"value");
        let addr = fake.clone().spawn().await;
        let client = SecretsClient::for_test(&format!("http://{addr}"));

        client.delete_secret("path/to/key".to_string(), String::new()).await.unwrap();

        assert_eq!(fake.remote_value("path/to/key", ""), None);
        assert_eq!(fake.calls(), vec![RecordedCall::Delete { remote_key: "path/to/key".to_string(), property: String::new() }]);
    }
}
