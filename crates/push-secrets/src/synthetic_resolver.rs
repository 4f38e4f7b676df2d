//! Reconciler-side half of component D (spec.md §4.D): resolves a wire
//! `ProviderReference` into the `SyntheticStore` the adapter server in
//! `provider-fabric` needs, by fetching the named v1 `SecretStore` or
//! `ClusterSecretStore` through this crate's Kubernetes client.

use async_trait::async_trait;
use kube::api::Api;
use kube::ResourceExt;

use provider_fabric::pb;
use provider_fabric::synthetic::{SpecResolver, SyntheticStore};
use provider_fabric::v1_contract::SecretStoreSpec as FabricSecretStoreSpec;

use crate::api::v1beta1::{ClusterSecretStore, SecretStore};
use crate::generic_store::GenericStore;

pub struct KubeSpecResolver {
    client: kube::Client,
}

impl KubeSpecResolver {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SpecResolver for KubeSpecResolver {
    async fn resolve(&self, provider_ref: &pb::ProviderReference) -> anyhow::Result<SyntheticStore> {
        match provider_ref.kind.as_str() {
            "SecretStore" => {
                let api: Api<SecretStore> = Api::namespaced(self.client.clone(), &provider_ref.namespace);
                let store = api.get(&provider_ref.name).await?;
                let ready = GenericStore::ready(&store);
                Ok(SyntheticStore::new(
                    store.name_any(),
                    "SecretStore".to_string(),
                    ResourceExt::namespace(&store),
                    to_fabric_spec(&store),
                    ready,
                ))
            }
            "ClusterSecretStore" => {
                let api: Api<ClusterSecretStore> = Api::all(self.client.clone());
                let store = api.get(&provider_ref.name).await?;
                let ready = GenericStore::ready(&store);
                Ok(SyntheticStore::new(store.name_any(), "ClusterSecretStore".to_string(), None, to_fabric_spec(&store), ready))
            }
            other => anyhow::bail!("synthetic adapter cannot resolve provider reference kind {other:?}"),
        }
    }
}

fn to_fabric_spec<S: GenericStore>(store: &S) -> FabricSecretStoreSpec {
    store.to_fabric_spec()
}
