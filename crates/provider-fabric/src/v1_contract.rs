//! The v1 in-tree provider/generator plugin contract, spec.md §4.D.
//!
//! `SyntheticStoreAdapter` (see `synthetic.rs`) is the only thing in this
//! crate that calls into these traits directly; everything else talks to
//! backends exclusively over gRPC (spec.md §1).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::pb;

/// Minimal shape of a v1 `SecretStoreSpec`, kept intentionally small: the
/// concrete backend config blobs are treated as an opaque JSON payload
/// since individual provider implementations are out of scope (spec.md §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStoreSpec {
    pub provider_kind: String,
    pub controller: Option<String>,
    pub config: serde_json::Value,
}

/// A v1 `GenericStore` — the common surface that both real `SecretStore`
/// objects and the synthetic wrapper (`SyntheticStore`) satisfy (spec.md
/// §4.D). `spec` is non-nullable by construction, resolving the Open
/// Question about `DeepCopyObject` dereferencing a possibly-absent spec
/// (see SPEC_FULL.md §4).
pub trait GenericStore: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    fn namespace(&self) -> Option<&str>;
    fn spec(&self) -> &SecretStoreSpec;
    fn controller(&self) -> Option<&str> {
        self.spec().controller.as_deref()
    }
    fn ready(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub tags: HashMap<String, String>,
    pub path: Option<String>,
    pub name_regex: Option<String>,
    pub conversion_strategy: String,
    pub decoding_strategy: String,
}

#[derive(Debug, Clone, Default)]
pub struct PushSecretData {
    pub secret_key: String,
    pub remote_key: String,
    pub property: String,
    pub metadata_json: String,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteRef {
    pub remote_key: String,
    pub property: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// The in-process contract every v1 provider plugin implements. This is
/// the interface `SyntheticStoreAdapter` bridges onto the gRPC
/// `SecretStoreProvider` service (spec.md §4.D).
#[async_trait]
pub trait Provider: Send + Sync {
    async fn get_secret(&self, store: &dyn GenericStore, source_namespace: &str, remote_ref: RemoteRef) -> anyhow::Result<Vec<u8>>;
    async fn get_all_secrets(&self, store: &dyn GenericStore, source_namespace: &str, find: FindQuery) -> anyhow::Result<HashMap<String, Vec<u8>>>;
    async fn push_secret(
        &self,
        store: &dyn GenericStore,
        source_namespace: &str,
        secret_data: &HashMap<String, Vec<u8>>,
        push_data: PushSecretData,
    ) -> anyhow::Result<()>;
    async fn delete_secret(&self, store: &dyn GenericStore, source_namespace: &str, remote_ref: RemoteRef) -> anyhow::Result<()>;
    async fn secret_exists(&self, store: &dyn GenericStore, source_namespace: &str, remote_ref: RemoteRef) -> anyhow::Result<bool>;
    async fn validate(&self, store: &dyn GenericStore, source_namespace: &str) -> anyhow::Result<Vec<String>>;
    async fn capabilities(&self, store: &dyn GenericStore) -> Capability;
}

/// The in-process contract every v1 generator plugin implements, bridged
/// onto the gRPC `GeneratorProvider` service by the generator adapter.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, source_namespace: &str) -> anyhow::Result<(HashMap<String, Vec<u8>>, Vec<u8>)>;
    async fn cleanup(&self, source_namespace: &str, state: Vec<u8>) -> anyhow::Result<()>;
}

impl From<Capability> for pb::Capability {
    fn from(value: Capability) -> Self {
        match value {
            Capability::ReadOnly => pb::Capability::ReadOnly,
            Capability::WriteOnly => pb::Capability::WriteOnly,
            Capability::ReadWrite => pb::Capability::ReadWrite,
        }
    }
}

impl From<pb::Capability> for Capability {
    fn from(value: pb::Capability) -> Self {
        match value {
            pb::Capability::ReadOnly => Capability::ReadOnly,
            pb::Capability::WriteOnly => Capability::WriteOnly,
            pb::Capability::ReadWrite => Capability::ReadWrite,
        }
    }
}
