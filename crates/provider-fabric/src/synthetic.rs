//! Component D: the synthetic store adapter, spec.md §4.D.
//!
//! Bridges the wire-level `SecretStoreProvider`/`GeneratorProvider` gRPC
//! services onto the in-process v1 `Provider`/`Generator` contract, so a v1
//! in-tree provider plugin can be served to v2 callers without being
//! rewritten. The CRD lookup needed to build a `SyntheticStore` from a wire
//! `ProviderReference` is injected as a `SpecResolver` rather than linked
//! directly, since this crate has no Kubernetes client of its own.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::{Request, Response, Status};

use crate::pb;
use crate::v1_contract::{
    Capability, FindQuery, GenericStore, Generator, Provider, PushSecretData, RemoteRef, SecretStoreSpec,
};

/// A `GenericStore` materialized for exactly one gRPC call, wrapping the
/// `SecretStoreSpec` resolved from a wire `ProviderReference`. `spec` is a
/// plain field rather than `Option`, so there is no nil-spec state to guard
/// against at the call sites that dereference it.
#[derive(Debug, Clone)]
pub struct SyntheticStore {
    name: String,
    kind: String,
    namespace: Option<String>,
    spec: SecretStoreSpec,
    ready: bool,
}

impl SyntheticStore {
    pub fn new(name: String, kind: String, namespace: Option<String>, spec: SecretStoreSpec, ready: bool) -> Self {
        Self { name, kind, namespace, spec, ready }
    }
}

impl GenericStore for SyntheticStore {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> &str {
        &self.kind
    }
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
    fn spec(&self) -> &SecretStoreSpec {
        &self.spec
    }
    fn ready(&self) -> bool {
        self.ready
    }
}

/// Resolves a wire `ProviderReference` into a `SyntheticStore`, typically by
/// fetching the referenced `Provider`/`ClusterProvider` object. Implemented
/// by the reconciler crate, which owns the Kubernetes client.
#[async_trait]
pub trait SpecResolver: Send + Sync {
    async fn resolve(&self, provider_ref: &pb::ProviderReference) -> anyhow::Result<SyntheticStore>;
}

type ProviderFactory = Arc<dyn Fn(&SecretStoreSpec) -> anyhow::Result<Arc<dyn Provider>> + Send + Sync>;
type GeneratorFactory = Arc<dyn Fn(&pb::GeneratorReference) -> anyhow::Result<Arc<dyn Generator>> + Send + Sync>;

/// Registry mapping a store's `providerKind` (spec.md glossary) to the v1
/// plugin implementation that backs it.
#[derive(Default, Clone)]
pub struct ProviderMapping {
    providers: HashMap<String, ProviderFactory>,
    generators: HashMap<String, GeneratorFactory>,
}

impl ProviderMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&SecretStoreSpec) -> anyhow::Result<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        self.providers.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_generator<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&pb::GeneratorReference) -> anyhow::Result<Arc<dyn Generator>> + Send + Sync + 'static,
    {
        self.generators.insert(kind.into(), Arc::new(factory));
    }

    fn provider_for(&self, spec: &SecretStoreSpec) -> Result<Arc<dyn Provider>, Status> {
        let factory = self
            .providers
            .get(&spec.provider_kind)
            .ok_or_else(|| Status::invalid_argument(format!("no v1 provider registered for kind {}", spec.provider_kind)))?;
        factory(spec).map_err(|e| Status::internal(e.to_string()))
    }

    fn generator_for(&self, generator_ref: &pb::GeneratorReference) -> Result<Arc<dyn Generator>, Status> {
        let factory = self
            .generators
            .get(&generator_ref.kind)
            .ok_or_else(|| Status::invalid_argument(format!("no v1 generator registered for kind {}", generator_ref.kind)))?;
        factory(generator_ref).map_err(|e| Status::internal(e.to_string()))
    }
}

/// Maps an `anyhow::Error` from a v1 plugin into a gRPC status, per spec.md
/// §6: validation/permission/not-found failures get distinct codes so
/// callers can apply the same retry classification as a real backend
/// (errors.rs `classify`/`is_retryable`).
fn plugin_error_to_status(err: anyhow::Error) -> Status {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("not found") {
        Status::not_found(message)
    } else if lower.contains("permission") || lower.contains("forbidden") || lower.contains("unauthorized") {
        Status::permission_denied(message)
    } else if lower.contains("invalid") || lower.contains("validation") {
        Status::invalid_argument(message)
    } else {
        Status::unavailable(message)
    }
}

fn remote_ref_from_wire(wire: pb::RemoteRef) -> RemoteRef {
    RemoteRef { remote_key: wire.remote_key, property: wire.property }
}

fn find_query_from_wire(wire: pb::FindQuery) -> FindQuery {
    FindQuery {
        tags: wire.tags,
        path: (!wire.path.is_empty()).then_some(wire.path),
        name_regex: (!wire.name_regex.is_empty()).then_some(wire.name_regex),
        conversion_strategy: wire.conversion_strategy,
        decoding_strategy: wire.decoding_strategy,
    }
}

/// gRPC server adapter implementing `SecretStoreProvider` on top of a v1
/// `Provider` plugin, selected per-call via `ProviderMapping`.
pub struct SecretStoreProviderAdapter {
    resolver: Arc<dyn SpecResolver>,
    mapping: Arc<ProviderMapping>,
}

impl SecretStoreProviderAdapter {
    pub fn new(resolver: Arc<dyn SpecResolver>, mapping: Arc<ProviderMapping>) -> Self {
        Self { resolver, mapping }
    }

    async fn store_and_provider(
        &self,
        provider_ref: &pb::ProviderReference,
    ) -> Result<(SyntheticStore, Arc<dyn Provider>), Status> {
        let store = self
            .resolver
            .resolve(provider_ref)
            .await
            .map_err(|e| Status::not_found(e.to_string()))?;
        let provider = self.mapping.provider_for(store.spec())?;
        Ok((store, provider))
    }
}

#[tonic::async_trait]
impl pb::secret_store_provider_server::SecretStoreProvider for SecretStoreProviderAdapter {
    async fn get_secret(
        &self,
        request: Request<pb::GetSecretRequest>,
    ) -> Result<Response<pb::GetSecretResponse>, Status> {
        let req = request.into_inner();
        let provider_ref = req.provider_ref.ok_or_else(|| Status::invalid_argument("provider_ref required"))?;
        let (store, provider) = self.store_and_provider(&provider_ref).await?;
        let value = provider
            .get_secret(&store, &req.source_namespace, remote_ref_from_wire(req.remote_ref.unwrap_or_default()))
            .await
            .map_err(plugin_error_to_status)?;
        Ok(Response::new(pb::GetSecretResponse { value, metadata_json: String::new() }))
    }

    async fn get_all_secrets(
        &self,
        request: Request<pb::GetAllSecretsRequest>,
    ) -> Result<Response<pb::GetAllSecretsResponse>, Status> {
        let req = request.into_inner();
        let provider_ref = req.provider_ref.ok_or_else(|| Status::invalid_argument("provider_ref required"))?;
        let (store, provider) = self.store_and_provider(&provider_ref).await?;
        let data = provider
            .get_all_secrets(&store, &req.source_namespace, find_query_from_wire(req.find.unwrap_or_default()))
            .await
            .map_err(plugin_error_to_status)?;
        Ok(Response::new(pb::GetAllSecretsResponse { data }))
    }

    async fn push_secret(
        &self,
        request: Request<pb::PushSecretRequest>,
    ) -> Result<Response<pb::PushSecretResponse>, Status> {
        let req = request.into_inner();
        let provider_ref = req.provider_ref.ok_or_else(|| Status::invalid_argument("provider_ref required"))?;
        let (store, provider) = self.store_and_provider(&provider_ref).await?;
        let push_data = req.push_data.unwrap_or_default();
        provider
            .push_secret(
                &store,
                &req.source_namespace,
                &req.secret_data,
                PushSecretData {
                    secret_key: push_data.secret_key,
                    remote_key: push_data.remote_key,
                    property: push_data.property,
                    metadata_json: push_data.metadata_json,
                },
            )
            .await
            .map_err(plugin_error_to_status)?;
        Ok(Response::new(pb::PushSecretResponse {}))
    }

    async fn delete_secret(
        &self,
        request: Request<pb::DeleteSecretRequest>,
    ) -> Result<Response<pb::DeleteSecretResponse>, Status> {
        let req = request.into_inner();
        let provider_ref = req.provider_ref.ok_or_else(|| Status::invalid_argument("provider_ref required"))?;
        let (store, provider) = self.store_and_provider(&provider_ref).await?;
        provider
            .delete_secret(&store, &req.source_namespace, remote_ref_from_wire(req.remote_ref.unwrap_or_default()))
            .await
            .map_err(plugin_error_to_status)?;
        Ok(Response::new(pb::DeleteSecretResponse {}))
    }

    async fn secret_exists(
        &self,
        request: Request<pb::SecretExistsRequest>,
    ) -> Result<Response<pb::SecretExistsResponse>, Status> {
        let req = request.into_inner();
        let provider_ref = req.provider_ref.ok_or_else(|| Status::invalid_argument("provider_ref required"))?;
        let (store, provider) = self.store_and_provider(&provider_ref).await?;
        let exists = provider
            .secret_exists(&store, &req.source_namespace, remote_ref_from_wire(req.remote_ref.unwrap_or_default()))
            .await
            .map_err(plugin_error_to_status)?;
        Ok(Response::new(pb::SecretExistsResponse { exists }))
    }

    async fn validate(&self, request: Request<pb::ValidateRequest>) -> Result<Response<pb::ValidateResponse>, Status> {
        let req = request.into_inner();
        let provider_ref = req.provider_ref.ok_or_else(|| Status::invalid_argument("provider_ref required"))?;
        let (store, provider) = self.store_and_provider(&provider_ref).await?;
        match provider.validate(&store, &req.source_namespace).await {
            Ok(warnings) => Ok(Response::new(pb::ValidateResponse { valid: true, error: String::new(), warnings })),
            Err(e) => Ok(Response::new(pb::ValidateResponse { valid: false, error: e.to_string(), warnings: vec![] })),
        }
    }

    async fn capabilities(
        &self,
        request: Request<pb::CapabilitiesRequest>,
    ) -> Result<Response<pb::CapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let provider_ref = req.provider_ref.ok_or_else(|| Status::invalid_argument("provider_ref required"))?;
        let (store, provider) = self.store_and_provider(&provider_ref).await?;
        let capability: Capability = provider.capabilities(&store).await;
        let wire: pb::Capability = capability.into();
        Ok(Response::new(pb::CapabilitiesResponse { capability: wire as i32 }))
    }
}

/// Resolves a wire `GeneratorReference` into a v1 `Generator`. Implemented
/// by the reconciler crate, same role as `SpecResolver` above.
#[async_trait]
pub trait GeneratorResolver: Send + Sync {
    async fn resolve(&self, generator_ref: &pb::GeneratorReference) -> anyhow::Result<()>;
}

/// gRPC server adapter implementing `GeneratorProvider` on top of a v1
/// `Generator` plugin.
pub struct GeneratorProviderAdapter {
    mapping: Arc<ProviderMapping>,
}

impl GeneratorProviderAdapter {
    pub fn new(mapping: Arc<ProviderMapping>) -> Self {
        Self { mapping }
    }
}

#[tonic::async_trait]
impl pb::generator_provider_server::GeneratorProvider for GeneratorProviderAdapter {
    async fn generate(&self, request: Request<pb::GenerateRequest>) -> Result<Response<pb::GenerateResponse>, Status> {
        let req = request.into_inner();
        let generator_ref = req.generator_ref.ok_or_else(|| Status::invalid_argument("generator_ref required"))?;
        let generator = self.mapping.generator_for(&generator_ref)?;
        let (secrets, state) = generator
            .generate(&req.source_namespace)
            .await
            .map_err(plugin_error_to_status)?;
        Ok(Response::new(pb::GenerateResponse { secrets, state }))
    }

    async fn cleanup(&self, request: Request<pb::CleanupRequest>) -> Result<Response<pb::CleanupResponse>, Status> {
        let req = request.into_inner();
        let generator_ref = req.generator_ref.ok_or_else(|| Status::invalid_argument("generator_ref required"))?;
        let generator = self.mapping.generator_for(&generator_ref)?;
        generator
            .cleanup(&req.source_namespace, req.state)
            .await
            .map_err(plugin_error_to_status)?;
        Ok(Response::new(pb::CleanupResponse {}))
    }
}
