//! In-process fake `SecretStoreProvider`, used only by `#[cfg(test)]` code
//! to exercise the real gRPC path (spec.md §8 scenarios) without a live
//! backend. Mirrors the wire contract `provider_fabric::synthetic` adapts
//! for v1 plugins, but records calls instead of delegating to one.
#![cfg(test)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tonic::{Request, Response, Status};

use provider_fabric::pb;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCall {
    Push { remote_key: String, property: String, value: Vec<u8> },
    Delete { remote_key: String, property: String },
    Exists { remote_key: String, property: String },
}

#[derive(Default)]
struct Inner {
    calls: Vec<RecordedCall>,
    remote: BTreeMap<(String, String), Vec<u8>>,
}

/// Cheaply cloneable handle shared between the spawned tonic service and
/// whatever test holds onto it to inspect `calls()`/`remote_value()`.
#[derive(Clone)]
pub struct FakeProvider {
    inner: Arc<Mutex<Inner>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())) }
    }

    /// Pre-loads a remote entry, as scenario 2 (IfNotExists bypass) needs.
    pub fn seed(&self, remote_key: &str, property: &str, value: &[u8]) {
        self.inner.lock().unwrap().remote.insert((remote_key.to_string(), property.to_string()), value.to_vec());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn remote_value(&self, remote_key: &str, property: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().remote.get(&(remote_key.to_string(), property.to_string())).cloned()
    }

    /// Binds an ephemeral local port, serves this fake in the background,
    /// and returns the dial address the reconciler-side client should use.
    pub async fn spawn(self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local_addr");
        drop(listener);

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(pb::secret_store_provider_server::SecretStoreProviderServer::new(self))
                .serve(addr)
                .await
                .expect("fake provider server exited");
        });

        // The listener above is dropped so `serve` can rebind the same
        // address; give the spawned task a moment to start accepting.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        addr
    }
}

#[tonic::async_trait]
impl pb::secret_store_provider_server::SecretStoreProvider for FakeProvider {
    async fn get_secret(&self, request: Request<pb::GetSecretRequest>) -> Result<Response<pb::GetSecretResponse>, Status> {
        let req = request.into_inner();
        let remote_ref = req.remote_ref.unwrap_or_default();
        let value = self.inner.lock().unwrap().remote.get(&(remote_ref.remote_key.clone(), remote_ref.property.clone())).cloned();
        match value {
            Some(value) => Ok(Response::new(pb::GetSecretResponse { value, metadata_json: String::new() })),
            None => Err(Status::not_found(format!("no such remote key {:?}", remote_ref.remote_key))),
        }
    }

    async fn get_all_secrets(&self, _request: Request<pb::GetAllSecretsRequest>) -> Result<Response<pb::GetAllSecretsResponse>, Status> {
        Ok(Response::new(pb::GetAllSecretsResponse { data: std::collections::HashMap::new() }))
    }

    async fn push_secret(&self, request: Request<pb::PushSecretRequest>) -> Result<Response<pb::PushSecretResponse>, Status> {
        let req = request.into_inner();
        let push_data = req.push_data.ok_or_else(|| Status::invalid_argument("push_data required"))?;
        let value = req.secret_data.get(&push_data.secret_key).cloned().unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        inner.remote.insert((push_data.remote_key.clone(), push_data.property.clone()), value.clone());
        inner.calls.push(RecordedCall::Push { remote_key: push_data.remote_key, property: push_data.property, value });
        Ok(Response::new(pb::PushSecretResponse {}))
    }

    async fn delete_secret(&self, request: Request<pb::DeleteSecretRequest>) -> Result<Response<pb::DeleteSecretResponse>, Status> {
        let req = request.into_inner();
        let remote_ref = req.remote_ref.unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        inner.remote.remove(&(remote_ref.remote_key.clone(), remote_ref.property.clone()));
        inner.calls.push(RecordedCall::Delete { remote_key: remote_ref.remote_key, property: remote_ref.property });
        Ok(Response::new(pb::DeleteSecretResponse {}))
    }

    async fn secret_exists(&self, request: Request<pb::SecretExistsRequest>) -> Result<Response<pb::SecretExistsResponse>, Status> {
        let req = request.into_inner();
        let remote_ref = req.remote_ref.unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        let exists = inner.remote.contains_key(&(remote_ref.remote_key.clone(), remote_ref.property.clone()));
        inner.calls.push(RecordedCall::Exists { remote_key: remote_ref.remote_key, property: remote_ref.property });
        Ok(Response::new(pb::SecretExistsResponse { exists }))
    }

    async fn validate(&self, _request: Request<pb::ValidateRequest>) -> Result<Response<pb::ValidateResponse>, Status> {
        Ok(Response::new(pb::ValidateResponse { valid: true, error: String::new(), warnings: vec![] }))
    }

    async fn capabilities(&self, _request: Request<pb::CapabilitiesRequest>) -> Result<Response<pb::CapabilitiesResponse>, Status> {
        Ok(Response::new(pb::CapabilitiesResponse { capability: pb::Capability::ReadWrite as i32 }))
    }
}
