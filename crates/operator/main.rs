//! The manager binary: wires the process-global provider fabric (components
//! A-D) to the three reconcilers (components E-G) and exposes the HTTP
//! metrics/health surface (component H), spec.md §2.
//!
//! CLI/flag parsing is explicitly out of scope (spec.md §1); every tunable
//! here comes from an environment variable with a spec-derived default.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State as AxumState;
use axum::{routing::get, Router};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use prometheus::{Encoder, TextEncoder};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use provider_fabric::circuit_breaker::CircuitBreakerConfig;
use provider_fabric::client_manager::ClientManager as FabricClientManager;
use provider_fabric::pb;
use provider_fabric::pool::{ConnectionPool, PoolConfig, PoolMetrics};
use provider_fabric::resilient_client::ClientMetrics;
use provider_fabric::retry::RetryPolicy;
use provider_fabric::synthetic::{GeneratorProviderAdapter, ProviderMapping, SecretStoreProviderAdapter};
use provider_fabric::tls::MtlsMaterial;

use push_secrets::controllers::{cluster_push_secret, provider, push_secret, ControllerConfig, State};
use push_secrets::synthetic_resolver::KubeSpecResolver;
use push_secrets::util::telemetry;

const TLS_SECRET_NAME: &str = "external-secrets-provider-tls";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration_secs(key: &str, default: u64) -> Duration {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(Duration::from_secs(default))
}

/// Loads the client-side mTLS material from the `external-secrets-provider-tls`
/// Secret in the operator's own namespace (spec.md §6). Returns `None` (TLS
/// disabled) if the Secret is absent, so a development cluster without the
/// Secret installed still starts — every dial simply runs over an
/// unauthenticated channel.
async fn load_client_tls(client: &kube::Client, namespace: &str) -> Option<MtlsMaterial> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = match api.get(TLS_SECRET_NAME).await {
        Ok(s) => s,
        Err(e) => {
            warn!("{TLS_SECRET_NAME} not found in {namespace}, dialing providers without mTLS: {e}");
            return None;
        }
    };
    let data = secret.data.unwrap_or_default();
    let get = |key: &str| data.get(key).map(|b| b.0.clone());
    match (get("ca.crt"), get("client.crt"), get("client.key")) {
        (Some(ca), Some(cert), Some(key)) => Some(MtlsMaterial::from_pem(ca, cert, key)),
        _ => {
            warn!("{TLS_SECRET_NAME} is missing one of ca.crt/client.crt/client.key, dialing without mTLS");
            None
        }
    }
}

/// Loads the synthetic adapter's own server-side identity, from a directory
/// overridable via `TLS_CERT_DIR`/`TLS_CA_CERT_FILE`/`TLS_CERT_FILE`/
/// `TLS_KEY_FILE` (spec.md §6). `None` serves the synthetic adapter in
/// plaintext, matching the client-side fallback above.
fn load_server_tls() -> Option<MtlsMaterial> {
    let dir = env_or("TLS_CERT_DIR", "/etc/provider/certs");
    let ca_file = env_or("TLS_CA_CERT_FILE", "ca.crt");
    let cert_file = env_or("TLS_CERT_FILE", "tls.crt");
    let key_file = env_or("TLS_KEY_FILE", "tls.key");
    MtlsMaterial::from_dir(std::path::Path::new(&dir), &ca_file, &cert_file, &key_file).ok()
}

async fn metrics_handler(AxumState(state): AxumState<State>) -> String {
    let families = state.metric_families();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_default()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn run_synthetic_adapter(kube_client: kube::Client, address: String, tls: Option<MtlsMaterial>) {
    // Out-of-tree v1 provider plugins are a pluggable contract (spec.md
    // §1); none are registered here, so unregistered `providerKind`s simply
    // surface as `InvalidArgument` from the adapter.
    let mapping = Arc::new(ProviderMapping::new());
    let resolver = Arc::new(KubeSpecResolver::new(kube_client));
    let store_adapter = SecretStoreProviderAdapter::new(resolver, mapping.clone());
    let generator_adapter = GeneratorProviderAdapter::new(mapping);

    let addr = match address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid synthetic adapter bind address {address:?}: {e}");
            return;
        }
    };

    let mut server = tonic::transport::Server::builder();
    if let Some(tls) = tls {
        match tls.server_tls_config() {
            Ok(tls_config) => match server.tls_config(tls_config) {
                Ok(s) => server = s,
                Err(e) => error!("failed to apply synthetic adapter TLS config: {e}"),
            },
            Err(e) => error!("failed to build synthetic adapter TLS config: {e}"),
        }
    }

    info!("synthetic store adapter listening on {address}");
    if let Err(e) = server
        .add_service(pb::secret_store_provider_server::SecretStoreProviderServer::new(store_adapter))
        .add_service(pb::generator_provider_server::GeneratorProviderServer::new(generator_adapter))
        .serve(addr)
        .await
    {
        error!("synthetic store adapter exited: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider()).ok();
    telemetry::init().await;

    let operator_namespace = env_or("OPERATOR_NAMESPACE", "external-secrets-system");
    let controller_class = std::env::var("CONTROLLER_CLASS").ok().filter(|s| !s.is_empty());
    let synthetic_adapter_address = env_or("SYNTHETIC_ADAPTER_ADDRESS", "http://127.0.0.1:9443");
    let synthetic_adapter_bind = env_or("SYNTHETIC_ADAPTER_BIND", "0.0.0.0:9443");
    let require_store_ready = env_or("REQUIRE_STORE_READY", "false") == "true";
    let default_requeue = env_duration_secs("DEFAULT_REQUEUE_SECONDS", 30);
    let http_addr = env_or("HTTP_BIND_ADDRESS", "0.0.0.0:8080");

    let client = kube::Client::try_default().await?;

    let client_tls = load_client_tls(&client, &operator_namespace).await;
    let server_tls = load_server_tls();

    let state = State::default();
    let pool_metrics = Arc::new(PoolMetrics::register(state.registry())?);
    let pool = ConnectionPool::new(PoolConfig::default(), Some(pool_metrics));
    pool.spawn_maintenance();
    let client_metrics = Arc::new(ClientMetrics::register(state.registry())?);
    let fabric = Arc::new(FabricClientManager::new(
        pool,
        RetryPolicy::default(),
        CircuitBreakerConfig::default(),
        Some(client_metrics),
    ));

    let config = ControllerConfig {
        controller_class,
        synthetic_adapter_address,
        tls: client_tls,
        require_store_ready,
        default_requeue,
    };
    let ctx = state.to_context(client.clone(), fabric, config);

    let synthetic_adapter = run_synthetic_adapter(client.clone(), synthetic_adapter_bind, server_tls);

    let push_secret_controller = push_secret::run(client.clone(), ctx.clone());
    let cluster_push_secret_controller = cluster_push_secret::run(client.clone(), ctx.clone());
    let provider_controller = provider::run_provider(client.clone(), ctx.clone());
    let cluster_provider_controller = provider::run_cluster_provider(client.clone(), ctx.clone());

    let app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    let http_server = async {
        match tokio::net::TcpListener::bind(&http_addr).await {
            Ok(listener) => {
                info!("HTTP metrics/health server listening on {http_addr}");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    error!("HTTP server exited: {e}");
                }
            }
            Err(e) => error!("failed to bind HTTP server on {http_addr}: {e}"),
        }
    };

    tokio::join!(
        synthetic_adapter,
        push_secret_controller,
        cluster_push_secret_controller,
        provider_controller,
        cluster_provider_controller,
        http_server,
    );
    Ok(())
}
