//! Component I: the CRD conversion-webhook cert controller, spec.md §2.
//! A leaf module, deliberately decoupled from the PushSecret/Provider
//! reconcilers (spec.md §1): it self-signs a CA, serves the conversion
//! webhook endpoint over the resulting leaf certificate, and periodically
//! re-injects the CA's PEM as every managed CRD's `caBundle`.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, routing::post, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use rustls::ServerConfig;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

mod ca;
mod injector;

const WEBHOOK_PORT: u16 = 8443;
const HEALTH_PORT: u16 = 8080;
const REINJECT_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider()).ok();

    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let service_name = std::env::var("WEBHOOK_SERVICE_NAME").unwrap_or_else(|_| "push-secrets-webhook".to_string());
    let service_namespace = std::env::var("WEBHOOK_SERVICE_NAMESPACE").unwrap_or_else(|_| "push-secrets-system".to_string());
    let dns_names = vec![
        format!("{service_name}.{service_namespace}.svc"),
        format!("{service_name}.{service_namespace}.svc.cluster.local"),
    ];

    let issued = ca::issue(&dns_names)?;
    info!("issued self-signed CA for conversion webhook service {service_name}.{service_namespace}");

    let client = Client::try_default().await?;

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![issued.leaf_cert_der], issued.leaf_key_der.into())?;
    let rustls_config = RustlsConfig::from_config(Arc::new(tls_config));

    tokio::spawn(run_injection_loop(client, issued.ca_cert_pem.clone()));
    tokio::spawn(run_health_server());

    let app = Router::new().route("/convert", post(convert_handler)).layer(TraceLayer::new_for_http());
    info!("conversion webhook listening on 0.0.0.0:{WEBHOOK_PORT} (HTTPS)");
    axum_server::bind_rustls(format!("0.0.0.0:{WEBHOOK_PORT}").parse()?, rustls_config)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn run_injection_loop(client: Client, ca_cert_pem: String) {
    let mut ticker = tokio::time::interval(REINJECT_INTERVAL);
    loop {
        ticker.tick().await;
        match injector::reconcile_once(&client, &ca_cert_pem).await {
            Ok(n) if n > 0 => info!("re-injected CA bundle into {n} CRD(s)"),
            Ok(_) => {}
            Err(e) => warn!("CA bundle injection pass failed: {e}"),
        }
    }
}

async fn run_health_server() {
    let app = Router::new().route("/healthz", get(|| async { "ok" }));
    match tokio::net::TcpListener::bind(format!("0.0.0.0:{HEALTH_PORT}")).await {
        Ok(listener) => {
            info!("health server listening on 0.0.0.0:{HEALTH_PORT}");
            if let Err(e) = axum::serve(listener, app).await {
                error!("health server exited: {e}");
            }
        }
        Err(e) => error!("failed to bind health server: {e}"),
    }
}

/// `ConversionReview` is a schemaless passthrough here: every version this
/// operator serves (`v1alpha1`, `v1beta1`, `v2`) differs only in additive
/// fields, so identity conversion (copy each object's `apiVersion` from the
/// request's `desiredAPIVersion`, leave the rest untouched) is correct.
/// Real structural conversion, if a future version needs it, is out of
/// scope for this leaf module (spec.md §1).
async fn convert_handler(Json(review): Json<Value>) -> Json<Value> {
    let desired_api_version = review
        .pointer("/request/desiredAPIVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let uid = review.pointer("/request/uid").cloned().unwrap_or(Value::Null);
    let objects = review.pointer("/request/objects").and_then(Value::as_array).cloned().unwrap_or_default();

    let converted: Vec<Value> = objects
        .into_iter()
        .map(|mut obj| {
            if let Some(map) = obj.as_object_mut() {
                map.insert("apiVersion".to_string(), Value::String(desired_api_version.clone()));
            }
            obj
        })
        .collect();

    Json(serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "ConversionReview",
        "response": {
            "uid": uid,
            "result": { "status": "Success" },
            "convertedObjects": converted,
        }
    }))
}
