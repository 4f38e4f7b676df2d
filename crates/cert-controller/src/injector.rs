//! CA-bundle injection into CRD conversion webhooks, spec.md §2 component I.
//!
//! Runs as a ticker rather than a watch: the set of CRDs this controller
//! cares about is small and fixed (the `externalsecrets.io` group), and a
//! missed patch self-heals on the next tick.

use base64::Engine;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{info, warn};

pub const FIELD_MANAGER: &str = "push-secrets-cert-controller";

/// CRDs whose `spec.group` matches are candidates; only those that already
/// declare a webhook conversion strategy are patched — a CRD converted via
/// `None` strategy has no `caBundle` field to set.
const MANAGED_GROUP: &str = "externalsecrets.io";

pub async fn reconcile_once(client: &Client, ca_cert_pem: &str) -> anyhow::Result<usize> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crds = api.list(&Default::default()).await?;
    let ca_bundle = base64::engine::general_purpose::STANDARD.encode(ca_cert_pem.as_bytes());

    let mut patched = 0;
    for crd in crds.items {
        if crd.spec.group != MANAGED_GROUP {
            continue;
        }
        let Some(conversion) = &crd.spec.conversion else { continue };
        if conversion.strategy != "Webhook" {
            continue;
        }
        let Some(webhook) = &conversion.webhook else { continue };
        let current = webhook.client_config.as_ref().and_then(|c| c.ca_bundle.as_ref());
        if current.is_some_and(|c| c.0 == ca_cert_pem.as_bytes()) {
            continue;
        }

        let name = crd.metadata.name.clone().unwrap_or_default();
        let patch = serde_json::json!({
            "spec": {
                "conversion": {
                    "strategy": "Webhook",
                    "webhook": {
                        "clientConfig": { "caBundle": ca_bundle },
                    },
                },
            },
        });
        match api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(patch)).await {
            Ok(_) => {
                info!("injected CA bundle into CRD {name}");
                patched += 1;
            }
            Err(e) => warn!("failed to patch CRD {name}: {e}"),
        }
    }
    Ok(patched)
}
