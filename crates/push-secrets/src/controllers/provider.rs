//! Component G: the `Provider`/`ClusterProvider` reconcilers, spec.md §4.G.
//! Both are read-only validation passes over the same dial path the
//! `PushSecret` reconciler uses (`ClientManager::get`); neither owns
//! children nor carries a finalizer.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::{
    controller::{Action, Controller},
    watcher,
};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{field, instrument, warn, Span};

use crate::api::v2::{Capability, ClusterProvider, ClusterProviderStatus, Provider, ProviderStatus};
use crate::client_manager::ActiveStore;
use crate::controllers::Context;
use crate::util::errors::{Error, Result, StdError};
use crate::util::status::set_status_condition;
use crate::util::telemetry;

pub const FIELD_MANAGER: &str = "push-secrets-controller";

/// Step 3/4: maps a `CapabilitiesResponse` to the status enum; a failed RPC
/// is non-fatal and defaults to the most conservative capability.
fn map_capability(response: Result<provider_fabric::pb::CapabilitiesResponse, Error>) -> Capability {
    match response {
        Ok(r) => match r.capability() {
            provider_fabric::pb::Capability::ReadOnly => Capability::ReadOnly,
            provider_fabric::pb::Capability::WriteOnly => Capability::WriteOnly,
            provider_fabric::pb::Capability::ReadWrite => Capability::ReadWrite,
        },
        Err(_) => Capability::ReadOnly,
    }
}

impl Provider {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let namespace = self.namespace().expect("Provider is namespace-scoped");
        let name = self.name_any();
        let api: Api<Provider> = Api::namespaced(ctx.client.clone(), &namespace);
        let store = ActiveStore::Provider(self.clone());

        let client = match ctx.client_manager().get(&store, &namespace).await {
            Ok(client) => client,
            Err(e) => {
                self.patch_status(&api, &ctx, false, None, &e.to_string()).await?;
                ctx.metrics.set_condition(&namespace, &name, "Ready", false);
                return Err(e);
            }
        };

        if let Err(e) = client.validate().await {
            let message = format!("validation failed: {e}");
            self.patch_status(&api, &ctx, false, None, &message).await?;
            ctx.metrics.set_condition(&namespace, &name, "Ready", false);
            return Err(Error::StdError(StdError::ValidationFailed(message)));
        }

        let capability = map_capability(client.capabilities().await.map_err(Error::from));
        self.patch_status(&api, &ctx, true, Some(capability), "validated").await?;
        ctx.metrics.set_condition(&namespace, &name, "Ready", true);
        ctx.reset_backoff(&format!("Provider/{namespace}/{name}"));
        Ok(Action::requeue(ctx.config.default_requeue))
    }

    async fn patch_status(&self, api: &Api<Provider>, ctx: &Context, ready: bool, capability: Option<Capability>, message: &str) -> Result<()> {
        let mut status: ProviderStatus = self.status.clone().unwrap_or_default();
        let (conditions, _) = set_status_condition(
            &status.conditions,
            Condition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                reason: if ready { "Validated" } else { "ValidationFailed" }.to_string(),
                message: message.to_string(),
                observed_generation: self.meta().generation,
                last_transition_time: Time(Utc::now()),
            },
        );
        status.conditions = conditions;
        if capability.is_some() {
            status.capabilities = capability;
        }

        match api
            .patch_status(
                &self.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(json!({ "apiVersion": "externalsecrets.io/v2", "kind": "Provider", "status": status })),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                ctx.metrics.remove_resource(&self.namespace().unwrap_or_default(), &self.name_any());
                Ok(())
            }
            Err(e) => Err(Error::from(e)),
        }
    }
}

impl ClusterProvider {
    /// Validation is skipped because the manifest namespace isn't known yet
    /// (spec.md §4.G, last paragraph); only capabilities are fetched, with
    /// an empty source namespace, and a failure there is deferred rather
    /// than treated as unready.
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let api: Api<ClusterProvider> = Api::all(ctx.client.clone());
        let store = ActiveStore::ClusterProvider(self.clone());

        let capability = match ctx.client_manager().get(&store, "").await {
            Ok(client) => map_capability(client.capabilities().await.map_err(Error::from)),
            Err(_) => Capability::ReadOnly,
        };

        self.patch_status(&api, &ctx, Some(capability)).await?;
        ctx.metrics.set_condition("", &name, "Ready", true);
        ctx.reset_backoff(&format!("ClusterProvider//{name}"));
        Ok(Action::requeue(ctx.config.default_requeue))
    }

    async fn patch_status(&self, api: &Api<ClusterProvider>, ctx: &Context, capability: Option<Capability>) -> Result<()> {
        let mut status: ClusterProviderStatus = self.status.clone().unwrap_or_default();
        let (conditions, _) = set_status_condition(
            &status.conditions,
            Condition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                reason: "Validated".to_string(),
                message: "capabilities probed; runtime errors deferred to usage".to_string(),
                observed_generation: self.meta().generation,
                last_transition_time: Time(Utc::now()),
            },
        );
        status.conditions = conditions;
        if capability.is_some() {
            status.capabilities = capability;
        }

        match api
            .patch_status(
                &self.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(json!({ "apiVersion": "externalsecrets.io/v2", "kind": "ClusterProvider", "status": status })),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                ctx.metrics.remove_resource("", &self.name_any());
                Ok(())
            }
            Err(e) => Err(Error::from(e)),
        }
    }
}

#[instrument(skip(ctx, provider), fields(trace_id))]
pub async fn reconcile_provider(provider: Arc<Provider>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure("provider");
    ctx.diagnostics.write().await.last_event = Utc::now();
    provider.reconcile(ctx).await
}

fn error_policy_provider(provider: Arc<Provider>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("provider reconcile failed for {}: {error:?}", provider.name_any());
    let namespace = provider.namespace().unwrap_or_default();
    ctx.metrics.reconcile_failure(&namespace, &provider.name_any(), error);
    Action::requeue(ctx.next_backoff(&format!("Provider/{namespace}/{}", provider.name_any())))
}

#[instrument(skip(ctx, provider), fields(trace_id))]
pub async fn reconcile_cluster_provider(provider: Arc<ClusterProvider>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure("cluster_provider");
    ctx.diagnostics.write().await.last_event = Utc::now();
    provider.reconcile(ctx).await
}

fn error_policy_cluster_provider(provider: Arc<ClusterProvider>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("cluster provider reconcile failed for {}: {error:?}", provider.name_any());
    ctx.metrics.reconcile_failure("", &provider.name_any(), error);
    Action::requeue(ctx.config.default_requeue)
}

pub async fn run_provider(client: kube::Client, ctx: Arc<Context>) {
    let api = Api::<Provider>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        tracing::error!("Provider CRD is not queryable: {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_provider, error_policy_provider, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

pub async fn run_cluster_provider(client: kube::Client, ctx: Arc<Context>) {
    let api = Api::<ClusterProvider>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        tracing::error!("ClusterProvider CRD is not queryable: {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_cluster_provider, error_policy_cluster_provider, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
