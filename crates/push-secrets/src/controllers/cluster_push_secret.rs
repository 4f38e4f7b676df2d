//! Component F: the `ClusterPushSecret` control loop, spec.md §4.F. Fans a
//! single spec out into one `PushSecret` child per namespace selected by
//! `namespaceSelectors[]`, and GCs children when the selection or the
//! configured child name changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::{
    controller::{Action, Controller},
    watcher, WatchStreamExt,
};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{field, instrument, warn, Span};

use crate::api::v1alpha1::cluster_push_secret::{ClusterPushSecret, ClusterPushSecretStatus, FailedNamespace};
use crate::api::v1alpha1::push_secret::PushSecret;
use crate::controllers::Context;
use crate::generic_store::label_selector_matches;
use crate::util::errors::{Error, Result};
use crate::util::status::set_status_condition;
use crate::util::telemetry;

pub const FIELD_MANAGER: &str = "push-secrets-controller";
const OWNER_KIND: &str = "ClusterPushSecret";

fn child_name(cps: &ClusterPushSecret) -> String {
    cps.spec.push_secret_name.clone().unwrap_or_else(|| cps.name_any())
}

fn backoff_key(name: &str) -> String {
    format!("ClusterPushSecret//{name}")
}

/// True iff `meta` carries a controller owner reference naming this exact
/// `ClusterPushSecret` (spec.md §4.F step 5 "owned check", P6).
fn owned_by(push_secret: &PushSecret, cluster_name: &str) -> bool {
    push_secret
        .meta()
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|o| o.controller == Some(true) && o.kind == OWNER_KIND && o.name == cluster_name))
}

impl ClusterPushSecret {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let api: Api<ClusterPushSecret> = Api::all(ctx.client.clone());
        let status = self.status.clone().unwrap_or_default();
        let new_child_name = child_name(self);

        // step 2: the projected child name changed; delete the old children.
        if let Some(prev_name) = &status.push_secret_name {
            if *prev_name != new_child_name {
                for ns in &status.provisioned_namespaces {
                    self.delete_if_owned(&ctx, ns, prev_name).await;
                }
            }
        }

        let target_namespaces = self.resolve_target_namespaces(&ctx).await?;

        // step 4: namespace fell out of the selector set.
        for ns in &status.provisioned_namespaces {
            if !target_namespaces.contains(ns) {
                self.delete_if_owned(&ctx, ns, &new_child_name).await;
            }
        }

        // step 5: create-or-update every selected namespace.
        let mut provisioned = Vec::new();
        let mut failed = Vec::new();
        for ns in &target_namespaces {
            let child_api: Api<PushSecret> = Api::namespaced(ctx.client.clone(), ns);
            match child_api.get(&new_child_name).await {
                Ok(existing) if !owned_by(&existing, &name) => {
                    failed.push(FailedNamespace { namespace: ns.clone(), reason: "push secret already exists in namespace".to_string() });
                    continue;
                }
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => {
                    failed.push(FailedNamespace { namespace: ns.clone(), reason: e.to_string() });
                    continue;
                }
            }

            let patch = self.desired_child_patch(&new_child_name, ns);
            match child_api.patch(&new_child_name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(patch)).await {
                Ok(_) => provisioned.push(ns.clone()),
                Err(e) => failed.push(FailedNamespace { namespace: ns.clone(), reason: e.to_string() }),
            }
        }

        provisioned.sort();
        failed.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        let ready = failed.is_empty();

        self.patch_status(&api, &ctx, ready, new_child_name, provisioned, failed).await?;
        ctx.metrics.set_condition("", &name, "Ready", ready);
        if ready {
            ctx.reset_backoff(&backoff_key(&name));
        }

        let requeue_secs = if self.spec.refresh_interval_seconds > 0 { self.spec.refresh_interval_seconds } else { 3600 };
        Ok(Action::requeue(Duration::from_secs(requeue_secs)))
    }

    async fn delete_if_owned(&self, ctx: &Context, namespace: &str, child: &str) {
        let api: Api<PushSecret> = Api::namespaced(ctx.client.clone(), namespace);
        match api.get(child).await {
            Ok(existing) if owned_by(&existing, &self.name_any()) => {
                if let Err(e) = api.delete(child, &Default::default()).await {
                    warn!("failed to delete owned child {child} in {namespace}: {e}");
                }
            }
            Ok(_) | Err(kube::Error::Api(_)) => {}
            Err(e) => warn!("failed to fetch child {child} in {namespace} for GC: {e}"),
        }
    }

    /// Step 3: the disjunction of `namespaceSelectors[]` over every cluster
    /// namespace. An empty selector list selects nothing, matching the
    /// standard Kubernetes convention that admitting everything requires an
    /// explicit (possibly empty) `LabelSelector{}` entry.
    async fn resolve_target_namespaces(&self, ctx: &Context) -> Result<BTreeSet<String>> {
        let api: Api<Namespace> = Api::all(ctx.client.clone());
        let namespaces = api.list(&ListParams::default()).await.map_err(Error::from)?;
        let mut out = BTreeSet::new();
        for ns in namespaces.items {
            let labels = ns.metadata.labels.clone().unwrap_or_default();
            if self.spec.namespace_selectors.iter().any(|sel| label_selector_matches(sel, &labels)) {
                out.insert(ns.name_any());
            }
        }
        Ok(out)
    }

    fn desired_child_patch(&self, child_name: &str, namespace: &str) -> serde_json::Value {
        let owner = self.controller_owner_ref(&());
        json!({
            "apiVersion": "externalsecrets.io/v1alpha1",
            "kind": "PushSecret",
            "metadata": {
                "name": child_name,
                "namespace": namespace,
                "labels": self.spec.push_secret_metadata.labels,
                "annotations": self.spec.push_secret_metadata.annotations,
                "ownerReferences": owner.map(|o| vec![o]).unwrap_or_default(),
            },
            "spec": self.spec.push_secret_spec,
        })
    }

    async fn patch_status(
        &self,
        api: &Api<ClusterPushSecret>,
        ctx: &Context,
        ready: bool,
        push_secret_name: String,
        provisioned: Vec<String>,
        failed: Vec<FailedNamespace>,
    ) -> Result<()> {
        let mut status: ClusterPushSecretStatus = self.status.clone().unwrap_or_default();
        let (conditions, _) = set_status_condition(
            &status.conditions,
            Condition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                reason: if ready { "Provisioned" } else { "NamespaceFailures" }.to_string(),
                message: if ready { "all namespaces provisioned".to_string() } else { "one or more namespaces failed".to_string() },
                observed_generation: self.meta().generation,
                last_transition_time: Time(Utc::now()),
            },
        );
        status.conditions = conditions;
        status.push_secret_name = Some(push_secret_name);
        status.provisioned_namespaces = provisioned;
        status.failed_namespaces = failed;

        match api
            .patch_status(
                &self.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(json!({ "apiVersion": "externalsecrets.io/v1alpha1", "kind": "ClusterPushSecret", "status": status })),
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

#[instrument(skip(ctx, cps), fields(trace_id))]
pub async fn reconcile(cps: Arc<ClusterPushSecret>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure("cluster_push_secret");
    ctx.diagnostics.write().await.last_event = Utc::now();
    cps.reconcile(ctx).await
}

fn error_policy(cps: Arc<ClusterPushSecret>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("cluster push secret reconcile failed for {}: {error:?}", cps.name_any());
    ctx.metrics.reconcile_failure("", &cps.name_any(), error);
    Action::requeue(ctx.next_backoff(&backoff_key(&cps.name_any())))
}

pub async fn run(client: kube::Client, ctx: Arc<Context>) {
    let api = Api::<ClusterPushSecret>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        tracing::error!("ClusterPushSecret CRD is not queryable: {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // Namespace-change watch (spec.md §4.F): re-enqueues every
    // ClusterPushSecret whenever any namespace is created, updated, or
    // deleted, since a cluster object's own selectors aren't known to this
    // trigger stream — the reconciler itself re-evaluates them each pass.
    let namespace_trigger = watcher(Api::<Namespace>::all(client.clone()), watcher::Config::default())
        .touched_objects()
        .filter_map(|r| async move { r.ok() })
        .map(|_| ());

    Controller::new(api, watcher::Config::default())
        .owns(Api::<PushSecret>::all(client.clone()), watcher::Config::default())
        .reconcile_all_on(namespace_trigger)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
