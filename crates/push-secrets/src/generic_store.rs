//! The v1 `GenericStore` resolution surface, spec.md §4.C step 2 and §3
//! "Store (Namespace/Cluster)". Mirrors `provider_fabric::v1_contract`'s
//! `GenericStore` but carries the Kubernetes-native fields (conditions,
//! deletion timestamp) the reconciler needs that the gRPC-facing trait in
//! `provider-fabric` deliberately omits.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, LabelSelectorRequirement};
use kube::api::Api;
use kube::{Client, ResourceExt};
use regex::Regex;

use crate::api::v1beta1::{ClusterSecretStore, ClusterStoreCondition, SecretStore};
use provider_fabric::v1_contract::SecretStoreSpec as FabricSecretStoreSpec;

pub trait GenericStore: Send + Sync {
    fn kind(&self) -> &'static str;
    fn name(&self) -> String;
    fn namespace(&self) -> Option<String>;
    fn controller(&self) -> Option<String>;
    fn conditions(&self) -> &[Condition];
    fn ready(&self) -> bool {
        crate::util::status::is_status_condition_true(self.conditions(), "Ready")
    }
    fn cluster_conditions(&self) -> &[ClusterStoreCondition] {
        &[]
    }
    fn provider_kind(&self) -> String;
    fn provider_config(&self) -> serde_json::Value;

    fn to_fabric_spec(&self) -> FabricSecretStoreSpec {
        FabricSecretStoreSpec {
            provider_kind: self.provider_kind(),
            controller: self.controller(),
            config: self.provider_config(),
        }
    }
}

impl GenericStore for SecretStore {
    fn kind(&self) -> &'static str {
        "SecretStore"
    }
    fn name(&self) -> String {
        self.name_any()
    }
    fn namespace(&self) -> Option<String> {
        ResourceExt::namespace(self)
    }
    fn controller(&self) -> Option<String> {
        self.spec.controller.clone()
    }
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }
    fn provider_kind(&self) -> String {
        self.spec.provider.kind.clone()
    }
    fn provider_config(&self) -> serde_json::Value {
        self.spec.provider.config.clone()
    }
}

impl GenericStore for ClusterSecretStore {
    fn kind(&self) -> &'static str {
        "ClusterSecretStore"
    }
    fn name(&self) -> String {
        self.name_any()
    }
    fn namespace(&self) -> Option<String> {
        None
    }
    fn controller(&self) -> Option<String> {
        self.spec.controller.clone()
    }
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }
    fn cluster_conditions(&self) -> &[ClusterStoreCondition] {
        &self.spec.conditions
    }
    fn provider_kind(&self) -> String {
        self.spec.provider.kind.clone()
    }
    fn provider_config(&self) -> serde_json::Value {
        self.spec.provider.config.clone()
    }
}

/// Evaluates the disjunction of `conditions` against `namespace`, fetching
/// the namespace's labels lazily only if a condition names a
/// `namespaceSelector` (spec.md §4.C). An empty condition list admits every
/// namespace.
pub async fn namespace_admitted(client: &Client, conditions: &[ClusterStoreCondition], namespace: &str) -> bool {
    if conditions.is_empty() {
        return true;
    }

    let mut namespace_labels: Option<BTreeMap<String, String>> = None;

    for condition in conditions {
        if condition.namespaces.iter().any(|n| n == namespace) {
            return true;
        }
        if condition
            .namespace_regexes
            .iter()
            .any(|pattern| Regex::new(pattern).map(|re| re.is_match(namespace)).unwrap_or(false))
        {
            return true;
        }
        if let Some(selector) = &condition.namespace_selector {
            if namespace_labels.is_none() {
                namespace_labels = Api::<Namespace>::all(client.clone())
                    .get(namespace)
                    .await
                    .ok()
                    .map(|ns| ns.metadata.labels.unwrap_or_default());
            }
            if let Some(labels) = &namespace_labels {
                if label_selector_matches(selector, labels) {
                    return true;
                }
            }
        }
    }
    false
}

/// Evaluates a `LabelSelector` (matchLabels AND matchExpressions) against a
/// label set, per standard Kubernetes selector semantics.
pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            if !requirement_matches(expr, labels) {
                return false;
            }
        }
    }
    true
}

fn requirement_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    match expr.operator.as_str() {
        "In" => expr
            .values
            .as_ref()
            .map(|values| labels.get(&expr.key).is_some_and(|v| values.contains(v)))
            .unwrap_or(false),
        "NotIn" => expr
            .values
            .as_ref()
            .map(|values| !labels.get(&expr.key).is_some_and(|v| values.contains(v)))
            .unwrap_or(true),
        "Exists" => labels.contains_key(&expr.key),
        "DoesNotExist" => !labels.contains_key(&expr.key),
        _ => false,
    }
}
