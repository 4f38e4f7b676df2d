use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::conditions_schema;

/// Opaque discriminant + config blob for a v1 backend; concrete provider
/// implementations are an external collaborator (spec.md §1).
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct StoreProviderConfig {
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "SecretStore",
    group = "externalsecrets.io",
    version = "v1beta1",
    namespaced
)]
#[kube(status = "SecretStoreStatus", shortname = "ss")]
pub struct SecretStoreSpec {
    #[serde(default)]
    pub controller: Option<String>,
    pub provider: StoreProviderConfig,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct SecretStoreStatus {
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A namespace-admission disjunct: a literal namespace, a regex, or a label
/// selector evaluated against the candidate namespace's labels. A namespace
/// is admitted by a condition iff any one of the three matches (spec.md
/// §4.C); a store with no conditions at all admits every namespace.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ClusterStoreCondition {
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub namespace_regexes: Vec<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "ClusterSecretStore", group = "externalsecrets.io", version = "v1beta1")]
#[kube(status = "ClusterSecretStoreStatus", shortname = "css")]
pub struct ClusterSecretStoreSpec {
    #[serde(default)]
    pub controller: Option<String>,
    pub provider: StoreProviderConfig,
    #[serde(default)]
    pub conditions: Vec<ClusterStoreCondition>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ClusterSecretStoreStatus {
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
