use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::conditions_schema;
use crate::api::v1alpha1::push_secret::PushSecretSpec;

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct PushSecretMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ClusterPushSecret",
    group = "externalsecrets.io",
    version = "v1alpha1"
)]
#[kube(status = "ClusterPushSecretStatus", shortname = "cps")]
pub struct ClusterPushSecretSpec {
    #[serde(default)]
    pub namespace_selectors: Vec<LabelSelector>,
    pub push_secret_spec: PushSecretSpec,
    #[serde(default)]
    pub push_secret_name: Option<String>,
    #[serde(default)]
    pub push_secret_metadata: PushSecretMetadata,
    #[serde(default)]
    pub refresh_interval_seconds: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct FailedNamespace {
    pub namespace: String,
    pub reason: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ClusterPushSecretStatus {
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub push_secret_name: Option<String>,
    #[serde(default)]
    pub provisioned_namespaces: Vec<String>,
    #[serde(default)]
    pub failed_namespaces: Vec<FailedNamespace>,
}
