use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::conditions_schema;
use crate::api::v1beta1::secret_store::ClusterStoreCondition;

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ProviderRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ProviderConfig {
    pub address: String,
    pub provider_ref: ProviderRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub enum Capability {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "Provider", group = "externalsecrets.io", version = "v2", namespaced)]
#[kube(status = "ProviderStatus", shortname = "esp")]
pub struct ProviderSpec {
    pub config: ProviderConfig,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ProviderStatus {
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub capabilities: Option<Capability>,
}

/// Which namespace's credentials authenticate to the backend: the
/// manifest's own namespace, or the provider object's configured namespace
/// (spec.md glossary: "Auth namespace (ClusterProvider)").
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum AuthenticationScope {
    #[default]
    ManifestNamespace,
    ProviderNamespace,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "ClusterProvider", group = "externalsecrets.io", version = "v2")]
#[kube(status = "ClusterProviderStatus", shortname = "ecp")]
pub struct ClusterProviderSpec {
    pub config: ProviderConfig,
    #[serde(default)]
    pub authentication_scope: AuthenticationScope,
    #[serde(default)]
    pub conditions: Vec<ClusterStoreCondition>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ClusterProviderStatus {
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub capabilities: Option<Capability>,
}
