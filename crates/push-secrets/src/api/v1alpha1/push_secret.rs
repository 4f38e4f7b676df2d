use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::conditions_schema;

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum UpdatePolicy {
    #[default]
    Replace,
    IfNotExists,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum DeletionPolicy {
    #[default]
    None,
    Delete,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub enum StoreKind {
    NamespaceStore,
    ClusterStore,
    Provider,
    ClusterProvider,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct StoreRef {
    pub name: Option<String>,
    pub kind: StoreKind,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct SecretBySelector {
    pub label_selector: LabelSelector,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct GeneratorRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct SourceSelector {
    pub secret_by_name: Option<String>,
    pub secret_by_selector: Option<SecretBySelector>,
    pub generator_ref: Option<GeneratorRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct DataEntry {
    pub source_key: String,
    pub remote_key: String,
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub conversion_strategy: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct RegexRewrite {
    pub source: String,
    pub target: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct TransformRewrite {
    pub template: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub enum Rewrite {
    Regexp(RegexRewrite),
    Transform(TransformRewrite),
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct MatchSelector {
    #[serde(default)]
    pub regex: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct DataToEntry {
    pub store_ref: StoreRef,
    #[serde(default)]
    #[serde(rename = "match")]
    pub match_: Option<MatchSelector>,
    #[serde(default)]
    pub rewrites: Vec<Rewrite>,
    #[serde(default)]
    pub conversion_strategy: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct TemplateFromRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct SecretTemplate {
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub template_from: Vec<TemplateFromRef>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "PushSecret",
    group = "externalsecrets.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "PushSecretStatus", shortname = "pushsecret")]
pub struct PushSecretSpec {
    #[serde(default)]
    pub selector: SourceSelector,
    #[serde(default)]
    pub data: Vec<DataEntry>,
    #[serde(default)]
    pub data_from: Vec<DataToEntry>,
    pub store_refs: Vec<StoreRef>,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// Seconds; `0` means "do not refresh on a time basis".
    #[serde(default)]
    pub refresh_interval_seconds: u64,
    #[serde(default)]
    pub template: Option<SecretTemplate>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub struct SyncedPushSecretEntry {
    pub source_key: String,
    pub remote_key: String,
    #[serde(default)]
    pub property: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct PushSecretStatus {
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// `"Kind/Name" -> statusRef -> dataEntry`.
    #[serde(default)]
    pub synced_push_secrets: BTreeMap<String, BTreeMap<String, SyncedPushSecretEntry>>,
    #[serde(default)]
    pub synced_resource_version: String,
    pub refresh_time: Option<Time>,
}
