pub mod v1alpha1;
pub mod v1beta1;
pub mod v2;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

pub static FINALIZER: &str = "pushsecret.externalsecrets.io/finalizer";

/// `schemars` schema override for a Kubernetes-standard conditions list
/// (`x-kubernetes-list-type: map`), shared by every CRD's status type.
pub fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    }))
    .unwrap()
}

pub fn empty_conditions() -> Vec<Condition> {
    Vec::new()
}
