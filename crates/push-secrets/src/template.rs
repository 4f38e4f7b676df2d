//! `spec.template` façade, spec.md §4.E step 8. Template engines are an
//! external collaborator (spec.md §1, "invoked as `execute(data,
//! targets)`"); this crate only defines the call boundary and a passthrough
//! default so the reconciler builds and runs without one wired in.

use std::collections::BTreeMap;

use crate::api::v1alpha1::push_secret::SecretTemplate;

pub trait TemplateEngine: Send + Sync {
    fn execute(&self, data: &BTreeMap<String, Vec<u8>>, target: &SecretTemplate) -> anyhow::Result<BTreeMap<String, Vec<u8>>>;
}

/// Returns `data` unchanged; used when no template engine is wired in.
#[derive(Default)]
pub struct PassthroughTemplateEngine;

impl TemplateEngine for PassthroughTemplateEngine {
    fn execute(&self, data: &BTreeMap<String, Vec<u8>>, _target: &SecretTemplate) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
        Ok(data.clone())
    }
}
