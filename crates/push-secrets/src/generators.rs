//! `generatorRef` kind registry, spec.md §4.E step 5. Concrete generator
//! plugins are an external collaborator (spec.md §1, "individual concrete
//! backend implementations"); this mirrors `provider_fabric::synthetic`'s
//! `ProviderMapping` pattern — a compile-time-closed registry keyed by
//! `kind`, populated by the binary crate at startup (spec.md §9 "Dynamic
//! kind dispatch").

use std::collections::HashMap;
use std::sync::Arc;

use provider_fabric::v1_contract::Generator;

use crate::api::v1alpha1::push_secret::GeneratorRef;

type Factory = Arc<dyn Fn(&GeneratorRef) -> Arc<dyn Generator> + Send + Sync>;

#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    factories: HashMap<String, Factory>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&GeneratorRef) -> Arc<dyn Generator> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn resolve(&self, generator_ref: &GeneratorRef) -> Option<Arc<dyn Generator>> {
        self.factories.get(&generator_ref.kind).map(|factory| factory(generator_ref))
    }
}
