//! Generator-state GC as an opaque façade, spec.md §1/§4.E step 5 and §9
//! "Generator state as a two-phase commit". Source resolution via a
//! generator stages state that is committed only when the overall
//! reconcile succeeds; any later failure rolls it back. The actual garbage
//! collection machinery behind `commit`/`rollback` is an external
//! collaborator — this façade only defines the transaction boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use provider_fabric::v1_contract::Generator;

#[async_trait]
pub trait GeneratorTransaction: Send + Sync {
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StateManager: Send + Sync {
    async fn stage(
        &self,
        generator: Arc<dyn Generator>,
        source_namespace: &str,
    ) -> anyhow::Result<(HashMap<String, Vec<u8>>, Box<dyn GeneratorTransaction>)>;
}

struct PendingTransaction {
    generator: Arc<dyn Generator>,
    source_namespace: String,
    state: Vec<u8>,
}

#[async_trait]
impl GeneratorTransaction for PendingTransaction {
    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        // State is retained by the external GC machinery; nothing to do here
        // beyond letting the staged generation stand.
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.generator.cleanup(&self.source_namespace, self.state).await
    }
}

/// The minimal implementation sufficient to drive the reconciler: stage
/// calls `Generator::generate`, and an unrolled-back transaction simply
/// leaves the generated state for the external GC sweep to reconcile.
#[derive(Default)]
pub struct DefaultStateManager;

#[async_trait]
impl StateManager for DefaultStateManager {
    async fn stage(
        &self,
        generator: Arc<dyn Generator>,
        source_namespace: &str,
    ) -> anyhow::Result<(HashMap<String, Vec<u8>>, Box<dyn GeneratorTransaction>)> {
        let (secrets, state) = generator.generate(source_namespace).await?;
        Ok((
            secrets,
            Box::new(PendingTransaction {
                generator,
                source_namespace: source_namespace.to_string(),
                state,
            }),
        ))
    }
}
