pub mod secret_store;

pub use secret_store::{
    ClusterSecretStore, ClusterSecretStoreSpec, ClusterSecretStoreStatus, ClusterStoreCondition,
    SecretStore, SecretStoreSpec, SecretStoreStatus, StoreProviderConfig,
};
