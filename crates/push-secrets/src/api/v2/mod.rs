pub mod provider;

pub use provider::{
    AuthenticationScope, Capability, ClusterProvider, ClusterProviderSpec, ClusterProviderStatus,
    Provider, ProviderConfig, ProviderRef, ProviderSpec, ProviderStatus,
};
