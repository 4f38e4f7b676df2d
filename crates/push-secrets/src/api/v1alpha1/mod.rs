pub mod cluster_push_secret;
pub mod push_secret;

pub use cluster_push_secret::{ClusterPushSecret, ClusterPushSecretSpec, ClusterPushSecretStatus};
pub use push_secret::{PushSecret, PushSecretSpec, PushSecretStatus};
