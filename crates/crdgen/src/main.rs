use kube::CustomResourceExt as _;
use push_secrets::api::v1alpha1::{ClusterPushSecret, PushSecret};
use push_secrets::api::v1beta1::{ClusterSecretStore, SecretStore};
use push_secrets::api::v2::{ClusterProvider, Provider};

fn main() {
    print!("{}", serde_yaml::to_string(&PushSecret::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&ClusterPushSecret::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&SecretStore::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&ClusterSecretStore::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&Provider::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&ClusterProvider::crd()).unwrap());
}
