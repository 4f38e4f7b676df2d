//! mTLS material for the provider gRPC transport, spec.md §6.
//!
//! The client side loads `ca.crt` / `client.crt` / `client.key` from a
//! Kubernetes Secret named `external-secrets-provider-tls` (mounted into the
//! operator pod); the server side reads the same three files from a
//! directory overridable via `TLS_CERT_DIR`/`TLS_CA_CERT_FILE`/
//! `TLS_CERT_FILE`/`TLS_KEY_FILE`.

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::errors::{FabricError, Result};

#[derive(Clone)]
pub struct MtlsMaterial {
    pub ca_cert_pem: Vec<u8>,
    pub client_cert_pem: Vec<u8>,
    pub client_key_pem: Vec<u8>,
}

impl MtlsMaterial {
    pub fn from_pem(ca_cert_pem: Vec<u8>, client_cert_pem: Vec<u8>, client_key_pem: Vec<u8>) -> Self {
        Self {
            ca_cert_pem,
            client_cert_pem,
            client_key_pem,
        }
    }

    /// Loads the three PEM files from `dir` (server-side directory layout:
    /// `ca.crt`, `tls.crt`, `tls.key` by default, overridable per spec.md §6).
    pub fn from_dir(dir: &std::path::Path, ca_file: &str, cert_file: &str, key_file: &str) -> Result<Self> {
        let read = |name: &str| -> Result<Vec<u8>> {
            std::fs::read(dir.join(name))
                .map_err(|e| FabricError::Tls(format!("reading {name}: {e}")))
        };
        Ok(Self {
            ca_cert_pem: read(ca_file)?,
            client_cert_pem: read(cert_file)?,
            client_key_pem: read(key_file)?,
        })
    }

    /// Builds a `ClientTlsConfig` for dialing `address`; `ServerName` is
    /// derived from the address host, matching spec.md §4.B's
    /// `ServerName = address host` requirement.
    pub fn client_tls_config(&self, address: &str) -> Result<ClientTlsConfig> {
        let domain = server_name_from_address(address);
        let ca = Certificate::from_pem(&self.ca_cert_pem);
        let identity = Identity::from_pem(&self.client_cert_pem, &self.client_key_pem);
        Ok(ClientTlsConfig::new()
            .ca_certificate(ca)
            .identity(identity)
            .domain_name(domain))
    }

    /// Builds a `ServerTlsConfig` for the synthetic adapter (spec.md §4.D,
    /// §6): setting `client_ca_root` makes tonic require and verify the
    /// client certificate, matching `RequireAndVerifyClientCert`.
    pub fn server_tls_config(&self) -> Result<ServerTlsConfig> {
        let ca = Certificate::from_pem(&self.ca_cert_pem);
        let identity = Identity::from_pem(&self.client_cert_pem, &self.client_key_pem);
        Ok(ServerTlsConfig::new().identity(identity).client_ca_root(ca))
    }
}

fn server_name_from_address(address: &str) -> String {
    let without_scheme = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    without_scheme
        .split(':')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_from_address() {
        assert_eq!(server_name_from_address("https://provider.ns.svc:8443"), "provider.ns.svc");
        assert_eq!(server_name_from_address("provider.ns.svc:8443"), "provider.ns.svc");
        assert_eq!(server_name_from_address("provider.ns.svc"), "provider.ns.svc");
    }
}
