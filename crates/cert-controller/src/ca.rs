//! Self-signing for the CRD conversion-webhook CA bundle, spec.md §2
//! component I. One process-lifetime CA signs one leaf certificate for the
//! conversion-webhook service; both are regenerated from scratch on every
//! restart, which is safe because `injector` re-patches every CRD's
//! `caBundle` on its next tick regardless of whether the bundle changed.

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

pub struct IssuedCa {
    pub ca_cert_pem: String,
    pub leaf_cert_der: CertificateDer<'static>,
    pub leaf_key_der: PrivatePkcs8KeyDer<'static>,
}

/// Issues a CA and a leaf certificate for `service_dns_names` (the webhook
/// Service's in-cluster DNS names, e.g. `push-secrets-webhook.push-secrets-system.svc`).
pub fn issue(service_dns_names: &[String]) -> anyhow::Result<IssuedCa> {
    let mut ca_params = CertificateParams::new(Vec::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(DnType::CommonName, "push-secrets-webhook-ca");
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut leaf_params = CertificateParams::new(
        service_dns_names.iter().map(|n| SanType::DnsName(n.clone().try_into().unwrap())).collect::<Vec<_>>(),
    )?;
    leaf_params.distinguished_name.push(
        DnType::CommonName,
        service_dns_names.first().cloned().unwrap_or_else(|| "push-secrets-webhook".to_string()),
    );
    let leaf_key = KeyPair::generate()?;
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

    Ok(IssuedCa {
        ca_cert_pem: ca_cert.pem(),
        leaf_cert_der: CertificateDer::from(leaf_cert.der().to_vec()),
        leaf_key_der: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
    })
}
