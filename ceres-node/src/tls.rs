//! TLS configurations for the three trust shapes a node uses.
//!
//! Trust is established per connection from the certificates embedded in
//! signed `NodeMeta` records; there is no shared root store. The server
//! always presents the node's own self-signed certificate; clients either
//! pin a single peer certificate (authenticated dial) or accept anything
//! (the one-shot bootstrap dial that fetches a `Meta` record).

use std::sync::Arc;

use crate::error::{NodeError, Result};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server-side TLS from the node's PEM certificate and private key.
pub(crate) fn tls_server_config(cert_pem: &str, key_pem: &str) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
        .ok_or_else(|| NodeError::InvalidArgument("no private key in PEM".into()))?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client-side TLS trusting exactly the certificates in `cert_pem` — the
/// root pool for dialing one peer is that peer's own embedded certificate.
pub fn tls_config_pinned(cert_pem: &str) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut cert_pem.as_bytes()) {
        roots.add(cert?)?;
    }
    if roots.is_empty() {
        return Err(NodeError::InvalidArgument(
            "no certificate in PEM bundle".into(),
        ));
    }

    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Client-side TLS accepting any certificate.
///
/// Only for the bootstrap dial: the fetched `NodeMeta` is validated by
/// signature afterwards and every later connection pins its cert.
pub fn tls_config_insecure() -> Result<Arc<rustls::ClientConfig>> {
    let mut config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoCertVerifier));
    Ok(Arc::new(config))
}

/// Accepts any server certificate during the bootstrap handshake.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn test_server_and_pinned_configs_from_generated_cert() {
        let key = crypto::generate_key();
        let (cert_pem, key_pem) =
            crypto::self_signed_cert(&key, "192.0.2.1".parse().unwrap()).unwrap();

        tls_server_config(&cert_pem, &key_pem).unwrap();
        tls_config_pinned(&cert_pem).unwrap();
    }

    #[test]
    fn test_pinned_config_rejects_empty_pem() {
        assert!(matches!(
            tls_config_pinned("no certs here"),
            Err(NodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_insecure_config_builds() {
        tls_config_insecure().unwrap();
    }
}
