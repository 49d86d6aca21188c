//! rustls configurations for both sides of an intercepted connection

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ca::IssuedCertificate;
use crate::config::MitmConfig;
use crate::error::{Error, Result};

/// Server config presenting `issued` to the intercepted client.
///
/// Only HTTP/1.1 is offered through ALPN since decrypted traffic goes through the
/// HTTP/1.1 codec.
pub fn create_server_config(issued: &IssuedCertificate) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(issued.cert_chain.clone(), issued.private_key.clone())?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Client config for TLS connections to real origins
pub fn create_client_config(mitm: &MitmConfig) -> Result<Arc<ClientConfig>> {
    debug!("Creating TLS client configuration");

    if mitm.skip_upstream_cert_verify {
        warn!("⚠️  WARNING: Skipping upstream certificate verification (insecure)");
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAllCertVerifier))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    let mut root_store = RootCertStore::empty();
    add_system_root_certificates(&mut root_store);

    if let Some(root_ca_path) = &mitm.upstream_root_ca_path {
        add_custom_root_ca(&mut root_store, root_ca_path)?;
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    info!("✅ TLS client configuration created");
    Ok(Arc::new(config))
}

/// Add system root certificates to the root store
fn add_system_root_certificates(root_store: &mut RootCertStore) {
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let mut added = 0;
            let mut failed = 0;

            for cert_der in certs {
                match root_store.add(&Certificate(cert_der.to_vec())) {
                    Ok(_) => added += 1,
                    Err(_) => failed += 1,
                }
            }

            debug!("Root certificate store: {} added, {} failed", added, failed);
        }
        Err(e) => {
            // proxy still works for origins covered by a custom root
            warn!("⚠️  Could not load system root certificates: {}", e);
        }
    }
}

/// Add every certificate of a PEM file to the root store
pub fn add_custom_root_ca(root_store: &mut RootCertStore, root_ca_path: &str) -> Result<()> {
    debug!("Loading custom root CA certificate from {}", root_ca_path);

    let pem = std::fs::read(root_ca_path)
        .map_err(|e| Error::Certificate(format!("failed to read {}: {}", root_ca_path, e)))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .map_err(|e| Error::Certificate(format!("invalid PEM in {}: {}", root_ca_path, e)))?;
    if certs.is_empty() {
        return Err(Error::Certificate(format!("no certificates in {}", root_ca_path)));
    }

    for der in certs {
        root_store
            .add(&Certificate(der))
            .map_err(|e| Error::Certificate(format!("rejected root in {}: {:?}", root_ca_path, e)))?;
    }

    info!("✅ Custom root CA certificate added to trust store");
    info!("   Certificate: {}", root_ca_path);
    Ok(())
}

/// Certificate verifier that accepts every upstream certificate
pub struct AcceptAllCertVerifier;

impl ServerCertVerifier for AcceptAllCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::CertificateAuthority;

    #[test]
    fn test_server_config_offers_http11_only() {
        let ca = CertificateAuthority::generate("Config Test", 30).unwrap();
        let issued = ca.issue("alpn.test", 30).unwrap();
        let config = create_server_config(&issued).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_custom_root_is_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::generate("Root Test", 30).unwrap();
        let cert_path = dir.path().join("root.crt");
        std::fs::write(&cert_path, ca.cert_pem()).unwrap();

        let mut store = RootCertStore::empty();
        add_custom_root_ca(&mut store, cert_path.to_str().unwrap()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_missing_custom_root_is_an_error() {
        let mut store = RootCertStore::empty();
        assert!(add_custom_root_ca(&mut store, "/nonexistent/root.pem").is_err());
    }
}
