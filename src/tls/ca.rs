//! Root certificate authority used to sign per-host certificates

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::{Certificate as RustlsCertificate, PrivateKey};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::config::MitmConfig;
use crate::error::{Error, Result};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A certificate issued for one intercepted host, ready for a TLS server config
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub host: String,
    /// Leaf first, then the signing root
    pub cert_chain: Vec<RustlsCertificate>,
    pub private_key: PrivateKey,
    pub created_at: DateTime<Utc>,
}

pub struct CertificateAuthority {
    cert: Certificate,
    // kept verbatim so clients trust exactly the certificate that was loaded or generated
    cert_pem: String,
    cert_der: Vec<u8>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Generate a fresh self-signed root
    pub fn generate(organization: &str, validity_days: u32) -> Result<Self> {
        info!("🔧 Generating root CA for {}", organization);

        let mut params = CertificateParams::default();
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, organization);
        distinguished_name.push(DnType::CommonName, format!("{} Root CA", organization));
        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = SystemTime::now();
        params.not_before = (now - DAY).into();
        params.not_after = (now + DAY * validity_days).into();

        let cert = Certificate::from_params(params)?;
        let cert_pem = cert.serialize_pem()?;
        Self::with_pem(cert, cert_pem)
    }

    /// Rebuild a root from its PEM certificate and PEM private key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)?;
        let cert = Certificate::from_params(params)?;
        Self::with_pem(cert, cert_pem.to_string())
    }

    fn with_pem(cert: Certificate, cert_pem: String) -> Result<Self> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("unreadable CA PEM: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Certificate("no certificate in CA PEM".to_string()))?;
        Ok(Self {
            cert,
            cert_pem,
            cert_der,
        })
    }

    /// Load the root from PEM files
    pub fn load<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        debug!("Loading root CA from {} and {}", cert_path.display(), key_path.display());

        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| Error::Certificate(format!("failed to read {}: {}", cert_path.display(), e)))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| Error::Certificate(format!("failed to read {}: {}", key_path.display(), e)))?;

        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        info!("📜 Loaded root CA from {}", cert_path.display());
        Ok(ca)
    }

    /// Write the root as PEM files, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, cert_path: P, key_path: P) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }
        fs::write(cert_path, &self.cert_pem)?;
        fs::write(key_path, self.cert.serialize_private_key_pem())?;

        info!("💾 Saved root CA certificate to {}", cert_path.display());
        info!("💾 Saved root CA private key to {}", key_path.display());
        Ok(())
    }

    /// Load the configured root, generating and saving one when allowed
    pub fn load_or_generate(config: &MitmConfig) -> Result<Self> {
        let files_exist = Path::new(&config.ca_cert_path).exists() && Path::new(&config.ca_key_path).exists();
        if files_exist {
            return Self::load(&config.ca_cert_path, &config.ca_key_path);
        }

        if !config.auto_generate_ca {
            return Err(Error::Certificate(format!(
                "root CA files not found: {} and {}. Enable auto_generate_ca or run `cert generate-ca`",
                config.ca_cert_path, config.ca_key_path
            )));
        }

        let ca = Self::generate(&config.organization, 3650)?;
        ca.save(&config.ca_cert_path, &config.ca_key_path)?;
        info!("✅ Generated new root CA, install {} in your clients' trust store", config.ca_cert_path);
        Ok(ca)
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Sign a leaf certificate for `host` (DNS name or IP literal)
    pub fn issue(&self, host: &str, validity_days: u32) -> Result<IssuedCertificate> {
        debug!("Signing certificate for {}", host);
        let ip = host.parse::<IpAddr>().ok();
        if ip.is_none() && !is_valid_dns_name(host) {
            return Err(Error::Certificate(format!("cannot issue a certificate for '{}'", host)));
        }

        let mut params = CertificateParams::default();
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host);
        params.distinguished_name = distinguished_name;
        params.subject_alt_names = match ip {
            Some(ip) => vec![SanType::IpAddress(ip)],
            None => vec![SanType::DnsName(host.to_string())],
        };
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = SystemTime::now();
        params.not_before = (now - DAY).into();
        params.not_after = (now + DAY * validity_days).into();

        let leaf = Certificate::from_params(params)?;
        let leaf_der = leaf.serialize_der_with_signer(&self.cert)?;

        Ok(IssuedCertificate {
            host: host.to_string(),
            cert_chain: vec![RustlsCertificate(leaf_der), RustlsCertificate(self.cert_der.clone())],
            private_key: PrivateKey(leaf.serialize_private_key_der()),
            created_at: Utc::now(),
        })
    }
}

/// Letters, digits, hyphens and underscores in non-empty dot-separated labels
fn is_valid_dns_name(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}
