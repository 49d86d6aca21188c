//! Certificate management CLI commands

use crate::tls::CertificateAuthority;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

#[derive(Debug, Subcommand)]
pub enum CertCommand {
    /// Generate a root CA for HTTPS interception
    #[command(name = "generate-ca")]
    GenerateCa(GenerateCaArgs),

    /// Inspect certificate details
    Inspect(InspectCertArgs),
}

#[derive(Debug, Args)]
pub struct GenerateCaArgs {
    /// Organization name for the root certificate
    #[arg(long, default_value = "Rust Intercept Proxy")]
    pub organization: String,

    /// Certificate validity period in days
    #[arg(long, default_value = "3650")]
    pub validity_days: u32,

    /// Output path for certificate file
    #[arg(long, default_value = "ca-certs/rootCA.crt")]
    pub cert_path: String,

    /// Output path for private key file
    #[arg(long, default_value = "ca-certs/rootCA.key")]
    pub key_path: String,

    /// Force overwrite existing certificates
    #[arg(long, default_value = "false")]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct InspectCertArgs {
    /// Path to certificate file
    #[arg(long)]
    pub cert_path: String,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    pub format: String,
}

impl CertCommand {
    pub async fn execute(&self) -> Result<()> {
        match self {
            CertCommand::GenerateCa(args) => generate_ca(args),
            CertCommand::Inspect(args) => inspect_certificate(args),
        }
    }
}

/// Generate a new root CA and write it as PEM files
fn generate_ca(args: &GenerateCaArgs) -> Result<()> {
    info!("🔧 Generating root CA");
    info!("   Organization: {}", args.organization);
    info!("   Validity: {} days", args.validity_days);

    if !args.force && (Path::new(&args.cert_path).exists() || Path::new(&args.key_path).exists()) {
        return Err(anyhow!(
            "Certificate files already exist. Use --force to overwrite.\n  Certificate: {}\n  Key: {}",
            args.cert_path,
            args.key_path
        ));
    }

    let ca = CertificateAuthority::generate(&args.organization, args.validity_days)?;
    ca.save(&args.cert_path, &args.key_path)?;

    info!("✅ Root CA generated successfully!");
    info!("📜 Certificate: {}", args.cert_path);
    info!("🔐 Private key: {}", args.key_path);
    info!("💡 Add the certificate to your clients' trust store to intercept HTTPS");
    Ok(())
}

/// Summary of the fields shown by `cert inspect`
#[derive(Debug, serde::Serialize)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
    pub is_ca: bool,
    pub subject_alt_names: Vec<String>,
}

/// Parse the first certificate of a PEM file
pub fn summarize_certificate(pem: &[u8]) -> Result<CertificateSummary> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| anyhow!("Invalid PEM: {}", e))?;
    let cert = pem.parse_x509().map_err(|e| anyhow!("Invalid certificate: {}", e))?;

    let subject_alt_names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .map(|name| match name {
                GeneralName::DNSName(dns) => dns.to_string(),
                GeneralName::IPAddress(ip) => format!("IP:{:?}", ip),
                other => format!("{:?}", other),
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(CertificateSummary {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before: cert.validity().not_before.to_string(),
        not_after: cert.validity().not_after.to_string(),
        is_ca: cert.is_ca(),
        subject_alt_names,
    })
}

fn inspect_certificate(args: &InspectCertArgs) -> Result<()> {
    debug!("Inspecting certificate: {}", args.cert_path);

    let data = fs::read(&args.cert_path).with_context(|| format!("Certificate file not found: {}", args.cert_path))?;
    let summary = summarize_certificate(&data)?;

    match args.format.to_lowercase().as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => {
            println!("Certificate Details:");
            println!("  File: {}", args.cert_path);
            println!("  Subject: {}", summary.subject);
            println!("  Issuer: {}", summary.issuer);
            println!("  Serial: {}", summary.serial);
            println!("  Valid from: {}", summary.not_before);
            println!("  Valid until: {}", summary.not_after);
            println!("  CA: {}", summary.is_ca);
            if !summary.subject_alt_names.is_empty() {
                println!("  Subject alternative names: {}", summary.subject_alt_names.join(", "));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_ca() {
        let temp_dir = tempdir().unwrap();
        let cert_path = temp_dir.path().join("root.crt").to_string_lossy().to_string();
        let key_path = temp_dir.path().join("root.key").to_string_lossy().to_string();

        let args = GenerateCaArgs {
            organization: "Test Org".to_string(),
            validity_days: 30,
            cert_path,
            key_path,
            force: false,
        };

        assert!(generate_ca(&args).is_ok());
        assert!(Path::new(&args.cert_path).exists());
        assert!(Path::new(&args.key_path).exists());

        // refuses to overwrite without --force
        assert!(generate_ca(&args).is_err());

        let summary = summarize_certificate(&fs::read(&args.cert_path).unwrap()).unwrap();
        assert!(summary.is_ca);
        assert!(summary.subject.contains("Test Org"));
    }

    #[test]
    fn test_summary_lists_leaf_names() {
        let ca = CertificateAuthority::generate("Inspect Test", 30).unwrap();
        let leaf = ca.issue("inspect.example", 30).unwrap();
        let pem = format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            base64_lines(&leaf.cert_chain[0].0)
        );
        let summary = summarize_certificate(pem.as_bytes()).unwrap();
        assert!(!summary.is_ca);
        assert_eq!(summary.subject_alt_names, vec!["inspect.example".to_string()]);
    }

    fn base64_lines(der: &[u8]) -> String {
        use base64::{engine::general_purpose, Engine as _};
        let encoded = general_purpose::STANDARD.encode(der);
        encoded
            .as_bytes()
            .chunks(64)
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_inspect_missing_file() {
        let args = InspectCertArgs {
            cert_path: "/nonexistent/cert.pem".to_string(),
            format: "text".to_string(),
        };
        assert!(inspect_certificate(&args).is_err());
    }
}
