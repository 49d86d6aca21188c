//! TLS certificate management for HTTPS interception

pub mod broker;
pub mod ca;
pub mod config;

pub use broker::CertificateBroker;
pub use ca::{CertificateAuthority, IssuedCertificate};
pub use config::{create_client_config, create_server_config, AcceptAllCertVerifier};
