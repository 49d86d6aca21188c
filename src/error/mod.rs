//! Error handling module for the proxy server

use thiserror::Error;
use tokio::time::error::Elapsed;

/// Custom error type for the proxy server
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP parse error: {0}")]
    HttpParse(#[from] httparse::Error),

    #[error("Invalid HTTP message: {0}")]
    InvalidMessage(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("Upstream proxy handshake failed: {0}")]
    ProxyHandshake(String),

    #[error("SOCKS error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Intercept error: {0}")]
    Intercept(String),

    #[error("Body exceeds the aggregation limit of {0} bytes")]
    BodyTooLarge(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(#[from] Elapsed),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result type for the proxy server
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Unknown(err.to_string())
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(err: rcgen::RcgenError) -> Self {
        Error::Certificate(err.to_string())
    }
}

impl Error {
    /// True for errors that mean the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
