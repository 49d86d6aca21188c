use std::fmt;

use hyper::http::uri::Authority;

use crate::codec::{header, MessageHead, RequestHead};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Where a client session's traffic is going
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl TargetDescriptor {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Derive the target of a request head.
    ///
    /// `CONNECT` uses its authority (default port 443). An absolute URI gives host and
    /// port directly, `https` implying TLS. Anything else falls back to the `Host`
    /// header on port 80. `None` means the request names no usable destination.
    pub fn from_request(head: &RequestHead) -> Option<Self> {
        if head.is_connect() {
            let authority = head.uri.authority()?;
            return Self::from_authority(authority, DEFAULT_HTTPS_PORT, false);
        }

        if let Some(authority) = head.uri.authority() {
            let tls = head.uri.scheme_str().map_or(false, |s| s.eq_ignore_ascii_case("https"));
            let default_port = if tls { DEFAULT_HTTPS_PORT } else { DEFAULT_HTTP_PORT };
            return Self::from_authority(authority, default_port, tls);
        }

        let host = head.header_str(&header::HOST)?;
        let authority: Authority = host.trim().parse().ok()?;
        Self::from_authority(&authority, DEFAULT_HTTP_PORT, false)
    }

    fn from_authority(authority: &Authority, default_port: u16, tls: bool) -> Option<Self> {
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        let port = authority.port_u16().unwrap_or(default_port);
        Some(Self::new(host, port, tls))
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Same destination switched to TLS, as after a MITM handshake.
    pub fn with_tls(&self) -> Self {
        Self {
            tls: true,
            ..self.clone()
        }
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}", scheme, self.authority())
    }
}
