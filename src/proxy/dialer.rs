//! Outbound connections to targets, directly or through an upstream proxy

use base64::{engine::general_purpose, Engine as _};
use bytes::BytesMut;
use rustls::{ClientConfig, ServerName};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

use super::io::{BoxedStream, PrefixedIo};
use super::target::TargetDescriptor;
use crate::codec::MAX_HEAD_SIZE;
use crate::config::{ProxyConfig, UpstreamProxyConfig, UpstreamProxyKind};
use crate::error::{Error, Result};
use crate::{log_debug, log_info};

/// Opens upstream connections for client sessions
#[derive(Clone)]
pub struct UpstreamDialer {
    upstream: Option<UpstreamProxyConfig>,
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Option<Duration>,
}

impl UpstreamDialer {
    pub fn new(
        upstream: Option<UpstreamProxyConfig>,
        tls: Option<Arc<ClientConfig>>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            upstream,
            tls,
            connect_timeout,
        }
    }

    /// Dialer built from the proxy configuration, with a TLS client config for origins
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let tls = crate::tls::create_client_config(&config.mitm)?;
        Ok(Self::new(config.upstream_proxy.clone(), Some(tls), config.connect_timeout()))
    }

    pub fn upstream(&self) -> Option<&UpstreamProxyConfig> {
        self.upstream.as_ref()
    }

    /// Open a connection to `target`, through the upstream proxy when one is configured.
    ///
    /// The returned stream is ready for application bytes: any proxy handshake has
    /// completed and, for TLS targets, the client TLS session is established.
    pub async fn dial(&self, target: &TargetDescriptor) -> Result<BoxedStream> {
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.dial_inner(target)).await?,
            None => self.dial_inner(target).await,
        }
    }

    async fn dial_inner(&self, target: &TargetDescriptor) -> Result<BoxedStream> {
        let stream = match &self.upstream {
            None => {
                log_debug!("🔌 Connecting directly to {}", target.authority());
                let tcp = TcpStream::connect((target.host.as_str(), target.port))
                    .await
                    .map_err(|e| Error::UpstreamConnection(format!("{}: {}", target.authority(), e)))?;
                tcp.set_nodelay(true)?;
                Box::new(tcp) as BoxedStream
            }
            Some(proxy) => {
                log_debug!("🔌 Connecting to {} via {:?} proxy {}", target.authority(), proxy.kind, proxy.authority());
                via_proxy(proxy, target).await?
            }
        };

        if !target.tls {
            return Ok(stream);
        }

        let config = self
            .tls
            .clone()
            .ok_or_else(|| Error::UpstreamConnection("no TLS client configuration".to_string()))?;
        let server_name = ServerName::try_from(target.host.as_str())
            .map_err(|e| Error::UpstreamConnection(format!("invalid server name {}: {}", target.host, e)))?;
        let tls = TlsConnector::from(config).connect(server_name, stream).await?;
        log_debug!("🔒 TLS established with {}", target.authority());
        Ok(Box::new(tls))
    }
}

async fn via_proxy(proxy: &UpstreamProxyConfig, target: &TargetDescriptor) -> Result<BoxedStream> {
    let proxy_addr = proxy.authority();
    let destination = (target.host.as_str(), target.port);

    match proxy.kind {
        UpstreamProxyKind::Http => {
            let tcp = TcpStream::connect(proxy_addr.as_str())
                .await
                .map_err(|e| Error::UpstreamConnection(format!("proxy {}: {}", proxy_addr, e)))?;
            tcp.set_nodelay(true)?;
            http_connect(tcp, proxy, target).await
        }
        UpstreamProxyKind::Socks4 => {
            let stream = match proxy.user.as_deref() {
                Some(user) => Socks4Stream::connect_with_userid(proxy_addr.as_str(), destination, user).await?,
                None => Socks4Stream::connect(proxy_addr.as_str(), destination).await?,
            };
            Ok(Box::new(stream.into_inner()))
        }
        UpstreamProxyKind::Socks5 => {
            let stream = match (proxy.user.as_deref(), proxy.password.as_deref()) {
                (Some(user), password) => {
                    Socks5Stream::connect_with_password(proxy_addr.as_str(), destination, user, password.unwrap_or(""))
                        .await?
                }
                (None, _) => Socks5Stream::connect(proxy_addr.as_str(), destination).await?,
            };
            Ok(Box::new(stream.into_inner()))
        }
    }
}

/// Ask an HTTP proxy for a tunnel to `target` and wait for its 2xx answer.
async fn http_connect(mut stream: TcpStream, proxy: &UpstreamProxyConfig, target: &TargetDescriptor) -> Result<BoxedStream> {
    let authority = target.authority();
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if let Some(user) = &proxy.user {
        let credentials = format!("{}:{}", user, proxy.password.as_deref().unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            general_purpose::STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::ProxyHandshake(format!(
                "proxy {} closed before answering CONNECT",
                proxy.authority()
            )));
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf)? {
            httparse::Status::Complete(len) => {
                let code = response.code.unwrap_or_default();
                if !(200..300).contains(&code) {
                    return Err(Error::ProxyHandshake(format!(
                        "proxy {} refused CONNECT {}: {} {}",
                        proxy.authority(),
                        authority,
                        code,
                        response.reason.unwrap_or("")
                    )));
                }
                log_info!("🚇 Tunnel to {} opened through {}", authority, proxy.authority());
                let leftover = buf.split_off(len).freeze();
                return Ok(if leftover.is_empty() {
                    Box::new(stream)
                } else {
                    Box::new(PrefixedIo::new(stream, leftover))
                });
            }
            httparse::Status::Partial if buf.len() > MAX_HEAD_SIZE => {
                return Err(Error::ProxyHandshake("CONNECT response head too large".to_string()));
            }
            httparse::Status::Partial => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let dialer = UpstreamDialer::new(None, None, Some(Duration::from_secs(5)));
        let mut stream = dialer.dial(&TargetDescriptor::new("127.0.0.1", port, false)).await.unwrap();
        let mut out = [0u8; 2];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hi");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_dial_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = UpstreamDialer::new(None, None, Some(Duration::from_secs(5)));
        let result = dialer.dial(&TargetDescriptor::new("127.0.0.1", port, false)).await;
        assert!(matches!(result, Err(Error::UpstreamConnection(_))));
    }

    #[tokio::test]
    async fn test_http_connect_sends_credentials_and_keeps_leftover() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut request = Vec::new();
            while !request.ends_with(b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nearly")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        let upstream = UpstreamProxyConfig {
            kind: UpstreamProxyKind::Http,
            host: "127.0.0.1".to_string(),
            port,
            user: Some("user".to_string()),
            password: Some("pass".to_string()),
        };
        let dialer = UpstreamDialer::new(Some(upstream), None, None);
        let mut stream = dialer.dial(&TargetDescriptor::new("origin.test", 80, false)).await.unwrap();

        let mut early = [0u8; 5];
        stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");

        let request = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT origin.test:80 HTTP/1.1\r\n"));
        // base64("user:pass")
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_http_connect_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let upstream = UpstreamProxyConfig {
            kind: UpstreamProxyKind::Http,
            host: "127.0.0.1".to_string(),
            port,
            user: None,
            password: None,
        };
        let dialer = UpstreamDialer::new(Some(upstream), None, None);
        let result = dialer.dial(&TargetDescriptor::new("origin.test", 443, false)).await;
        assert!(matches!(result, Err(Error::ProxyHandshake(_))));
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        // proxy that accepts but never answers CONNECT
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let upstream = UpstreamProxyConfig {
            kind: UpstreamProxyKind::Http,
            host: "127.0.0.1".to_string(),
            port,
            user: None,
            password: None,
        };
        let dialer = UpstreamDialer::new(Some(upstream), None, Some(Duration::from_millis(200)));
        let result = dialer.dial(&TargetDescriptor::new("slow.test", 80, false)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
