#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_intercept_proxy::intercept::{DefaultInterceptInitializer, InterceptInitializer, DEFAULT_MAX_BODY_SIZE};
use rust_intercept_proxy::proxy::{DefaultExceptionHandle, ProxyListener, SessionSettings, UpstreamDialer};
use rust_intercept_proxy::tls::{CertificateAuthority, CertificateBroker};
use tokio::io::{AsyncRead, AsyncReadExt};

pub fn dialer() -> UpstreamDialer {
    UpstreamDialer::new(None, None, Some(Duration::from_secs(5)))
}

pub fn settings(dialer: UpstreamDialer, broker: Option<CertificateBroker>) -> SessionSettings {
    SessionSettings {
        dialer,
        broker,
        initializer: Arc::new(DefaultInterceptInitializer),
        exception: Arc::new(DefaultExceptionHandle),
        max_body_size: DEFAULT_MAX_BODY_SIZE,
    }
}

pub fn with_initializer(mut settings: SessionSettings, initializer: Arc<dyn InterceptInitializer>) -> SessionSettings {
    settings.initializer = initializer;
    settings
}

pub fn with_body_limit(mut settings: SessionSettings, max_body_size: usize) -> SessionSettings {
    settings.max_body_size = max_body_size;
    settings
}

pub fn broker() -> CertificateBroker {
    let ca = CertificateAuthority::generate("Integration Test", 30).unwrap();
    CertificateBroker::new(Arc::new(ca), 30)
}

/// Start a proxy on an ephemeral loopback port
pub async fn spawn_proxy(settings: SessionSettings) -> SocketAddr {
    let listener = ProxyListener::new("127.0.0.1:0".parse().unwrap(), settings);
    let bound = listener.bind().unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(listener.serve(bound, std::future::pending::<()>()));
    addr
}

/// Read a message head byte by byte, so nothing after it is consumed
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "stream closed inside a head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

pub fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Read one response framed by Content-Length
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let head = read_head(stream).await;
    let mut body = vec![0u8; content_length(&head)];
    stream.read_exact(&mut body).await.unwrap();
    (head, body)
}

pub const ESTABLISHED: &str = "HTTP/1.1 200 Connection established\r\n\r\n";

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "stream closed inside a line");
        line.push(byte[0]);
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).unwrap()
}

/// Read a chunked body up to its terminating chunk, returning the data of every chunk
pub async fn read_chunked_body<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    loop {
        let size_line = read_line(stream).await;
        let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16).unwrap();
        if size == 0 {
            assert_eq!(read_line(stream).await, "");
            return chunks;
        }
        let mut data = vec![0u8; size];
        stream.read_exact(&mut data).await.unwrap();
        assert_eq!(read_line(stream).await, "");
        chunks.push(data);
    }
}
