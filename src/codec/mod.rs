//! HTTP/1.1 framing for the proxy
//!
//! Both directions are decoded into frames instead of whole messages: a message head
//! followed by body chunks, the final chunk flagged with `last`. This is what lets the
//! intercept chain see every chunk, lets the session queue frames while an upstream
//! connection is still being dialed, and lets a connection drop its codec mid-stream
//! (CONNECT, WebSocket upgrades) via `Framed::into_parts`.

pub mod body;
pub mod client;
pub mod server;

use bytes::Bytes;
pub use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
pub use hyper::{Method, StatusCode, Uri, Version};

pub use client::HttpClientCodec;
pub use server::HttpServerCodec;

/// Maximum number of headers accepted in one message head.
pub const MAX_HEADERS: usize = 100;

/// Maximum size of a message head before the peer is considered broken.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Headers shared by request and response heads.
pub trait MessageHead {
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;

    fn content_length(&self) -> Option<u64> {
        self.headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    fn is_chunked(&self) -> bool {
        self.headers()
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .last()
            .map_or(false, |v| v.trim().eq_ignore_ascii_case("chunked"))
    }

    fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Rewrite an absolute-form URI (`http://host/path?q`) to origin form (`/path?q`).
    pub fn to_origin_form(&mut self) {
        if self.uri.scheme().is_none() && self.uri.authority().is_none() {
            return;
        }
        let origin = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        if let Ok(uri) = origin.parse() {
            self.uri = uri;
        }
    }
}

impl MessageHead for RequestHead {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    /// The fixed reply to an accepted `CONNECT`.
    pub fn connection_established() -> Self {
        Self {
            reason: Some("Connection established".to_string()),
            ..Self::new(StatusCode::OK)
        }
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.status == StatusCode::SWITCHING_PROTOCOLS
            && self
                .header_str(&header::UPGRADE)
                .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Whether a response with this status may carry a body at all.
    pub fn status_allows_body(&self) -> bool {
        !(self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED)
    }
}

impl MessageHead for ResponseHead {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

/// A piece of message body. The final piece of every message has `last` set, even
/// when the message has no body at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpChunk {
    pub data: Bytes,
    pub last: bool,
}

impl HttpChunk {
    pub fn new(data: impl Into<Bytes>, last: bool) -> Self {
        Self {
            data: data.into(),
            last,
        }
    }

    pub fn last_empty() -> Self {
        Self::new(Bytes::new(), true)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A message head, optionally carrying its complete body once aggregated.
#[derive(Debug, Clone)]
pub struct HttpMessage<H> {
    pub head: H,
    pub body: Option<Bytes>,
}

pub type HttpRequest = HttpMessage<RequestHead>;
pub type HttpResponse = HttpMessage<ResponseHead>;

impl<H: MessageHead> HttpMessage<H> {
    pub fn streamed(head: H) -> Self {
        Self { head, body: None }
    }

    pub fn full(head: H, body: Bytes) -> Self {
        Self {
            head,
            body: Some(body),
        }
    }

    /// True once the body has been aggregated into this message.
    pub fn is_full(&self) -> bool {
        self.body.is_some()
    }

    /// Replace the aggregated body, keeping a present `Content-Length` in step.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        if self.head.headers().contains_key(header::CONTENT_LENGTH) {
            self.head
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        }
        self.body = Some(body);
    }

    /// Recompute a present `Content-Length` from the aggregated body.
    pub fn sync_content_length(&mut self) {
        if let Some(len) = self.body.as_ref().map(|b| b.len() as u64) {
            if self.head.headers().contains_key(header::CONTENT_LENGTH) {
                self.head.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum HttpFrame<H> {
    Message(HttpMessage<H>),
    Chunk(HttpChunk),
}

pub type RequestFrame = HttpFrame<RequestHead>;
pub type ResponseFrame = HttpFrame<ResponseHead>;

impl<H> HttpFrame<H> {
    /// True when this frame completes a message.
    pub fn ends_message(&self) -> bool {
        match self {
            HttpFrame::Message(message) => message.body.is_some(),
            HttpFrame::Chunk(chunk) => chunk.last,
        }
    }
}
