//! Full-object interception
//!
//! A full intercept asks the session to buffer a matching message instead of
//! streaming it. Once the last chunk arrives the aggregated message is decompressed
//! and dispatched again from the first stage, this time with its body attached, and
//! the handler gets to rewrite it before it continues down the chain.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Read;

use super::{Intercept, InterceptChain, InterceptContext};
use crate::codec::{
    header, HeaderValue, HttpChunk, HttpMessage, HttpRequest, HttpResponse, MessageHead, Method, RequestHead, ResponseHead,
};
use crate::error::{Error, Result};
use crate::log_debug;

/// Collects the body chunks of one message up to a size limit.
#[derive(Debug)]
pub struct BodyAggregator<H> {
    head: H,
    body: BytesMut,
    max_body_size: usize,
}

impl<H: MessageHead> BodyAggregator<H> {
    pub fn new(head: H, max_body_size: usize) -> Self {
        Self {
            head,
            body: BytesMut::new(),
            max_body_size,
        }
    }

    pub fn push(&mut self, chunk: &HttpChunk) -> Result<()> {
        if self.body.len() + chunk.len() > self.max_body_size {
            return Err(Error::BodyTooLarge(self.max_body_size));
        }
        self.body.extend_from_slice(&chunk.data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The complete message, decoded and framed by length.
    pub fn finish(self) -> Result<HttpMessage<H>> {
        let Self {
            mut head,
            body,
            max_body_size,
        } = self;
        let nothing_received = body.is_empty();
        let body = decode_content(&mut head, body.freeze(), max_body_size)?;

        let headers = head.headers_mut();
        headers.remove(header::TRANSFER_ENCODING);
        // no bytes under a declared length means a HEAD or 304 answer; keep the length
        if !(nothing_received && headers.contains_key(header::CONTENT_LENGTH)) {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        }
        Ok(HttpMessage::full(head, body))
    }
}

fn decode_content<H: MessageHead>(head: &mut H, body: Bytes, max_body_size: usize) -> Result<Bytes> {
    let encoding = head
        .header_str(&header::CONTENT_ENCODING)
        .map(|v| v.trim().to_ascii_lowercase());

    let decoded = match encoding.as_deref() {
        None | Some("") | Some("identity") => return Ok(body),
        Some("gzip") | Some("x-gzip") => inflate(GzDecoder::new(&body[..]), max_body_size)?,
        Some("deflate") => match inflate(ZlibDecoder::new(&body[..]), max_body_size) {
            Err(Error::Io(_)) => inflate(DeflateDecoder::new(&body[..]), max_body_size)?,
            other => other?,
        },
        Some(other) => {
            log_debug!("Leaving {} encoded body as is", other);
            return Ok(body);
        }
    };

    head.headers_mut().remove(header::CONTENT_ENCODING);
    Ok(decoded)
}

fn inflate<R: Read>(reader: R, max_body_size: usize) -> Result<Bytes> {
    let mut out = Vec::new();
    reader.take(max_body_size as u64 + 1).read_to_end(&mut out)?;
    if out.len() > max_body_size {
        return Err(Error::BodyTooLarge(max_body_size));
    }
    Ok(Bytes::from(out))
}

/// Rewrites complete requests
pub trait FullRequestHandler: Send + Sync {
    fn matches(&self, head: &RequestHead, ctx: &InterceptContext<'_>) -> bool;

    fn handle(&self, request: &mut HttpRequest, ctx: &mut InterceptContext<'_>) -> Result<()>;
}

/// Rewrites complete responses. `ctx.request` holds the request being answered.
pub trait FullResponseHandler: Send + Sync {
    fn matches(&self, head: &ResponseHead, ctx: &InterceptContext<'_>) -> bool;

    fn handle(&self, response: &mut HttpResponse, ctx: &mut InterceptContext<'_>) -> Result<()>;
}

pub struct FullRequestIntercept<T> {
    handler: T,
    max_body_size: Option<usize>,
}

impl<T: FullRequestHandler> FullRequestIntercept<T> {
    /// Aggregates up to the listener's configured limit.
    pub fn new(handler: T) -> Self {
        Self {
            handler,
            max_body_size: None,
        }
    }

    pub fn with_limit(mut self, max_body_size: usize) -> Self {
        self.max_body_size = Some(max_body_size);
        self
    }
}

#[async_trait]
impl<T: FullRequestHandler> Intercept for FullRequestIntercept<T> {
    async fn before_request_head(
        &self,
        ctx: &mut InterceptContext<'_>,
        mut request: HttpRequest,
        chain: &mut InterceptChain,
    ) -> Result<()> {
        if !self.handler.matches(&request.head, ctx) {
            return chain.run_request_head(ctx, request).await;
        }
        if !request.is_full() {
            log_debug!("Aggregating request {} {}", request.head.method, request.head.uri);
            let limit = self.max_body_size.unwrap_or_else(|| ctx.max_body_size());
            ctx.aggregate_request(request, limit);
            return Ok(());
        }

        self.handler.handle(&mut request, ctx)?;
        request.sync_content_length();
        chain.run_request_head(ctx, request).await
    }
}

pub struct FullResponseIntercept<T> {
    handler: T,
    max_body_size: Option<usize>,
}

impl<T: FullResponseHandler> FullResponseIntercept<T> {
    /// Aggregates up to the listener's configured limit.
    pub fn new(handler: T) -> Self {
        Self {
            handler,
            max_body_size: None,
        }
    }

    pub fn with_limit(mut self, max_body_size: usize) -> Self {
        self.max_body_size = Some(max_body_size);
        self
    }
}

#[async_trait]
impl<T: FullResponseHandler> Intercept for FullResponseIntercept<T> {
    async fn after_response_head(
        &self,
        ctx: &mut InterceptContext<'_>,
        mut response: HttpResponse,
        chain: &mut InterceptChain,
    ) -> Result<()> {
        let answers_head = ctx.request.as_ref().map_or(false, |r| r.method == Method::HEAD);
        if !response.head.status_allows_body() || answers_head || !self.handler.matches(&response.head, ctx) {
            return chain.run_response_head(ctx, response).await;
        }
        if !response.is_full() {
            log_debug!("Aggregating {} response from {}", response.head.status, ctx.target);
            let limit = self.max_body_size.unwrap_or_else(|| ctx.max_body_size());
            ctx.aggregate_response(response, limit);
            return Ok(());
        }

        self.handler.handle(&mut response, ctx)?;
        response.sync_content_length();
        chain.run_response_head(ctx, response).await
    }
}
