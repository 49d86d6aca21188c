//! One client connection, from the first request head to close
//!
//! A session starts out decoding HTTP. A plain request fixes the target and is
//! forwarded through the intercept chain. A `CONNECT` is answered directly and the
//! HTTP codec is dropped; the first raw chunk then decides between decrypting the
//! tunnel (a TLS handshake record while interception is enabled) and relaying it
//! byte for byte.
//!
//! Everything runs on the session's own task. Client input, upstream input and the
//! completion of a lazy dial are awaited in a single select loop, so frames queued
//! during a dial can never interleave with frames written after it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{BytesCodec, Framed, FramedParts};

use super::exception::ExceptionHandle;
use super::io::{BoxedStream, PrefixedIo};
use super::pending::{DialState, PendingFrameQueue, PendingUnit};
use super::target::TargetDescriptor;
use super::UpstreamDialer;
use crate::codec::{
    header, HeaderValue, HttpChunk, HttpClientCodec, HttpFrame, HttpMessage, HttpRequest, HttpResponse, HttpServerCodec,
    RequestFrame, RequestHead, ResponseFrame, ResponseHead, StatusCode,
};
use crate::error::{Error, Result};
use crate::intercept::{BodyAggregator, Forwarder, InterceptChain, InterceptContext, InterceptInitializer};
use crate::tls::{create_server_config, CertificateBroker};
use crate::utils::strip_proxy_headers;
use crate::{log_debug, log_info, log_warning};

/// First byte of a TLS record carrying a handshake message
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingTarget,
    TunnelHandshake,
    Forwarding,
    MitmDecoding,
    Closed,
}

/// What every session of a listener shares
#[derive(Clone)]
pub struct SessionSettings {
    pub dialer: UpstreamDialer,
    /// Present when HTTPS interception is enabled
    pub broker: Option<CertificateBroker>,
    pub initializer: Arc<dyn InterceptInitializer>,
    pub exception: Arc<dyn ExceptionHandle>,
    /// Limit for full-object stages without their own
    pub max_body_size: usize,
}

type DialFuture = BoxFuture<'static, Result<BoxedStream>>;

enum ClientConn {
    Http(Framed<BoxedStream, HttpServerCodec>),
    Raw(Framed<BoxedStream, BytesCodec>),
    Detached,
}

impl ClientConn {
    /// The underlying stream and whatever was read but not yet decoded
    fn into_io(self) -> Option<(BoxedStream, BytesMut)> {
        match self {
            ClientConn::Http(framed) => {
                let parts = framed.into_parts();
                Some((parts.io, parts.read_buf))
            }
            ClientConn::Raw(framed) => {
                let parts = framed.into_parts();
                Some((parts.io, parts.read_buf))
            }
            ClientConn::Detached => None,
        }
    }
}

enum ClientInput {
    Frame(RequestFrame),
    Raw(Bytes),
}

enum SessionEvent {
    Client(Option<Result<ClientInput>>),
    Upstream(Option<Result<ResponseFrame>>),
    Dialed(Result<BoxedStream>),
}

enum Flow {
    Continue,
    Close,
}

/// Both connections of a session plus the dial bookkeeping; the terminal
/// intercept stage writes through this.
struct SessionLink {
    client: ClientConn,
    upstream: Option<Framed<BoxedStream, HttpClientCodec>>,
    pending: PendingFrameQueue,
    dial: Option<DialFuture>,
    dialer: UpstreamDialer,
    target: Option<TargetDescriptor>,
    // requests still waiting for a final response, oldest first
    exchanges: VecDeque<RequestHead>,
    upgraded: bool,
}

impl SessionLink {
    fn start_dial(&mut self) -> Result<()> {
        if self.pending.state() != DialState::Idle {
            return Ok(());
        }
        let target = self
            .target
            .clone()
            .ok_or_else(|| Error::UpstreamConnection("no target to dial".to_string()))?;
        log_debug!("📡 Dialing {}", target);
        let dialer = self.dialer.clone();
        self.dial = Some(Box::pin(async move { dialer.dial(&target).await }));
        self.pending.dialing();
        Ok(())
    }

    /// Nothing queued, dialing, sent without an answer or mid-response.
    fn is_idle(&self) -> bool {
        self.dial.is_none()
            && self.pending.is_empty()
            && self.upstream.as_ref().map_or(true, |upstream| upstream.codec().is_idle())
    }

    /// Point the session at a new target; the current upstream link is dropped.
    fn retarget(&mut self, target: TargetDescriptor) {
        if self.target.is_some() {
            log_debug!("Switching upstream to {}", target);
        }
        self.upstream = None;
        self.dial = None;
        self.pending.reset();
        self.target = Some(target);
    }
}

#[async_trait]
impl Forwarder for SessionLink {
    async fn forward_request(&mut self, frame: RequestFrame) -> Result<()> {
        if let Some(upstream) = self.upstream.as_mut() {
            return upstream.send(frame).await;
        }
        self.pending.push(PendingUnit::Frame(frame));
        self.start_dial()
    }

    async fn forward_response(&mut self, frame: ResponseFrame) -> Result<()> {
        let (upgrade, is_final) = match &frame {
            HttpFrame::Message(m) => (
                m.head.is_websocket_upgrade(),
                !m.head.status.is_informational() || m.head.status == StatusCode::SWITCHING_PROTOCOLS,
            ),
            HttpFrame::Chunk(_) => (false, false),
        };
        match &mut self.client {
            ClientConn::Http(client) => client.send(frame).await?,
            _ => return Err(Error::InvalidMessage("client connection is not decoding HTTP".to_string())),
        }
        if is_final {
            self.exchanges.pop_front();
        }
        if upgrade {
            self.upgraded = true;
        }
        Ok(())
    }
}

fn context(
    link: &mut SessionLink,
    client_addr: SocketAddr,
    request: Option<RequestHead>,
    max_body_size: usize,
) -> Result<InterceptContext<'_>> {
    let target = link
        .target
        .clone()
        .ok_or_else(|| Error::Intercept("no target for intercepted message".to_string()))?;
    Ok(InterceptContext::new(target, client_addr, request, link).with_max_body_size(max_body_size))
}

async fn next_client(client: &mut ClientConn) -> Option<Result<ClientInput>> {
    match client {
        ClientConn::Http(framed) => framed.next().await.map(|r| r.map(ClientInput::Frame)),
        ClientConn::Raw(framed) => framed
            .next()
            .await
            .map(|r| r.map(|data| ClientInput::Raw(data.freeze())).map_err(Error::from)),
        ClientConn::Detached => std::future::pending().await,
    }
}

async fn next_upstream(upstream: &mut Option<Framed<BoxedStream, HttpClientCodec>>) -> Option<Result<ResponseFrame>> {
    match upstream {
        Some(framed) => framed.next().await,
        None => std::future::pending().await,
    }
}

async fn next_dial(dial: &mut Option<DialFuture>) -> Result<BoxedStream> {
    match dial {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

pub struct ClientSession {
    settings: SessionSettings,
    chain: InterceptChain,
    link: SessionLink,
    state: SessionState,
    client_addr: SocketAddr,
    local_port: u16,
    last_request: Option<RequestHead>,
    // a request for another target, parked until the current exchange is done
    held: Option<RequestHead>,
    request_aggregator: Option<BodyAggregator<RequestHead>>,
    response_aggregator: Option<BodyAggregator<ResponseHead>>,
    raw_classified: bool,
}

impl ClientSession {
    pub fn new(settings: SessionSettings, stream: BoxedStream, client_addr: SocketAddr, local_port: u16) -> Self {
        let chain = InterceptChain::build(settings.initializer.as_ref());
        let link = SessionLink {
            client: ClientConn::Http(Framed::new(stream, HttpServerCodec::new())),
            upstream: None,
            pending: PendingFrameQueue::new(),
            dial: None,
            dialer: settings.dialer.clone(),
            target: None,
            exchanges: VecDeque::new(),
            upgraded: false,
        };
        Self {
            settings,
            chain,
            link,
            state: SessionState::AwaitingTarget,
            client_addr,
            local_port,
            last_request: None,
            held: None,
            request_aggregator: None,
            response_aggregator: None,
            raw_classified: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until either side closes. Failures go through the
    /// exception handle; whatever it returns is the session's result.
    pub async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        self.state = SessionState::Closed;
        self.link.client = ClientConn::Detached;
        self.link.upstream = None;
        self.link.dial = None;

        match result {
            Ok(()) => Ok(()),
            Err(cause) => self.catch(cause),
        }
    }

    fn catch(&self, cause: Error) -> Result<()> {
        match (&self.link.target, self.link.pending.is_connected()) {
            (Some(target), true) => self.settings.exception.after_catch(self.client_addr, target, cause),
            _ => self.settings.exception.before_catch(self.client_addr, cause),
        }
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            if self.link.upgraded {
                let (upstream, buffered) = self
                    .link
                    .upstream
                    .take()
                    .map(|framed| {
                        let parts = framed.into_parts();
                        (parts.io, parts.read_buf)
                    })
                    .ok_or_else(|| Error::InvalidMessage("upgrade without an upstream".to_string()))?;
                log_info!("🔁 Upgraded {} <-> {}, relaying raw bytes", self.client_addr, self.target_name());
                return self.relay(upstream, buffered).await;
            }

            let reading = self.held.is_none();
            let event = tokio::select! {
                input = next_client(&mut self.link.client), if reading => SessionEvent::Client(input),
                frame = next_upstream(&mut self.link.upstream) => SessionEvent::Upstream(frame),
                dialed = next_dial(&mut self.link.dial) => SessionEvent::Dialed(dialed),
            };

            match event {
                SessionEvent::Client(None) => {
                    log_debug!("Client {} closed the connection", self.client_addr);
                    return Ok(());
                }
                SessionEvent::Client(Some(Err(e))) => {
                    if self.state == SessionState::AwaitingTarget {
                        log_warning!("⚠️  Malformed request from {}: {}", self.client_addr, e);
                        return Ok(());
                    }
                    return Err(e);
                }
                SessionEvent::Client(Some(Ok(ClientInput::Frame(frame)))) => {
                    if let Flow::Close = self.on_request(frame).await? {
                        return Ok(());
                    }
                }
                SessionEvent::Client(Some(Ok(ClientInput::Raw(data)))) => self.on_raw(data).await?,
                SessionEvent::Upstream(None) => {
                    log_debug!("Upstream {} closed the connection", self.target_name());
                    if self.held.is_none() {
                        return Ok(());
                    }
                    self.link.upstream = None;
                    if let Flow::Close = self.release_held().await? {
                        return Ok(());
                    }
                }
                SessionEvent::Upstream(Some(frame)) => {
                    self.on_response(frame?).await?;
                    if let Flow::Close = self.release_held().await? {
                        return Ok(());
                    }
                }
                SessionEvent::Dialed(result) => {
                    self.link.dial = None;
                    let stream = match result {
                        Ok(stream) => stream,
                        Err(e) => {
                            let dropped = self.link.pending.failed();
                            log_warning!(
                                "❌ Failed to connect to {} ({} queued units dropped): {}",
                                self.target_name(),
                                dropped,
                                e
                            );
                            return Err(e);
                        }
                    };
                    if matches!(self.link.client, ClientConn::Raw(_)) {
                        return self.open_tunnel(stream).await;
                    }
                    self.attach_upstream(stream).await?;
                }
            }
        }
    }

    fn target_name(&self) -> String {
        self.link
            .target
            .as_ref()
            .map_or_else(|| "<none>".to_string(), |t| t.authority())
    }

    async fn on_request(&mut self, frame: RequestFrame) -> Result<Flow> {
        match frame {
            HttpFrame::Message(message) => self.on_request_head(message.head).await,
            HttpFrame::Chunk(chunk) => {
                self.on_request_chunk(chunk).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_request_head(&mut self, mut head: RequestHead) -> Result<Flow> {
        if self.state != SessionState::MitmDecoding {
            let Some(target) = TargetDescriptor::from_request(&head) else {
                log_warning!(
                    "⚠️  Request from {} names no target: {} {}",
                    self.client_addr,
                    head.method,
                    head.uri
                );
                return Ok(Flow::Close);
            };

            let switching = head.is_connect() || self.link.target.as_ref() != Some(&target);
            if switching && !self.link.is_idle() {
                log_debug!(
                    "Holding {} {} until the exchange with {} completes",
                    head.method,
                    head.uri,
                    self.target_name()
                );
                self.held = Some(head);
                return Ok(Flow::Continue);
            }

            if head.is_connect() {
                self.link.retarget(target.clone());
                self.accept_connect(target).await?;
                return Ok(Flow::Continue);
            }

            if self.link.target.as_ref() != Some(&target) {
                self.link.retarget(target);
            }
            self.state = SessionState::Forwarding;
        }

        head.to_origin_form();
        if !head.headers.contains_key(header::HOST) {
            if let Some(host) = self.link.target.as_ref().and_then(|t| HeaderValue::from_str(&t.authority()).ok()) {
                head.headers.insert(header::HOST, host);
            }
        }
        strip_proxy_headers(&mut head.headers);

        self.last_request = Some(head.clone());
        self.link.exchanges.push_back(head.clone());
        self.dispatch_request(HttpMessage::streamed(head)).await?;
        Ok(Flow::Continue)
    }

    /// Resume a parked request once the upstream link has gone idle.
    async fn release_held(&mut self) -> Result<Flow> {
        if !self.link.is_idle() {
            return Ok(Flow::Continue);
        }
        match self.held.take() {
            Some(head) => self.on_request_head(head).await,
            None => Ok(Flow::Continue),
        }
    }

    async fn accept_connect(&mut self, target: TargetDescriptor) -> Result<()> {
        log_info!("🔐 CONNECT {} from {}", target.authority(), self.client_addr);
        self.state = SessionState::TunnelHandshake;

        let ClientConn::Http(mut client) = std::mem::replace(&mut self.link.client, ClientConn::Detached) else {
            return Err(Error::InvalidMessage("CONNECT outside of HTTP decoding".to_string()));
        };
        client
            .send(HttpFrame::Message(HttpMessage::streamed(ResponseHead::connection_established())))
            .await?;

        let stray = client.codec_mut().take_pending();
        let parts = client.into_parts();
        let mut raw = FramedParts::new::<Bytes>(parts.io, BytesCodec::new());
        raw.read_buf = parts.read_buf;
        self.link.client = ClientConn::Raw(Framed::from_parts(raw));
        self.raw_classified = false;

        if let Some(chunk) = stray {
            self.on_request_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn on_request_chunk(&mut self, chunk: HttpChunk) -> Result<()> {
        if self.state == SessionState::TunnelHandshake {
            // content during the handshake is dropped, not forwarded
            log_debug!(
                "Discarding {} byte fragment from {} during tunnel handshake",
                chunk.len(),
                self.client_addr
            );
            self.state = SessionState::Forwarding;
            return Ok(());
        }

        if let Some(aggregator) = self.request_aggregator.as_mut() {
            aggregator.push(&chunk)?;
            if chunk.last {
                if let Some(aggregator) = self.request_aggregator.take() {
                    let full = aggregator.finish()?;
                    self.dispatch_request(full).await?;
                }
            }
            return Ok(());
        }

        let mut ctx = context(
            &mut self.link,
            self.client_addr,
            self.last_request.clone(),
            self.settings.max_body_size,
        )?;
        self.chain.dispatch_request_body(&mut ctx, chunk).await
    }

    async fn dispatch_request(&mut self, request: HttpRequest) -> Result<()> {
        let mut ctx = context(
            &mut self.link,
            self.client_addr,
            self.last_request.clone(),
            self.settings.max_body_size,
        )?;
        let result = self.chain.dispatch_request_head(&mut ctx, request).await;
        let aggregation = ctx.take_request_aggregation();
        result?;
        if let Some((head, limit)) = aggregation {
            self.request_aggregator = Some(BodyAggregator::new(head, limit));
        }
        Ok(())
    }

    async fn on_response(&mut self, frame: ResponseFrame) -> Result<()> {
        match frame {
            HttpFrame::Message(message) => self.dispatch_response(message).await,
            HttpFrame::Chunk(chunk) => {
                if let Some(aggregator) = self.response_aggregator.as_mut() {
                    aggregator.push(&chunk)?;
                    if chunk.last {
                        if let Some(aggregator) = self.response_aggregator.take() {
                            let full = aggregator.finish()?;
                            self.dispatch_response(full).await?;
                        }
                    }
                    return Ok(());
                }

                let answering = self.link.exchanges.front().cloned();
                let mut ctx = context(&mut self.link, self.client_addr, answering, self.settings.max_body_size)?;
                self.chain.dispatch_response_body(&mut ctx, chunk).await
            }
        }
    }

    async fn dispatch_response(&mut self, response: HttpResponse) -> Result<()> {
        let answering = self.link.exchanges.front().cloned();
        let mut ctx = context(&mut self.link, self.client_addr, answering, self.settings.max_body_size)?;
        let result = self.chain.dispatch_response_head(&mut ctx, response).await;
        let aggregation = ctx.take_response_aggregation();
        result?;
        if let Some((head, limit)) = aggregation {
            self.response_aggregator = Some(BodyAggregator::new(head, limit));
        }
        Ok(())
    }

    async fn on_raw(&mut self, data: Bytes) -> Result<()> {
        if !self.raw_classified {
            self.raw_classified = true;
            if data.first() == Some(&TLS_HANDSHAKE_RECORD) {
                if let Some(broker) = self.settings.broker.clone() {
                    return self.start_mitm(broker, data).await;
                }
            }
            log_info!("🚇 Opaque tunnel {} -> {}", self.client_addr, self.target_name());
            self.state = SessionState::Forwarding;
        }

        self.link.pending.push(PendingUnit::Raw(data));
        self.link.start_dial()
    }

    async fn start_mitm(&mut self, broker: CertificateBroker, hello: Bytes) -> Result<()> {
        let target = self
            .link
            .target
            .clone()
            .ok_or_else(|| Error::Certificate("TLS handshake before CONNECT".to_string()))?;
        let issued = broker.certificate_for(&target.host, self.local_port).await?;
        let config = create_server_config(&issued)?;

        let (io, buffered) = std::mem::replace(&mut self.link.client, ClientConn::Detached)
            .into_io()
            .ok_or_else(|| Error::InvalidMessage("client connection already detached".to_string()))?;
        let mut replay = BytesMut::with_capacity(hello.len() + buffered.len());
        replay.extend_from_slice(&hello);
        replay.extend_from_slice(&buffered);

        let tls = TlsAcceptor::from(config)
            .accept(PrefixedIo::new(io, replay.freeze()))
            .await?;
        let stream: BoxedStream = Box::new(tls);
        self.link.client = ClientConn::Http(Framed::new(stream, HttpServerCodec::new()));
        self.link.target = Some(target.with_tls());
        self.state = SessionState::MitmDecoding;
        log_info!("🔓 Intercepting HTTPS for {} (client {})", target.authority(), self.client_addr);
        Ok(())
    }

    async fn attach_upstream(&mut self, stream: BoxedStream) -> Result<()> {
        let mut upstream = Framed::new(stream, HttpClientCodec::new());
        let queued = self.link.pending.connected();
        log_debug!("🔗 Connected to {}, flushing {} queued frames", self.target_name(), queued.len());
        for unit in queued {
            match unit {
                PendingUnit::Frame(frame) => upstream.feed(frame).await?,
                PendingUnit::Raw(data) => log_debug!("Dropping {} raw bytes queued on an HTTP link", data.len()),
            }
        }
        upstream.flush().await?;
        self.link.upstream = Some(upstream);
        Ok(())
    }

    async fn open_tunnel(&mut self, mut upstream: BoxedStream) -> Result<()> {
        for unit in self.link.pending.connected() {
            if let PendingUnit::Raw(data) = unit {
                upstream.write_all(&data).await?;
            }
        }
        upstream.flush().await?;
        self.relay(upstream, BytesMut::new()).await
    }

    /// Copy bytes both ways until both directions are done.
    async fn relay(&mut self, mut upstream: BoxedStream, upstream_buffered: BytesMut) -> Result<()> {
        let (mut client, client_buffered) = std::mem::replace(&mut self.link.client, ClientConn::Detached)
            .into_io()
            .ok_or_else(|| Error::InvalidMessage("client connection already detached".to_string()))?;

        if !client_buffered.is_empty() {
            upstream.write_all(&client_buffered).await?;
        }
        if !upstream_buffered.is_empty() {
            client.write_all(&upstream_buffered).await?;
        }

        let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        log_debug!(
            "Relay {} <-> {} finished ({} bytes up, {} bytes down)",
            self.client_addr,
            self.target_name(),
            sent,
            received
        );
        Ok(())
    }
}
