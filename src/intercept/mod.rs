//! Pluggable request/response interception
//!
//! Every client connection owns one [`InterceptChain`]: the stages registered by an
//! [`InterceptInitializer`] followed by a terminal [`ForwardIntercept`] that performs
//! the actual send. A stage receives each message head or body chunk together with
//! the chain and either continues it (`chain.run_*`) or handles the message itself,
//! for example by answering the client directly through the context.
//!
//! The chain keeps one cursor per phase. A `dispatch_*` call starts its phase at the
//! first stage and resets the cursor once every stage has returned, so the next event
//! of that phase starts from the beginning again.

pub mod full;
pub mod logging;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::{HttpChunk, HttpFrame, HttpRequest, HttpResponse, RequestFrame, RequestHead, ResponseFrame, ResponseHead};
use crate::error::{Error, Result};
use crate::proxy::target::TargetDescriptor;

pub use full::{BodyAggregator, FullRequestHandler, FullRequestIntercept, FullResponseHandler, FullResponseIntercept};
pub use logging::LoggingIntercept;

/// Aggregation limit used by full-object stages that do not set their own.
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Where the terminal stage sends messages. Implemented by the client session.
#[async_trait]
pub trait Forwarder: Send {
    /// Send a request frame upstream, dialing the upstream connection if needed.
    async fn forward_request(&mut self, frame: RequestFrame) -> Result<()>;

    /// Write a response frame to the client.
    async fn forward_response(&mut self, frame: ResponseFrame) -> Result<()>;
}

/// Per-event view of the connection handed to every stage
pub struct InterceptContext<'a> {
    pub target: TargetDescriptor,
    pub client_addr: SocketAddr,
    /// Most recent request head seen on this connection
    pub request: Option<RequestHead>,
    forwarder: &'a mut dyn Forwarder,
    max_body_size: usize,
    request_aggregation: Option<(RequestHead, usize)>,
    response_aggregation: Option<(ResponseHead, usize)>,
}

impl<'a> InterceptContext<'a> {
    pub fn new(
        target: TargetDescriptor,
        client_addr: SocketAddr,
        request: Option<RequestHead>,
        forwarder: &'a mut dyn Forwarder,
    ) -> Self {
        Self {
            target,
            client_addr,
            request,
            forwarder,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            request_aggregation: None,
            response_aggregation: None,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Listener-wide aggregation limit (`full_object.max_body_size`)
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub async fn forward_request(&mut self, frame: RequestFrame) -> Result<()> {
        self.forwarder.forward_request(frame).await
    }

    pub async fn forward_response(&mut self, frame: ResponseFrame) -> Result<()> {
        self.forwarder.forward_response(frame).await
    }

    /// Buffer the rest of this streamed request and dispatch it again from the
    /// first stage once complete. The chain must not be continued for `request`.
    pub fn aggregate_request(&mut self, request: HttpRequest, max_body_size: usize) {
        self.request_aggregation = Some((request.head, max_body_size));
    }

    /// Response counterpart of [`aggregate_request`](Self::aggregate_request).
    pub fn aggregate_response(&mut self, response: HttpResponse, max_body_size: usize) {
        self.response_aggregation = Some((response.head, max_body_size));
    }

    pub fn take_request_aggregation(&mut self) -> Option<(RequestHead, usize)> {
        self.request_aggregation.take()
    }

    pub fn take_response_aggregation(&mut self) -> Option<(ResponseHead, usize)> {
        self.response_aggregation.take()
    }
}

/// One interception stage. Every hook continues the chain unchanged by default.
#[async_trait]
pub trait Intercept: Send + Sync {
    async fn before_request_head(
        &self,
        ctx: &mut InterceptContext<'_>,
        request: HttpRequest,
        chain: &mut InterceptChain,
    ) -> Result<()> {
        chain.run_request_head(ctx, request).await
    }

    async fn before_request_body(
        &self,
        ctx: &mut InterceptContext<'_>,
        chunk: HttpChunk,
        chain: &mut InterceptChain,
    ) -> Result<()> {
        chain.run_request_body(ctx, chunk).await
    }

    async fn after_response_head(
        &self,
        ctx: &mut InterceptContext<'_>,
        response: HttpResponse,
        chain: &mut InterceptChain,
    ) -> Result<()> {
        chain.run_response_head(ctx, response).await
    }

    async fn after_response_body(
        &self,
        ctx: &mut InterceptContext<'_>,
        chunk: HttpChunk,
        chain: &mut InterceptChain,
    ) -> Result<()> {
        chain.run_response_body(ctx, chunk).await
    }
}

/// Terminal stage: requests go upstream, responses go to the client
pub struct ForwardIntercept;

#[async_trait]
impl Intercept for ForwardIntercept {
    async fn before_request_head(
        &self,
        ctx: &mut InterceptContext<'_>,
        request: HttpRequest,
        _chain: &mut InterceptChain,
    ) -> Result<()> {
        ctx.forward_request(HttpFrame::Message(request)).await
    }

    async fn before_request_body(
        &self,
        ctx: &mut InterceptContext<'_>,
        chunk: HttpChunk,
        _chain: &mut InterceptChain,
    ) -> Result<()> {
        ctx.forward_request(HttpFrame::Chunk(chunk)).await
    }

    async fn after_response_head(
        &self,
        ctx: &mut InterceptContext<'_>,
        response: HttpResponse,
        _chain: &mut InterceptChain,
    ) -> Result<()> {
        ctx.forward_response(HttpFrame::Message(response)).await
    }

    async fn after_response_body(
        &self,
        ctx: &mut InterceptContext<'_>,
        chunk: HttpChunk,
        _chain: &mut InterceptChain,
    ) -> Result<()> {
        ctx.forward_response(HttpFrame::Chunk(chunk)).await
    }
}

/// Builds the stages of each new connection's chain
pub trait InterceptInitializer: Send + Sync {
    fn init(&self, chain: &mut InterceptChain);
}

impl<F> InterceptInitializer for F
where
    F: Fn(&mut InterceptChain) + Send + Sync,
{
    fn init(&self, chain: &mut InterceptChain) {
        self(chain)
    }
}

/// Initializer that adds no stages; traffic is forwarded untouched
pub struct DefaultInterceptInitializer;

impl InterceptInitializer for DefaultInterceptInitializer {
    fn init(&self, _chain: &mut InterceptChain) {}
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    RequestHead = 0,
    RequestBody = 1,
    ResponseHead = 2,
    ResponseBody = 3,
}

pub struct InterceptChain {
    stages: Vec<Arc<dyn Intercept>>,
    cursors: [usize; 4],
}

impl Default for InterceptChain {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptChain {
    /// An empty chain without the terminal stage
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            cursors: [0; 4],
        }
    }

    /// Chain for one connection: the initializer's stages, then [`ForwardIntercept`]
    pub fn build(initializer: &dyn InterceptInitializer) -> Self {
        let mut chain = Self::new();
        initializer.init(&mut chain);
        chain.stages.push(Arc::new(ForwardIntercept));
        chain
    }

    pub fn add_last<I: Intercept + 'static>(&mut self, stage: I) {
        self.stages.push(Arc::new(stage));
    }

    pub fn add_last_shared(&mut self, stage: Arc<dyn Intercept>) {
        self.stages.push(stage);
    }

    pub fn add_first<I: Intercept + 'static>(&mut self, stage: I) {
        self.stages.insert(0, Arc::new(stage));
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn next_stage(&mut self, phase: Phase) -> Result<Arc<dyn Intercept>> {
        let cursor = &mut self.cursors[phase as usize];
        let stage = self
            .stages
            .get(*cursor)
            .cloned()
            .ok_or_else(|| Error::Intercept(format!("{:?} continued past the last stage", phase)))?;
        *cursor += 1;
        Ok(stage)
    }

    pub fn run_request_head<'a>(
        &'a mut self,
        ctx: &'a mut InterceptContext<'_>,
        request: HttpRequest,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stage = self.next_stage(Phase::RequestHead)?;
            stage.before_request_head(ctx, request, self).await
        })
    }

    pub fn run_request_body<'a>(
        &'a mut self,
        ctx: &'a mut InterceptContext<'_>,
        chunk: HttpChunk,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stage = self.next_stage(Phase::RequestBody)?;
            stage.before_request_body(ctx, chunk, self).await
        })
    }

    pub fn run_response_head<'a>(
        &'a mut self,
        ctx: &'a mut InterceptContext<'_>,
        response: HttpResponse,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stage = self.next_stage(Phase::ResponseHead)?;
            stage.after_response_head(ctx, response, self).await
        })
    }

    pub fn run_response_body<'a>(
        &'a mut self,
        ctx: &'a mut InterceptContext<'_>,
        chunk: HttpChunk,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stage = self.next_stage(Phase::ResponseBody)?;
            stage.after_response_body(ctx, chunk, self).await
        })
    }

    pub async fn dispatch_request_head(&mut self, ctx: &mut InterceptContext<'_>, request: HttpRequest) -> Result<()> {
        self.cursors[Phase::RequestHead as usize] = 0;
        let result = self.run_request_head(ctx, request).await;
        self.cursors[Phase::RequestHead as usize] = 0;
        result
    }

    pub async fn dispatch_request_body(&mut self, ctx: &mut InterceptContext<'_>, chunk: HttpChunk) -> Result<()> {
        self.cursors[Phase::RequestBody as usize] = 0;
        let result = self.run_request_body(ctx, chunk).await;
        self.cursors[Phase::RequestBody as usize] = 0;
        result
    }

    pub async fn dispatch_response_head(&mut self, ctx: &mut InterceptContext<'_>, response: HttpResponse) -> Result<()> {
        self.cursors[Phase::ResponseHead as usize] = 0;
        let result = self.run_response_head(ctx, response).await;
        self.cursors[Phase::ResponseHead as usize] = 0;
        result
    }

    pub async fn dispatch_response_body(&mut self, ctx: &mut InterceptContext<'_>, chunk: HttpChunk) -> Result<()> {
        self.cursors[Phase::ResponseBody as usize] = 0;
        let result = self.run_response_body(ctx, chunk).await;
        self.cursors[Phase::ResponseBody as usize] = 0;
        result
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::codec::{header, HeaderValue, HttpMessage, Method, StatusCode};
    use std::sync::Mutex;

    struct Tag(&'static str, Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Intercept for Tag {
        async fn before_request_head(
            &self,
            ctx: &mut InterceptContext<'_>,
            mut request: HttpRequest,
            chain: &mut InterceptChain,
        ) -> Result<()> {
            self.1.lock().unwrap().push(self.0);
            request.head.headers.append("x-seen-by", HeaderValue::from_static(self.0));
            chain.run_request_head(ctx, request).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Intercept for ShortCircuit {
        async fn before_request_head(
            &self,
            ctx: &mut InterceptContext<'_>,
            _request: HttpRequest,
            _chain: &mut InterceptChain,
        ) -> Result<()> {
            let blocked = crate::codec::ResponseHead::new(StatusCode::FORBIDDEN);
            ctx.forward_response(HttpFrame::Message(HttpMessage::full(blocked, bytes::Bytes::new())))
                .await
        }
    }

    fn get() -> HttpRequest {
        HttpMessage::streamed(RequestHead::new(Method::GET, "/".parse().unwrap()))
    }

    #[tokio::test]
    async fn test_stages_run_in_order_then_forward() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        let init = move |chain: &mut InterceptChain| {
            chain.add_last(Tag("first", a.clone()));
            chain.add_last(Tag("second", b.clone()));
        };
        let mut chain = InterceptChain::build(&init);
        assert_eq!(chain.len(), 3);

        let mut forwarder = RecordingForwarder::default();
        {
            let mut ctx = context(&mut forwarder);
            chain.dispatch_request_head(&mut ctx, get()).await.unwrap();
            chain.dispatch_request_head(&mut ctx, get()).await.unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "first", "second"]);
        assert_eq!(forwarder.requests.len(), 2);
        match &forwarder.requests[0] {
            HttpFrame::Message(m) => {
                let tags: Vec<_> = m.head.headers.get_all("x-seen-by").iter().collect();
                assert_eq!(tags, vec!["first", "second"]);
            }
            other => panic!("expected head, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stage_can_answer_without_forwarding() {
        let init = |chain: &mut InterceptChain| chain.add_last(ShortCircuit);
        let mut chain = InterceptChain::build(&init);
        let mut forwarder = RecordingForwarder::default();
        {
            let mut ctx = context(&mut forwarder);
            chain.dispatch_request_head(&mut ctx, get()).await.unwrap();
        }
        assert!(forwarder.requests.is_empty());
        assert!(matches!(&forwarder.responses[0], HttpFrame::Message(m) if m.head.status == StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_default_hooks_pass_everything_through() {
        let mut chain = InterceptChain::build(&DefaultInterceptInitializer);
        let mut forwarder = RecordingForwarder::default();
        {
            let mut ctx = context(&mut forwarder);
            chain.dispatch_request_body(&mut ctx, HttpChunk::new(&b"abc"[..], false)).await.unwrap();
            let mut head = crate::codec::ResponseHead::new(StatusCode::OK);
            head.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(1u64));
            chain
                .dispatch_response_head(&mut ctx, HttpMessage::streamed(head))
                .await
                .unwrap();
            chain.dispatch_response_body(&mut ctx, HttpChunk::new(&b"x"[..], true)).await.unwrap();
        }
        assert_eq!(forwarder.requests.len(), 1);
        assert_eq!(forwarder.responses.len(), 2);
    }

    #[tokio::test]
    async fn test_continuing_past_terminal_is_an_error() {
        let mut chain = InterceptChain::new();
        let mut forwarder = RecordingForwarder::default();
        let mut ctx = context(&mut forwarder);
        assert!(matches!(
            chain.dispatch_request_head(&mut ctx, get()).await,
            Err(Error::Intercept(_))
        ));
    }
}
