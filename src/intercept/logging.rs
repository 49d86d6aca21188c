use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{Intercept, InterceptChain, InterceptContext};
use crate::codec::{HttpRequest, HttpResponse};
use crate::error::Result;
use crate::models::ExchangeLog;
use crate::{log_exchange, log_info};

/// Logs one line per request and per response, plus a JSON record of the exchange.
///
/// Only streamed heads are logged so an aggregated message dispatched a second time
/// is not counted twice; install it ahead of any full-object stage.
#[derive(Default)]
pub struct LoggingIntercept {
    in_flight: Mutex<VecDeque<ExchangeLog>>,
}

impl LoggingIntercept {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Intercept for LoggingIntercept {
    async fn before_request_head(
        &self,
        ctx: &mut InterceptContext<'_>,
        request: HttpRequest,
        chain: &mut InterceptChain,
    ) -> Result<()> {
        if !request.is_full() {
            log_info!(
                "➡️  {} {} {} (client {})",
                request.head.method,
                ctx.target,
                request.head.uri,
                ctx.client_addr
            );
            let entry = ExchangeLog::from_request(ctx.client_addr, &ctx.target, &request.head);
            if let Ok(mut in_flight) = self.in_flight.lock() {
                in_flight.push_back(entry);
            }
        }
        chain.run_request_head(ctx, request).await
    }

    async fn after_response_head(
        &self,
        ctx: &mut InterceptContext<'_>,
        response: HttpResponse,
        chain: &mut InterceptChain,
    ) -> Result<()> {
        if !response.is_full() && !response.head.status.is_informational() {
            let entry = self.in_flight.lock().ok().and_then(|mut q| q.pop_front());
            if let Some(mut entry) = entry {
                entry.complete(&response.head);
                log_info!(
                    "⬅️  {} {} {} -> {} ({} ms)",
                    entry.method,
                    ctx.target,
                    entry.uri,
                    response.head.status.as_u16(),
                    entry.duration_ms.unwrap_or_default()
                );
                log_exchange!(&entry);
            }
        }
        chain.run_response_head(ctx, response).await
    }
}
