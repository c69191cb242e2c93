use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::fetch::{FetchMergeProxy, FetchProxy};
use super::produce::{CorrelateProxy, NoReplyProxy, ProduceProxy, ReplyMode};
use super::proxy::{prefer_async, prefer_wait, HttpProxy};
use super::route::{HttpKafkaCapability, HttpKafkaRoute, HttpKafkaRouter, MergeFraming};
use crate::core::config::HttpKafkaConfig;
use crate::core::time::Clock;
use crate::engine::{
    AcceptedStream, BufferSizing, EngineContext, FlowError, Frame, FrameHeader, FrameKind, StreamFactory,
};
use crate::ext::{Extension, HttpBeginEx};

/// Which proxy serves a resolved request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ProxyKind {
    Fetch,
    FetchMerge(MergeFraming),
    NoReply,
    Produce {
        mode: ReplyMode,
        wait_secs: u64,
    },
    Correlate {
        reply_to: String,
        correlation_id: String,
        wait_secs: u64,
    },
}

impl ProxyKind {
    pub(super) fn select(route: &HttpKafkaRoute, headers: &HttpBeginEx) -> Self {
        let prefer_wait = prefer_wait(headers);
        match (route.capability, &route.reply_to) {
            (HttpKafkaCapability::Fetch, _) => match &route.merge {
                Some(framing) => ProxyKind::FetchMerge(framing.clone()),
                None => ProxyKind::Fetch,
            },
            (HttpKafkaCapability::Produce, None) => ProxyKind::NoReply,
            (HttpKafkaCapability::Produce, Some(reply_to)) => {
                if let Some(correlation_id) = &route.correlation_id {
                    ProxyKind::Correlate {
                        reply_to: reply_to.clone(),
                        correlation_id: correlation_id.clone(),
                        wait_secs: prefer_wait.unwrap_or(route.wait_secs).min(route.wait_secs),
                    }
                } else if route.async_location.is_some() && prefer_async(headers) {
                    ProxyKind::Produce {
                        mode: ReplyMode::Async {
                            await_reply: prefer_wait.is_some(),
                        },
                        wait_secs: prefer_wait.unwrap_or(route.wait_secs).min(route.wait_secs),
                    }
                } else {
                    ProxyKind::Produce {
                        mode: ReplyMode::Sync,
                        wait_secs: route.wait_secs,
                    }
                }
            }
        }
    }
}

/// Accepts HTTP request streams and bridges each one to Kafka through the
/// proxy its route selects.
pub struct HttpKafkaProxyFactory {
    ctx: EngineContext,
    config: HttpKafkaConfig,
    router: Box<dyn HttpKafkaRouter>,
    proxies: HashMap<u64, Box<dyn HttpProxy>>,
}

impl HttpKafkaProxyFactory {
    pub fn new(config: HttpKafkaConfig, router: Box<dyn HttpKafkaRouter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ctx: EngineContext::new(clock, BufferSizing::default()),
            config,
            router,
            proxies: HashMap::new(),
        }
    }

    /// Exchanges still in flight.
    pub fn proxies(&self) -> usize {
        self.proxies.len()
    }

    fn admit(&mut self, header: &FrameHeader, affinity: u64, extension: &Extension) {
        let stream_id = header.stream_id;
        let default = HttpBeginEx::default();
        let headers = extension.http_begin().unwrap_or(&default);
        let method = headers.method().unwrap_or_default();
        let path = headers.path().unwrap_or_default();

        let Some(route) = self.router.resolve(method, path, headers) else {
            info!(stream_id, method, path, "no http-kafka route");
            reject(&mut self.ctx, header, affinity, HttpBeginEx::new().with(":status", "404"));
            return;
        };
        let kind = ProxyKind::select(&route, headers);
        debug!(stream_id, route_id = route.id, ?kind, topic = %route.topic, "http-kafka request admitted");

        match self.accept(header, affinity, &route, headers, kind) {
            Ok(proxy) => {
                self.ctx.bind_pair(stream_id, stream_id);
                self.proxies.insert(stream_id, proxy);
            }
            Err(err) => warn!(stream_id, %err, "rejecting http-kafka stream"),
        }
    }

    fn accept(
        &mut self,
        header: &FrameHeader,
        affinity: u64,
        route: &HttpKafkaRoute,
        headers: &HttpBeginEx,
        kind: ProxyKind,
    ) -> Result<Box<dyn HttpProxy>, FlowError> {
        let ctx = &mut self.ctx;
        let window = self.config.initial_window;
        let proxy: Box<dyn HttpProxy> = match kind {
            ProxyKind::Fetch => Box::new(FetchProxy::accept(ctx, header, affinity, route, headers, window)?),
            ProxyKind::FetchMerge(framing) => Box::new(FetchMergeProxy::accept(
                ctx, header, affinity, route, framing, headers, window,
            )?),
            ProxyKind::NoReply => Box::new(NoReplyProxy::accept(ctx, header, affinity, route, headers)?),
            ProxyKind::Produce { mode, wait_secs } => Box::new(ProduceProxy::accept(
                ctx, header, affinity, route, headers, mode, wait_secs,
            )?),
            ProxyKind::Correlate {
                reply_to,
                correlation_id,
                wait_secs,
            } => Box::new(CorrelateProxy::accept(
                ctx,
                header,
                affinity,
                route,
                &reply_to,
                correlation_id,
                wait_secs,
                window,
            )?),
        };
        Ok(proxy)
    }

    fn flush_budgets(&mut self) {
        loop {
            let watchers = self.ctx.budgets.take_flushable();
            if watchers.is_empty() {
                break;
            }
            for watcher in watchers {
                let Some(owner) = self.ctx.owner(watcher) else {
                    continue;
                };
                if let Some(proxy) = self.proxies.get_mut(&owner) {
                    proxy.on_budget_ready(&mut self.ctx);
                }
                self.reap(owner);
            }
        }
    }

    fn reap(&mut self, owner: u64) {
        if !self.proxies.get_mut(&owner).is_some_and(|proxy| proxy.is_done()) {
            return;
        }
        if let Some(mut proxy) = self.proxies.remove(&owner) {
            proxy.release(&mut self.ctx);
            debug!(stream_id = owner, "http-kafka exchange released");
        }
    }
}

impl StreamFactory for HttpKafkaProxyFactory {
    fn handle(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();
        let Some(owner) = self.ctx.owner(stream_id) else {
            if let FrameKind::Begin { affinity, extension } = &frame.kind {
                if !EngineContext::is_supplied(stream_id) {
                    self.admit(&frame.header, *affinity, extension);
                    return;
                }
            }
            debug!(stream_id, frame = frame.name(), "http-kafka frame for unknown stream");
            return;
        };
        if let Some(proxy) = self.proxies.get_mut(&owner) {
            proxy.on_frame(&mut self.ctx, frame);
        }
        self.flush_budgets();
        self.reap(owner);
    }

    fn context(&mut self) -> &mut EngineContext {
        &mut self.ctx
    }
}

/// Answer a request no route accepts, without keeping any state.
fn reject(ctx: &mut EngineContext, header: &FrameHeader, affinity: u64, headers: HttpBeginEx) {
    let mut net = match AcceptedStream::accept(header) {
        Ok(net) => net,
        Err(err) => {
            warn!(stream_id = header.stream_id, %err, "rejecting http-kafka stream");
            return;
        }
    };
    let trace_id = header.trace_id;
    net.begin(ctx, trace_id, affinity, Extension::HttpBegin(headers));
    net.end(ctx, trace_id, Extension::None);
    net.reset(ctx, trace_id, Extension::None);
}
