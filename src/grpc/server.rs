//! gRPC server engine.
//!
//! Accepts HTTP/2 request streams carrying gRPC calls and proxies each one to
//! an application stream carrying whole messages. The application side sees
//! [`GrpcBeginEx`] metadata and message fragments with the 5-byte prefixes
//! removed; replies are reframed and terminated with a status whose encoding
//! depends on the request content type.
//!
//! Windows are mirrored between the two sides so that every DATA frame can be
//! forwarded with its reservation unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::health::{HealthServer, HEALTH_SERVICE};
use super::message::{encode_prefix, MessageDecoder, MESSAGE_PREFIX};
use super::metadata::{to_header, RequestHead};
use super::route::{GrpcRouter, RouteId};
use super::status::{self, ContentType, GrpcStatus};
use crate::core::config::GrpcConfig;
use crate::core::time::Clock;
use crate::engine::{
    AcceptedStream, BufferSizing, EngineContext, Frame, FrameHeader, FrameKind, OpenedStream,
    StreamFactory, StreamIds, TimerHandle, FLAG_FIN, FLAG_INIT,
};
use crate::ext::{Extension, GrpcAbortEx, GrpcBeginEx, GrpcDataEx, HttpBeginEx};

/// Fires when the `grpc-timeout` of a call elapses.
pub const SIGNAL_DEADLINE: u32 = 1;

pub(super) struct GrpcEnv {
    pub(super) config: GrpcConfig,
    pub(super) router: Box<dyn GrpcRouter>,
}

enum ServerCall {
    Proxy(GrpcServer),
    Health(HealthServer),
}

impl ServerCall {
    fn is_done(&self) -> bool {
        match self {
            ServerCall::Proxy(server) => server.is_done(),
            ServerCall::Health(health) => health.is_done(),
        }
    }

    fn release(&mut self, ctx: &mut EngineContext) {
        match self {
            ServerCall::Proxy(server) => server.release(ctx),
            ServerCall::Health(health) => {
                let (initial_id, reply_id) = health.stream_ids();
                ctx.budgets.release(reply_id);
                ctx.unbind_pair(initial_id);
            }
        }
    }
}

/// Accepts gRPC request streams and dispatches every inbound frame to the
/// call that owns its stream id.
pub struct GrpcServerFactory {
    ctx: EngineContext,
    env: GrpcEnv,
    calls: HashMap<u64, ServerCall>,
}

impl GrpcServerFactory {
    pub fn new(config: GrpcConfig, router: Box<dyn GrpcRouter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ctx: EngineContext::new(clock, BufferSizing::default()),
            env: GrpcEnv { config, router },
            calls: HashMap::new(),
        }
    }

    /// Calls still in flight.
    pub fn calls(&self) -> usize {
        self.calls.len()
    }

    fn admit(&mut self, header: &FrameHeader, affinity: u64, extension: &Extension) {
        let stream_id = header.stream_id;
        let default = HttpBeginEx::default();
        let head = RequestHead::parse(extension.http_begin().unwrap_or(&default));

        if head.method.as_deref() != Some("POST") {
            debug!(stream_id, method = ?head.method, "grpc request is not a POST");
            reject(&mut self.ctx, header, affinity, status::rejection("405", Some(status::INTERNAL)));
            return;
        }
        let Some((service, method)) = head.service_method() else {
            debug!(stream_id, path = ?head.path, "grpc request path unparsable");
            reject(&mut self.ctx, header, affinity, status::rejection("200", Some(status::UNIMPLEMENTED)));
            return;
        };
        let Some(content_type) = head.content_type.as_deref().and_then(ContentType::from_header) else {
            debug!(stream_id, content_type = ?head.content_type, "unsupported grpc content type");
            reject(&mut self.ctx, header, affinity, status::rejection("415", None));
            return;
        };
        if head.te.as_deref() != Some("trailers") {
            debug!(stream_id, te = ?head.te, "grpc request without te: trailers");
            reject(&mut self.ctx, header, affinity, status::rejection("200", Some(status::ABORTED)));
            return;
        }

        if service == HEALTH_SERVICE {
            if let Some(health) = HealthServer::accept(
                &mut self.ctx,
                header,
                affinity,
                &method,
                self.env.config.initial_window,
            ) {
                self.ctx.bind_pair(stream_id, stream_id);
                self.calls.insert(stream_id, ServerCall::Health(health));
            }
            return;
        }

        let Some(route_id) = self.env.router.resolve(&service, &method, &head.metadata) else {
            info!(stream_id, service, method, "no grpc route");
            reject(&mut self.ctx, header, affinity, status::rejection("200", Some(status::UNIMPLEMENTED)));
            return;
        };
        let call = CallTarget {
            route_id,
            service,
            method,
            content_type,
        };
        if let Some(server) = GrpcServer::accept(&mut self.ctx, header, affinity, head, call) {
            self.ctx.bind_pair(stream_id, stream_id);
            self.ctx.bind_pair(server.app.ids.initial_id, stream_id);
            self.calls.insert(stream_id, ServerCall::Proxy(server));
        }
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
                match self.calls.get_mut(&owner) {
                    Some(ServerCall::Proxy(server)) => server.on_budget_ready(&mut self.ctx),
                    Some(ServerCall::Health(health)) => health.on_budget_ready(&mut self.ctx),
                    None => {}
                }
                self.reap(owner);
            }
        }
    }

    fn reap(&mut self, owner: u64) {
        if !self.calls.get(&owner).is_some_and(ServerCall::is_done) {
            return;
        }
        if let Some(mut call) = self.calls.remove(&owner) {
            call.release(&mut self.ctx);
            debug!(stream_id = owner, "grpc call released");
        }
    }
}

impl StreamFactory for GrpcServerFactory {
    fn handle(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();
        let Some(owner) = self.ctx.owner(stream_id) else {
            if let FrameKind::Begin { affinity, extension } = &frame.kind {
                if !EngineContext::is_supplied(stream_id) {
                    self.admit(&frame.header, *affinity, extension);
                    return;
                }
            }
            debug!(stream_id, frame = frame.name(), "grpc frame for unknown stream");
            return;
        };
        let services = self.env.router.health_services();
        match self.calls.get_mut(&owner) {
            Some(ServerCall::Proxy(server)) => server.on_frame(&mut self.ctx, frame),
            Some(ServerCall::Health(health)) => health.on_frame(&mut self.ctx, services, frame),
            None => {}
        }
        self.flush_budgets();
        self.reap(owner);
    }

    fn context(&mut self) -> &mut EngineContext {
        &mut self.ctx
    }
}

/// Answer a request that never reaches a route, without keeping any state.
fn reject(ctx: &mut EngineContext, header: &FrameHeader, affinity: u64, headers: HttpBeginEx) {
    let mut net = match AcceptedStream::accept(header) {
        Ok(net) => net,
        Err(err) => {
            warn!(stream_id = header.stream_id, %err, "rejecting grpc stream");
            return;
        }
    };
    let trace_id = header.trace_id;
    net.begin(ctx, trace_id, affinity, Extension::HttpBegin(headers));
    net.end(ctx, trace_id, Extension::None);
    net.reset(ctx, trace_id, Extension::None);
}

struct CallTarget {
    route_id: RouteId,
    service: String,
    method: String,
    content_type: ContentType,
}

/// One proxied call: the accepted network stream and the application stream
/// opened for it.
pub(super) struct GrpcServer {
    net: AcceptedStream,
    app: OpenedStream,
    trace_id: u64,
    affinity: u64,
    content_type: ContentType,
    /// Request content type, echoed on the response.
    content_type_header: String,
    decoder: MessageDecoder,
    /// Reservation of inbound chunks that produced no fragment yet.
    carried: u32,
    deadline: Option<TimerHandle>,
    /// gRPC-Web status waiting for reply window.
    web_status: Option<GrpcStatus>,
}

impl GrpcServer {
    fn accept(
        ctx: &mut EngineContext,
        header: &FrameHeader,
        affinity: u64,
        head: RequestHead,
        call: CallTarget,
    ) -> Option<Self> {
        let net = match AcceptedStream::accept(header) {
            Ok(net) => net,
            Err(err) => {
                warn!(stream_id = header.stream_id, %err, "rejecting grpc stream");
                return None;
            }
        };
        let trace_id = header.trace_id;
        let ids = StreamIds::new(
            net.ids.routed_id,
            call.route_id,
            ctx.supply_initial_id(),
            net.ids.authorization,
        );
        let mut app = OpenedStream::new(ids);
        app.initial.seq = net.initial.seq;
        app.initial.ack = net.initial.ack;

        let content_type_header = head
            .content_type
            .clone()
            .unwrap_or_else(|| status::CONTENT_TYPE_GRPC.to_string());
        let begin = GrpcBeginEx {
            scheme: head.scheme,
            authority: head.authority,
            service: call.service,
            method: call.method,
            metadata: head.metadata,
        };
        debug!(
            stream_id = header.stream_id,
            service = %begin.service,
            method = %begin.method,
            route_id = call.route_id,
            "grpc call accepted"
        );
        app.begin(ctx, trace_id, affinity, Extension::GrpcBegin(begin));

        let mut server = Self {
            net,
            app,
            trace_id,
            affinity,
            content_type: call.content_type,
            content_type_header,
            decoder: MessageDecoder::new(),
            carried: 0,
            deadline: None,
            web_status: None,
        };
        if let Some(timeout) = head.timeout_millis.filter(|t| *t > 0) {
            let target = server.net.signal_target(trace_id);
            server.deadline =
                Some(ctx.signal_at(ctx.now_millis() + timeout, target, SIGNAL_DEADLINE, 0));
        }
        Some(server)
    }

    pub(super) fn is_done(&self) -> bool {
        self.net.state.closed() && self.app.state.closed()
    }

    fn on_frame(&mut self, ctx: &mut EngineContext, frame: Frame) {
        self.trace_id = frame.header.trace_id;
        let stream_id = frame.stream_id();
        if stream_id == self.net.ids.initial_id || stream_id == self.net.ids.reply_id {
            self.on_network(ctx, frame);
        } else {
            self.on_application(ctx, frame);
        }
        self.settle(ctx);
    }

    fn on_budget_ready(&mut self, ctx: &mut EngineContext) {
        self.flush_web_status(ctx);
        self.settle(ctx);
    }

    fn on_network(&mut self, ctx: &mut EngineContext, frame: Frame) {
        let Frame { header, kind } = frame;
        let trace_id = self.trace_id;
        match kind {
            FrameKind::Data {
                reserved, payload, ..
            } => {
                if let Err(err) = self.net.on_data(&header, reserved) {
                    warn!(stream_id = header.stream_id, %err, "grpc request flow violated");
                    self.fail(ctx);
                    return;
                }
                self.forward_request(ctx, reserved, payload.unwrap_or_default());
            }
            FrameKind::End { .. } => {
                if let Err(err) = self.net.on_end(&header) {
                    debug!(stream_id = header.stream_id, %err, "grpc request end out of sequence");
                }
                if let Err(err) = self.decoder.finish() {
                    warn!(stream_id = header.stream_id, %err, "grpc request truncated");
                    self.fail_request(ctx);
                    return;
                }
                self.app.end(ctx, trace_id, Extension::None);
            }
            FrameKind::Abort { .. } => {
                let _ = self.net.on_end(&header);
                self.app.abort(ctx, trace_id, Extension::None);
            }
            FrameKind::Flush { reserved, .. } => {
                if self.net.on_data(&header, reserved).is_err() {
                    self.fail(ctx);
                    return;
                }
                self.app.flush(ctx, trace_id, Extension::None);
            }
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                if let Err(err) = self.net.on_window(&header, budget_id, padding) {
                    warn!(stream_id = header.stream_id, %err, "grpc reply window invalid");
                    self.fail(ctx);
                    return;
                }
                self.flush_web_status(ctx);
                self.mirror_reply_window(ctx, budget_id, padding);
            }
            FrameKind::Reset { .. } => {
                self.net.on_reset(ctx);
                self.app.reset(ctx, trace_id, Extension::None);
            }
            FrameKind::Signal { signal_id, .. } => {
                if signal_id == SIGNAL_DEADLINE {
                    self.deadline = None;
                    self.on_deadline(ctx);
                }
            }
            FrameKind::Begin { .. } => {}
        }
    }

    /// Strip message prefixes and forward each fragment to the application.
    fn forward_request(&mut self, ctx: &mut EngineContext, reserved: u32, payload: Bytes) {
        let fragments = match self.decoder.decode(&payload) {
            Ok(fragments) => fragments,
            Err(err) => {
                warn!(stream_id = self.net.ids.initial_id, %err, "grpc request undecodable");
                self.fail_request(ctx);
                return;
            }
        };
        let mut reserved = reserved + std::mem::take(&mut self.carried);
        if fragments.is_empty() {
            self.carried = reserved;
            return;
        }
        for fragment in fragments {
            let extension = if fragment.flags & FLAG_INIT != 0 && fragment.deferred > 0 {
                Extension::GrpcData(GrpcDataEx {
                    deferred: fragment.deferred,
                })
            } else {
                Extension::None
            };
            let result = self.app.data(
                ctx,
                self.trace_id,
                fragment.flags,
                std::mem::take(&mut reserved),
                Some(fragment.payload),
                extension,
            );
            if let Err(err) = result {
                warn!(stream_id = self.app.ids.initial_id, %err, "grpc request exceeded window");
                self.fail(ctx);
                return;
            }
        }
    }

    fn on_application(&mut self, ctx: &mut EngineContext, frame: Frame) {
        let Frame { header, kind } = frame;
        let trace_id = self.trace_id;
        match kind {
            FrameKind::Begin { extension, .. } => {
                if let Err(err) = self.app.on_begin(&header) {
                    warn!(stream_id = header.stream_id, %err, "grpc reply begin invalid");
                    self.fail(ctx);
                    return;
                }
                self.begin_reply(ctx, extension.grpc_begin());
            }
            FrameKind::Data {
                flags,
                reserved,
                payload,
                extension,
                ..
            } => {
                if let Err(err) = self.app.on_data(&header, reserved) {
                    warn!(stream_id = header.stream_id, %err, "grpc reply flow violated");
                    self.fail(ctx);
                    return;
                }
                let payload = payload.unwrap_or_default();
                let payload = if flags & FLAG_INIT != 0 {
                    let deferred = extension.grpc_data().map_or(0, |ex| ex.deferred);
                    let mut out = BytesMut::with_capacity(MESSAGE_PREFIX + payload.len());
                    encode_prefix(&mut out, 0, payload.len() as u32 + deferred);
                    out.extend_from_slice(&payload);
                    out.freeze()
                } else {
                    payload
                };
                let result =
                    self.net
                        .data(ctx, trace_id, flags, reserved, Some(payload), Extension::None);
                if let Err(err) = result {
                    warn!(stream_id = self.net.ids.reply_id, %err, "grpc reply exceeded window");
                    self.fail(ctx);
                }
            }
            FrameKind::End { .. } => {
                let _ = self.app.on_end(&header);
                self.send_status(ctx, GrpcStatus::ok());
            }
            FrameKind::Abort { extension } => {
                let _ = self.app.on_end(&header);
                let status = extension
                    .grpc_abort()
                    .map(|ex| GrpcStatus::with_message(ex.status.clone(), ex.message.clone()))
                    .unwrap_or_else(|| GrpcStatus::new(status::ABORTED));
                self.send_status(ctx, status);
            }
            FrameKind::Reset { extension } => {
                self.app.on_reset(ctx);
                let status = extension
                    .grpc_reset()
                    .map(|ex| GrpcStatus::with_message(ex.status.clone(), ex.message.clone()))
                    .unwrap_or_else(|| GrpcStatus::new(status::INTERNAL));
                self.net.reset(ctx, trace_id, Extension::None);
                self.send_status(ctx, status);
                self.app.reset(ctx, trace_id, Extension::None);
            }
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                if let Err(err) = self.app.on_window(&header, budget_id, padding) {
                    warn!(stream_id = header.stream_id, %err, "grpc request window invalid");
                    self.fail(ctx);
                    return;
                }
                let (ack, max) = (self.app.initial.ack, self.app.initial.max);
                self.net.window_with(ctx, trace_id, ack, max, budget_id, padding);
            }
            FrameKind::Flush { reserved, .. } => {
                if self.app.on_data(&header, reserved).is_err() {
                    self.fail(ctx);
                    return;
                }
                self.net.flush(ctx, trace_id, Extension::None);
            }
            FrameKind::Signal { .. } => {}
        }
    }

    fn begin_reply(&mut self, ctx: &mut EngineContext, begin: Option<&GrpcBeginEx>) {
        let mut headers = HttpBeginEx::new()
            .with(":status", "200")
            .with("content-type", self.content_type_header.as_str())
            .with("grpc-encoding", "identity");
        for metadata in begin.map(|ex| ex.metadata.as_slice()).unwrap_or_default() {
            headers.headers.push(to_header(metadata));
        }
        self.net.reply.seq = self.app.reply.seq;
        self.net.reply.ack = self.app.reply.ack;
        self.net.begin(ctx, self.trace_id, self.affinity, Extension::HttpBegin(headers));
    }

    /// Offer the network reply window to the application, leaving room for
    /// the message prefix added to each reply message.
    fn mirror_reply_window(&mut self, ctx: &mut EngineContext, budget_id: u64, padding: u32) {
        if !self.app.state.reply_opened() {
            return;
        }
        let (ack, max) = (self.net.reply.ack, self.net.reply.max);
        self.app.window_with(
            ctx,
            self.trace_id,
            ack,
            max,
            budget_id,
            padding + MESSAGE_PREFIX as u32,
        );
    }

    /// Terminate the response with `status` in the form the content type uses.
    fn send_status(&mut self, ctx: &mut EngineContext, status: GrpcStatus) {
        if self.net.state.reply_closed() || self.web_status.is_some() {
            return;
        }
        ctx.cancel(&mut self.deadline);
        let trace_id = self.trace_id;
        debug!(stream_id = self.net.ids.initial_id, status = %status.code, "grpc call complete");
        if !self.net.state.reply_opening() {
            let headers = status.trailers_only(&self.content_type_header);
            self.net.begin(ctx, trace_id, self.affinity, Extension::HttpBegin(headers));
            self.net.end(ctx, trace_id, Extension::None);
            return;
        }
        match self.content_type {
            ContentType::Grpc => {
                self.net.end(ctx, trace_id, Extension::HttpEnd(status.trailers()));
            }
            ContentType::GrpcWebProto => {
                self.web_status = Some(status);
                self.flush_web_status(ctx);
            }
        }
    }

    fn flush_web_status(&mut self, ctx: &mut EngineContext) {
        let Some(status) = &self.web_status else {
            return;
        };
        if self.net.state.reply_closed() {
            self.web_status = None;
            return;
        }
        let trailer = status.web_trailer();
        let Some(reserved) = self.net.claim_whole(ctx, trailer.len()) else {
            return;
        };
        let trace_id = self.trace_id;
        self.web_status = None;
        let flags = FLAG_INIT | FLAG_FIN;
        match self.net.data(ctx, trace_id, flags, reserved, Some(trailer), Extension::None) {
            Ok(()) => self.net.end(ctx, trace_id, Extension::None),
            Err(err) => {
                warn!(stream_id = self.net.ids.reply_id, %err, "grpc-web trailer exceeded window");
                self.net.abort(ctx, trace_id, Extension::None);
            }
        }
    }

    fn on_deadline(&mut self, ctx: &mut EngineContext) {
        info!(stream_id = self.net.ids.initial_id, "grpc deadline exceeded");
        let trace_id = self.trace_id;
        self.send_status(ctx, GrpcStatus::new(status::DEADLINE_EXCEEDED));
        self.net.reset(ctx, trace_id, Extension::None);
        let abort = GrpcAbortEx::status(status::DEADLINE_EXCEEDED);
        self.app.abort(ctx, trace_id, Extension::GrpcAbort(abort));
        self.app.reset(ctx, trace_id, Extension::None);
    }

    /// The request stream could not be reframed.
    fn fail_request(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.trace_id;
        self.net.reset(ctx, trace_id, Extension::None);
        self.app.abort(ctx, trace_id, Extension::None);
        self.app.reset(ctx, trace_id, Extension::None);
        self.send_status(ctx, GrpcStatus::new(status::INTERNAL));
    }

    fn fail(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.trace_id;
        ctx.cancel(&mut self.deadline);
        self.web_status = None;
        self.net.reset(ctx, trace_id, Extension::None);
        self.net.abort(ctx, trace_id, Extension::None);
        self.app.abort(ctx, trace_id, Extension::None);
        self.app.reset(ctx, trace_id, Extension::None);
    }

    /// Close whichever side is left dangling once the other has finished.
    fn settle(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.trace_id;
        if self.net.state.closed() && !self.app.state.closed() {
            self.app.abort(ctx, trace_id, Extension::None);
            self.app.reset(ctx, trace_id, Extension::None);
        }
        if self.net.state.reply_closed() && self.app.state.reply_closed() && !self.net.state.initial_closed()
        {
            self.net.reset(ctx, trace_id, Extension::None);
            self.app.abort(ctx, trace_id, Extension::None);
        }
    }

    fn release(&mut self, ctx: &mut EngineContext) {
        ctx.cancel(&mut self.deadline);
        ctx.budgets.release(self.net.ids.reply_id);
        ctx.budgets.release(self.app.ids.initial_id);
        ctx.unbind_pair(self.net.ids.initial_id);
        ctx.unbind_pair(self.app.ids.initial_id);
    }
}
