//! gRPC client engine.
//!
//! The mirror image of the server: an application stream opened with
//! [`GrpcBeginEx`] becomes an outbound HTTP/2 request. Application messages
//! gain their 5-byte prefix on the way out and lose it on the way back; the
//! response status, carried either in trailers-only headers or in trailers,
//! decides whether the application reply ends, aborts or resets.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::message::{encode_prefix, MessageDecoder, MESSAGE_PREFIX};
use super::metadata::{collect, to_header};
use super::route::GrpcRouter;
use super::status::{self, CONTENT_TYPE_GRPC};
use crate::core::time::Clock;
use crate::engine::{
    AcceptedStream, BufferSizing, EngineContext, Frame, FrameHeader, FrameKind, OpenedStream,
    StreamFactory, StreamIds, FLAG_INIT,
};
use crate::ext::{Extension, GrpcAbortEx, GrpcBeginEx, GrpcDataEx, GrpcResetEx, HttpBeginEx, HttpEndEx};

/// Accepts application call streams and opens one HTTP request per call.
pub struct GrpcClientFactory {
    ctx: EngineContext,
    router: Box<dyn GrpcRouter>,
    clients: HashMap<u64, GrpcClient>,
}

impl GrpcClientFactory {
    pub fn new(router: Box<dyn GrpcRouter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ctx: EngineContext::new(clock, BufferSizing::default()),
            router,
            clients: HashMap::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.clients.len()
    }

    fn reap(&mut self, owner: u64) {
        if !self.clients.get(&owner).is_some_and(GrpcClient::is_done) {
            return;
        }
        if let Some(client) = self.clients.remove(&owner) {
            self.ctx.budgets.release(client.app.ids.reply_id);
            self.ctx.budgets.release(client.net.ids.initial_id);
            self.ctx.unbind_pair(client.app.ids.initial_id);
            self.ctx.unbind_pair(client.net.ids.initial_id);
            debug!(stream_id = owner, "grpc client call released");
        }
    }
}

impl StreamFactory for GrpcClientFactory {
    fn handle(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();
        let Some(owner) = self.ctx.owner(stream_id) else {
            if let FrameKind::Begin { affinity, extension } = &frame.kind {
                if !EngineContext::is_supplied(stream_id) {
                    let begin = extension.grpc_begin().cloned().unwrap_or_default();
                    if let Some(client) =
                        GrpcClient::accept(&mut self.ctx, self.router.as_ref(), &frame.header, *affinity, begin)
                    {
                        self.ctx.bind_pair(stream_id, stream_id);
                        self.ctx.bind_pair(client.net.ids.initial_id, stream_id);
                        self.clients.insert(stream_id, client);
                    }
                    return;
                }
            }
            debug!(stream_id, frame = frame.name(), "grpc client frame for unknown stream");
            return;
        };
        if let Some(client) = self.clients.get_mut(&owner) {
            client.on_frame(&mut self.ctx, frame);
        }
        self.reap(owner);
    }

    fn context(&mut self) -> &mut EngineContext {
        &mut self.ctx
    }
}

struct GrpcClient {
    app: AcceptedStream,
    net: OpenedStream,
    trace_id: u64,
    affinity: u64,
    call: GrpcBeginEx,
    decoder: MessageDecoder,
    carried: u32,
}

impl GrpcClient {
    fn accept(
        ctx: &mut EngineContext,
        router: &dyn GrpcRouter,
        header: &FrameHeader,
        affinity: u64,
        call: GrpcBeginEx,
    ) -> Option<Self> {
        let mut app = match AcceptedStream::accept(header) {
            Ok(app) => app,
            Err(err) => {
                warn!(stream_id = header.stream_id, %err, "rejecting grpc client stream");
                return None;
            }
        };
        let trace_id = header.trace_id;
        let Some(route_id) = router.resolve(&call.service, &call.method, &call.metadata) else {
            info!(service = %call.service, method = %call.method, "no grpc client route");
            let reset = GrpcResetEx::status(status::UNIMPLEMENTED);
            app.reset(ctx, trace_id, Extension::GrpcReset(reset));
            return None;
        };

        let ids = StreamIds::new(
            app.ids.routed_id,
            route_id,
            ctx.supply_initial_id(),
            app.ids.authorization,
        );
        let mut net = OpenedStream::new(ids);
        net.initial.seq = app.initial.seq;
        net.initial.ack = app.initial.ack;

        let mut headers = HttpBeginEx::new()
            .with(":method", "POST")
            .with(":scheme", call.scheme.as_str())
            .with(":authority", call.authority.as_str())
            .with(":path", format!("/{}/{}", call.service, call.method))
            .with("content-type", CONTENT_TYPE_GRPC)
            .with("te", "trailers");
        headers.headers.extend(call.metadata.iter().map(to_header));
        net.begin(ctx, trace_id, affinity, Extension::HttpBegin(headers));
        debug!(service = %call.service, method = %call.method, route_id, "grpc client call opened");

        Some(Self {
            app,
            net,
            trace_id,
            affinity,
            call,
            decoder: MessageDecoder::new(),
            carried: 0,
        })
    }

    /// An application reply that never began needs no closing.
    fn is_done(&self) -> bool {
        self.net.state.closed()
            && self.app.state.initial_closed()
            && (self.app.state.reply_closed() || !self.app.state.reply_opening())
    }

    fn on_frame(&mut self, ctx: &mut EngineContext, frame: Frame) {
        self.trace_id = frame.header.trace_id;
        let stream_id = frame.stream_id();
        if stream_id == self.app.ids.initial_id || stream_id == self.app.ids.reply_id {
            self.on_application(ctx, frame);
        } else {
            self.on_network(ctx, frame);
        }
    }

    fn on_application(&mut self, ctx: &mut EngineContext, frame: Frame) {
        let Frame { header, kind } = frame;
        let trace_id = self.trace_id;
        match kind {
            FrameKind::Data {
                flags,
                reserved,
                payload,
                extension,
                ..
            } => {
                if let Err(err) = self.app.on_data(&header, reserved) {
                    warn!(stream_id = header.stream_id, %err, "grpc client request flow violated");
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
                if let Err(err) =
                    self.net
                        .data(ctx, trace_id, flags, reserved, Some(payload), Extension::None)
                {
                    warn!(stream_id = self.net.ids.initial_id, %err, "grpc client request exceeded window");
                    self.fail(ctx);
                }
            }
            FrameKind::End { .. } => {
                let _ = self.app.on_end(&header);
                self.net.end(ctx, trace_id, Extension::None);
            }
            FrameKind::Abort { .. } => {
                let _ = self.app.on_end(&header);
                self.net.abort(ctx, trace_id, Extension::None);
            }
            FrameKind::Flush { reserved, .. } => {
                if self.app.on_data(&header, reserved).is_err() {
                    self.fail(ctx);
                    return;
                }
                self.net.flush(ctx, trace_id, Extension::None);
            }
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                if let Err(err) = self.app.on_window(&header, budget_id, padding) {
                    warn!(stream_id = header.stream_id, %err, "grpc client reply window invalid");
                    self.fail(ctx);
                    return;
                }
                let (ack, max) = (self.app.reply.ack, self.app.reply.max);
                self.net.window_with(ctx, trace_id, ack, max, budget_id, padding);
            }
            FrameKind::Reset { .. } => {
                self.app.on_reset(ctx);
                self.net.reset(ctx, trace_id, Extension::None);
                self.net.abort(ctx, trace_id, Extension::None);
            }
            FrameKind::Begin { .. } | FrameKind::Signal { .. } => {}
        }
    }

    fn on_network(&mut self, ctx: &mut EngineContext, frame: Frame) {
        let Frame { header, kind } = frame;
        let trace_id = self.trace_id;
        match kind {
            FrameKind::Begin { extension, .. } => {
                if let Err(err) = self.net.on_begin(&header) {
                    warn!(stream_id = header.stream_id, %err, "grpc response begin invalid");
                    self.fail(ctx);
                    return;
                }
                let default = HttpBeginEx::default();
                self.on_response_headers(ctx, extension.http_begin().unwrap_or(&default));
            }
            FrameKind::Data {
                reserved, payload, ..
            } => {
                if let Err(err) = self.net.on_data(&header, reserved) {
                    warn!(stream_id = header.stream_id, %err, "grpc response flow violated");
                    self.fail(ctx);
                    return;
                }
                self.forward_response(ctx, reserved, payload.unwrap_or_default());
            }
            FrameKind::End { extension } => {
                let _ = self.net.on_end(&header);
                if self.decoder.finish().is_err() {
                    self.abort_reply(ctx, status::INTERNAL, None);
                    return;
                }
                let default = HttpEndEx::default();
                let trailers = extension.http_end().unwrap_or(&default);
                match trailers.trailer("grpc-status") {
                    Some(status::OK) => self.app.end(ctx, trace_id, Extension::None),
                    code => {
                        let code = code.unwrap_or(status::ABORTED).to_string();
                        let message = trailers.trailer("grpc-message").map(str::to_owned);
                        self.abort_reply(ctx, &code, message);
                    }
                }
            }
            FrameKind::Abort { .. } => {
                let _ = self.net.on_end(&header);
                self.abort_reply(ctx, status::ABORTED, None);
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
                    warn!(stream_id = header.stream_id, %err, "grpc request window invalid");
                    self.fail(ctx);
                    return;
                }
                let (ack, max) = (self.net.initial.ack, self.net.initial.max);
                let padding = padding + MESSAGE_PREFIX as u32;
                self.app.window_with(ctx, trace_id, ack, max, budget_id, padding);
            }
            FrameKind::Reset { .. } => {
                self.net.on_reset(ctx);
                let reset = GrpcResetEx::status(status::ABORTED);
                self.app.reset(ctx, trace_id, Extension::GrpcReset(reset));
                self.net.reset(ctx, trace_id, Extension::None);
            }
            FrameKind::Signal { .. } => {}
        }
    }

    fn on_response_headers(&mut self, ctx: &mut EngineContext, headers: &HttpBeginEx) {
        let trace_id = self.trace_id;
        let grpc_status = headers.header("grpc-status");
        if headers.status() != Some("200") || grpc_status.is_some_and(|s| s != status::OK) {
            let code = grpc_status.unwrap_or(status::INTERNAL);
            debug!(http_status = ?headers.status(), code, "grpc call failed");
            let reset = GrpcResetEx {
                status: code.to_string(),
                message: headers.header("grpc-message").map(str::to_owned),
            };
            self.app.reset(ctx, trace_id, Extension::GrpcReset(reset));
            self.net.abort(ctx, trace_id, Extension::None);
            self.net.reset(ctx, trace_id, Extension::None);
            return;
        }

        let reply = GrpcBeginEx {
            scheme: self.call.scheme.clone(),
            authority: self.call.authority.clone(),
            service: self.call.service.clone(),
            method: self.call.method.clone(),
            metadata: collect(&headers.headers),
        };
        self.app.reply.seq = self.net.reply.seq;
        self.app.reply.ack = self.net.reply.ack;
        self.app.begin(ctx, trace_id, self.affinity, Extension::GrpcBegin(reply));
        if grpc_status.is_some() {
            // trailers-only success
            self.app.end(ctx, trace_id, Extension::None);
        }
    }

    fn forward_response(&mut self, ctx: &mut EngineContext, reserved: u32, payload: Bytes) {
        let fragments = match self.decoder.decode(&payload) {
            Ok(fragments) => fragments,
            Err(err) => {
                warn!(stream_id = self.net.ids.reply_id, %err, "grpc response undecodable");
                self.abort_reply(ctx, status::INTERNAL, None);
                self.net.reset(ctx, self.trace_id, Extension::None);
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
                warn!(stream_id = self.app.ids.reply_id, %err, "grpc response exceeded window");
                self.fail(ctx);
                return;
            }
        }
    }

    fn abort_reply(&mut self, ctx: &mut EngineContext, code: &str, message: Option<String>) {
        let abort = GrpcAbortEx {
            status: code.to_string(),
            message,
        };
        self.app.abort(ctx, self.trace_id, Extension::GrpcAbort(abort));
    }

    fn fail(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.trace_id;
        self.net.abort(ctx, trace_id, Extension::None);
        self.net.reset(ctx, trace_id, Extension::None);
        self.app.reset(ctx, trace_id, Extension::GrpcReset(GrpcResetEx::status(status::INTERNAL)));
        self.app.abort(ctx, trace_id, Extension::None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{GrpcConfig, GrpcRouteConfig};
    use crate::core::time::ManualClock;
    use crate::engine::FLAG_FIN;
    use crate::ext::GrpcMetadata;
    use crate::grpc::message::prefixed;
    use crate::grpc::route::ConfigGrpcRouter;

    const APP: u64 = 5;

    fn factory() -> GrpcClientFactory {
        let router = ConfigGrpcRouter::new(&GrpcConfig {
            routes: vec![GrpcRouteConfig {
                id: 9,
                service: "example.EchoService".into(),
                method: None,
                metadata: HashMap::new(),
            }],
            ..GrpcConfig::default()
        });
        GrpcClientFactory::new(Box::new(router), Arc::new(ManualClock::new(0)))
    }

    fn header(stream_id: u64) -> FrameHeader {
        FrameHeader {
            origin_id: 1,
            routed_id: 2,
            stream_id,
            ..FrameHeader::default()
        }
    }

    fn call() -> GrpcBeginEx {
        GrpcBeginEx {
            scheme: "http".into(),
            authority: "localhost:8080".into(),
            service: "example.EchoService".into(),
            method: "EchoUnary".into(),
            metadata: vec![GrpcMetadata::binary("trace", Bytes::from_static(&[1, 2, 3]))],
        }
    }

    fn open(factory: &mut GrpcClientFactory) -> u64 {
        factory.handle(Frame::begin(header(APP), 0, Extension::GrpcBegin(call())));
        let frames = factory.drain();
        let request = frames[0].extension().http_begin().unwrap();
        assert_eq!(request.method(), Some("POST"));
        assert_eq!(request.path(), Some("/example.EchoService/EchoUnary"));
        assert_eq!(request.header("te"), Some("trailers"));
        assert_eq!(request.header("trace-bin"), Some("AQID"));
        frames[0].stream_id()
    }

    #[test]
    fn unary_call_round_trip() {
        let mut factory = factory();
        let net = open(&mut factory);

        factory.handle(Frame::window(FrameHeader { maximum: 1024, ..header(net) }, 0, 0, 0));
        let frames = factory.drain();
        assert_eq!(frames[0].stream_id(), APP);
        assert_eq!(frames[0].header.maximum, 1024);
        assert!(matches!(frames[0].kind, FrameKind::Window { padding: 5, .. }));

        let message = Bytes::from_static(b"hi");
        factory.handle(Frame::data(header(APP), FLAG_INIT | FLAG_FIN, 0, 7, Some(message), Extension::None));
        let frames = factory.drain();
        assert_eq!(frames[0].payload(), prefixed(0, b"hi").as_ref());

        let response = HttpBeginEx::new()
            .with(":status", "200")
            .with("content-type", "application/grpc");
        factory.handle(Frame::begin(header(net ^ 1), 0, Extension::HttpBegin(response)));
        let frames = factory.drain();
        assert_eq!(frames[0].name(), "BEGIN");
        assert_eq!(frames[0].stream_id(), APP ^ 1);

        factory.handle(Frame::window(FrameHeader { maximum: 1024, ..header(APP ^ 1) }, 0, 0, 0));
        factory.drain();
        let body = prefixed(0, b"ok");
        factory.handle(Frame::data(header(net ^ 1), FLAG_INIT | FLAG_FIN, 0, 7, Some(body), Extension::None));
        let end = HttpEndEx::default().with("grpc-status", "0");
        factory.handle(Frame::end(FrameHeader { sequence: 7, ..header(net ^ 1) }, Extension::HttpEnd(end)));
        let frames = factory.drain();
        assert_eq!(frames[0].payload(), b"ok");
        assert_eq!(frames[1].name(), "END");
        assert_eq!(frames[1].stream_id(), APP ^ 1);
    }

    #[test]
    fn error_status_resets_application() {
        let mut factory = factory();
        let net = open(&mut factory);
        let response = HttpBeginEx::new()
            .with(":status", "200")
            .with("grpc-status", "5")
            .with("grpc-message", "missing");
        factory.handle(Frame::begin(header(net ^ 1), 0, Extension::HttpBegin(response)));
        let frames = factory.drain();
        let reset = frames.iter().find(|f| f.name() == "RESET" && f.stream_id() == APP).unwrap();
        let ex = reset.extension().grpc_reset().unwrap();
        assert_eq!(ex.status, "5");
        assert_eq!(ex.message.as_deref(), Some("missing"));
    }

    #[test]
    fn trailer_status_aborts_application() {
        let mut factory = factory();
        let net = open(&mut factory);
        let response = HttpBeginEx::new().with(":status", "200");
        factory.handle(Frame::begin(header(net ^ 1), 0, Extension::HttpBegin(response)));
        let end = HttpEndEx::default().with("grpc-status", "13");
        factory.handle(Frame::end(header(net ^ 1), Extension::HttpEnd(end)));
        let frames = factory.drain();
        let abort = frames.iter().find(|f| f.name() == "ABORT").unwrap();
        assert_eq!(abort.extension().grpc_abort().unwrap().status, "13");
    }

    #[test]
    fn unrouted_call_is_reset() {
        let mut factory = factory();
        let begin = GrpcBeginEx {
            service: "other.Service".into(),
            ..call()
        };
        factory.handle(Frame::begin(header(APP), 0, Extension::GrpcBegin(begin)));
        let frames = factory.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].name(), "RESET");
        assert_eq!(factory.calls(), 0);
    }
}
