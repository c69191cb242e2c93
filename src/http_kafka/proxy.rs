//! Shared shape of every HTTP-Kafka proxy.
//!
//! A proxy owns one accepted HTTP exchange and one or two Kafka streams it
//! opened for it. Frames for the Kafka streams are flow-checked by their
//! [`KafkaStream`] and handed back to the proxy through the `on_kafka_*`
//! hooks of [`HttpProxy`], tagged with the [`KafkaRole`] of the stream.
//!
//! Windows are mirrored: the HTTP request window follows the producing
//! stream's window and the fetching stream's reply window follows the HTTP
//! response window, so forwarded DATA keeps its reservation unchanged. The
//! HTTP side may grant response window before the response begins, since
//! response headers depend on what the first fetched record carries.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::engine::{
    AcceptedStream, EngineContext, Flow, FlowError, Frame, FrameHeader, FrameKind, OpenedStream,
    StreamIds, TimerHandle,
};
use crate::ext::{Extension, HttpBeginEx, KafkaBeginEx};

use super::route::RouteId;

/// Fires when a bounded wait for Kafka records runs out.
pub const SIGNAL_WAIT_EXPIRED: u32 = 1;

/// Which of a proxy's Kafka streams an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KafkaRole {
    Fetcher,
    Producer,
    Correlater,
}

/// HTTP request or response event, after flow accounting.
#[derive(Debug)]
pub(super) enum HttpEvent {
    Data {
        flags: u8,
        reserved: u32,
        payload: Option<Bytes>,
    },
    End,
    Abort,
    Window,
    Reset,
}

/// DATA received on a Kafka reply.
#[derive(Debug)]
pub(super) struct KafkaData {
    pub(super) flags: u8,
    pub(super) reserved: u32,
    pub(super) payload: Option<Bytes>,
    pub(super) extension: Extension,
}

#[derive(Debug)]
enum KafkaEvent {
    Begin(Extension),
    Data(KafkaData),
    Flush,
    End,
    Abort,
    Window,
    Reset,
    Signal(u32),
}

/// Acknowledge position for `to` that leaves as many bytes outstanding as
/// `from` currently has.
pub(super) fn mirrored_ack(from: &Flow, to: &Flow) -> u64 {
    to.seq.saturating_sub(from.seq - from.ack)
}

/// `wait=N` from a `prefer` header, in seconds.
pub(super) fn prefer_wait(headers: &HttpBeginEx) -> Option<u64> {
    prefer_tokens(headers).find_map(|token| token.strip_prefix("wait=")?.parse().ok())
}

/// Whether a `prefer` header asks for `respond-async`.
pub(super) fn prefer_async(headers: &HttpBeginEx) -> bool {
    prefer_tokens(headers).any(|token| token == "respond-async")
}

fn prefer_tokens(headers: &HttpBeginEx) -> impl Iterator<Item = &str> {
    headers
        .header("prefer")
        .into_iter()
        .flat_map(|value| value.split([';', ',']))
        .map(str::trim)
}

/// Declared request body length, zero when absent or unparsable.
pub(super) fn content_length(headers: &HttpBeginEx) -> u32 {
    headers
        .header("content-length")
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// The accepted HTTP side of a proxy.
pub(super) struct HttpExchange {
    pub(super) net: AcceptedStream,
    pub(super) trace_id: u64,
    affinity: u64,
    /// Response headers were sent; a reply WINDOW alone does not count.
    begun: bool,
}

impl HttpExchange {
    pub(super) fn accept(header: &FrameHeader, affinity: u64) -> Result<Self, FlowError> {
        Ok(Self {
            net: AcceptedStream::accept(header)?,
            trace_id: header.trace_id,
            affinity,
            begun: false,
        })
    }

    pub(super) fn owner(&self) -> u64 {
        self.net.ids.initial_id
    }

    pub(super) fn begun(&self) -> bool {
        self.begun
    }

    /// Send response headers, once.
    pub(super) fn respond(&mut self, ctx: &mut EngineContext, headers: HttpBeginEx) {
        if self.begun || self.net.state.reply_closed() {
            return;
        }
        debug!(stream_id = self.owner(), status = ?headers.status(), "http response");
        self.begun = true;
        self.net
            .begin(ctx, self.trace_id, self.affinity, Extension::HttpBegin(headers));
    }

    pub(super) fn respond_status(&mut self, ctx: &mut EngineContext, status: &str) {
        self.respond(ctx, HttpBeginEx::new().with(":status", status));
    }

    pub(super) fn forward(
        &mut self,
        ctx: &mut EngineContext,
        flags: u8,
        reserved: u32,
        payload: Bytes,
    ) -> Result<(), FlowError> {
        self.net
            .data(ctx, self.trace_id, flags, reserved, Some(payload), Extension::None)
    }

    pub(super) fn end(&mut self, ctx: &mut EngineContext) {
        if !self.begun {
            return;
        }
        self.net.end(ctx, self.trace_id, Extension::None);
    }

    pub(super) fn abort(&mut self, ctx: &mut EngineContext) {
        if !self.begun {
            self.respond_status(ctx, "500");
        }
        self.net.abort(ctx, self.trace_id, Extension::None);
    }

    /// Reject the rest of the request and answer 500, or abort a response
    /// already under way.
    pub(super) fn fail(&mut self, ctx: &mut EngineContext) {
        self.net.reset(ctx, self.trace_id, Extension::None);
        if self.begun {
            self.net.abort(ctx, self.trace_id, Extension::None);
        } else {
            self.respond_status(ctx, "500");
            self.net.end(ctx, self.trace_id, Extension::None);
        }
    }

    /// Acknowledge everything received and keep `window` open.
    pub(super) fn ack_request(&mut self, ctx: &mut EngineContext, window: u32) {
        self.net.window(ctx, self.trace_id, window);
    }

    /// Mirror a producing stream's window onto the request.
    pub(super) fn mirror_request(&mut self, ctx: &mut EngineContext, producer: &Flow) {
        let ack = mirrored_ack(producer, &self.net.initial);
        self.net.window_with(
            ctx,
            self.trace_id,
            ack,
            producer.max,
            producer.budget_id,
            producer.pad,
        );
    }

    fn receive(&mut self, ctx: &mut EngineContext, frame: Frame) -> Result<Option<HttpEvent>, FlowError> {
        let Frame { header, kind } = frame;
        self.trace_id = header.trace_id;
        let event = match kind {
            FrameKind::Data {
                flags,
                reserved,
                payload,
                ..
            } => {
                self.net.on_data(&header, reserved)?;
                Some(HttpEvent::Data {
                    flags,
                    reserved,
                    payload,
                })
            }
            FrameKind::Flush { reserved, .. } => {
                self.net.on_data(&header, reserved)?;
                None
            }
            FrameKind::End { .. } => {
                self.net.on_end(&header)?;
                Some(HttpEvent::End)
            }
            FrameKind::Abort { .. } => {
                self.net.on_end(&header)?;
                Some(HttpEvent::Abort)
            }
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                self.net.on_window(&header, budget_id, padding)?;
                Some(HttpEvent::Window)
            }
            FrameKind::Reset { .. } => {
                self.net.on_reset(ctx);
                Some(HttpEvent::Reset)
            }
            FrameKind::Begin { .. } | FrameKind::Signal { .. } => None,
        };
        Ok(event)
    }
}

/// A first record frame held until the stream's initial window opens.
#[derive(Debug)]
struct Deferred {
    flags: u8,
    reserved: u32,
    payload: Option<Bytes>,
    extension: Extension,
}

/// One Kafka stream opened on behalf of an HTTP exchange.
pub(super) struct KafkaStream {
    pub(super) role: KafkaRole,
    pub(super) stream: OpenedStream,
    wait: Option<TimerHandle>,
    deferred: Vec<Deferred>,
    end_deferred: bool,
}

impl KafkaStream {
    /// Open a stream on `route_id` and bind it to the owning exchange.
    pub(super) fn open(
        ctx: &mut EngineContext,
        http: &HttpExchange,
        route_id: RouteId,
        role: KafkaRole,
        begin: KafkaBeginEx,
    ) -> Self {
        let ids = StreamIds::new(
            http.net.ids.routed_id,
            route_id,
            ctx.supply_initial_id(),
            http.net.ids.authorization,
        );
        ctx.bind_pair(ids.initial_id, http.owner());
        debug!(stream_id = ids.initial_id, ?role, topic = %begin.topic, "kafka stream opened");
        let mut stream = OpenedStream::new(ids);
        stream.begin(ctx, http.trace_id, http.affinity, Extension::KafkaBegin(begin));
        Self {
            role,
            stream,
            wait: None,
            deferred: Vec::new(),
            end_deferred: false,
        }
    }

    fn owns(&self, stream_id: u64) -> bool {
        stream_id == self.stream.ids.initial_id || stream_id == self.stream.ids.reply_id
    }

    /// End the stream after `millis` unless it ends first.
    pub(super) fn arm_wait(&mut self, ctx: &mut EngineContext, trace_id: u64, millis: i64) {
        if millis <= 0 {
            return;
        }
        ctx.cancel(&mut self.wait);
        let at = ctx.now_millis() + millis;
        let target = self.stream.signal_target(trace_id);
        self.wait = Some(ctx.signal_at(at, target, SIGNAL_WAIT_EXPIRED, 0));
    }

    /// Send record DATA, holding zero-length frames until the window opens.
    /// Frames queue behind anything already held so records keep their order.
    pub(super) fn data(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: u64,
        flags: u8,
        reserved: u32,
        payload: Option<Bytes>,
        extension: Extension,
    ) -> Result<(), FlowError> {
        if self.stream.state.initial_closed() {
            return Ok(());
        }
        let held = !self.deferred.is_empty() || (reserved == 0 && !self.stream.state.initial_opened());
        if held {
            self.deferred.push(Deferred {
                flags,
                reserved,
                payload,
                extension,
            });
            return Ok(());
        }
        self.stream
            .data(ctx, trace_id, flags, reserved, payload, extension)
    }

    /// End the stream once everything sent has been acknowledged.
    pub(super) fn end_deferred(&mut self, ctx: &mut EngineContext, trace_id: u64) {
        self.end_deferred = true;
        self.stream.state.closing_initial();
        self.end_if_acked(ctx, trace_id);
    }

    fn end_if_acked(&mut self, ctx: &mut EngineContext, trace_id: u64) {
        if self.end_deferred
            && self.deferred.is_empty()
            && self.stream.state.initial_opened()
            && self.stream.initial.seq == self.stream.initial.ack
        {
            self.end(ctx, trace_id);
        }
    }

    /// Whether an END is already sent or scheduled.
    pub(super) fn ending(&self) -> bool {
        self.end_deferred || self.stream.state.initial_closed()
    }

    pub(super) fn end(&mut self, ctx: &mut EngineContext, trace_id: u64) {
        ctx.cancel(&mut self.wait);
        self.stream.end(ctx, trace_id, Extension::None);
    }

    pub(super) fn abort(&mut self, ctx: &mut EngineContext, trace_id: u64) {
        ctx.cancel(&mut self.wait);
        self.stream.abort(ctx, trace_id, Extension::None);
    }

    pub(super) fn reset(&mut self, ctx: &mut EngineContext, trace_id: u64) {
        self.stream.reset(ctx, trace_id, Extension::None);
    }

    /// Close both directions, aborting whatever is still open.
    pub(super) fn cleanup(&mut self, ctx: &mut EngineContext, trace_id: u64) {
        self.abort(ctx, trace_id);
        self.reset(ctx, trace_id);
    }

    /// Acknowledge everything received on the reply.
    pub(super) fn ack_reply(&mut self, ctx: &mut EngineContext, trace_id: u64) {
        let max = self.stream.reply.max;
        self.stream.window(ctx, trace_id, max);
    }

    /// Mirror the HTTP response window onto the reply, with extra padding.
    pub(super) fn mirror_reply(&mut self, ctx: &mut EngineContext, http: &HttpExchange, padding: u32) {
        if !self.stream.state.reply_opened() {
            return;
        }
        let response = &http.net.reply;
        let ack = mirrored_ack(response, &self.stream.reply);
        self.stream.window_with(
            ctx,
            http.trace_id,
            ack,
            response.max,
            response.budget_id,
            response.pad + padding,
        );
    }

    pub(super) fn is_done(&self) -> bool {
        self.stream.state.closed()
    }

    pub(super) fn release(&mut self, ctx: &mut EngineContext) {
        ctx.cancel(&mut self.wait);
        ctx.budgets.release(self.stream.ids.initial_id);
        ctx.unbind_pair(self.stream.ids.initial_id);
    }

    fn receive(&mut self, ctx: &mut EngineContext, frame: Frame) -> Result<KafkaEvent, FlowError> {
        let Frame { header, kind } = frame;
        let event = match kind {
            FrameKind::Begin { extension, .. } => {
                self.stream.on_begin(&header)?;
                KafkaEvent::Begin(extension)
            }
            FrameKind::Data {
                flags,
                reserved,
                payload,
                extension,
                ..
            } => {
                self.stream.on_data(&header, reserved)?;
                ctx.cancel(&mut self.wait);
                KafkaEvent::Data(KafkaData {
                    flags,
                    reserved,
                    payload,
                    extension,
                })
            }
            FrameKind::Flush { reserved, .. } => {
                self.stream.on_data(&header, reserved)?;
                KafkaEvent::Flush
            }
            FrameKind::End { .. } => {
                ctx.cancel(&mut self.wait);
                self.stream.on_end(&header)?;
                KafkaEvent::End
            }
            FrameKind::Abort { .. } => {
                ctx.cancel(&mut self.wait);
                self.stream.on_end(&header)?;
                KafkaEvent::Abort
            }
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                self.stream.on_window(&header, budget_id, padding)?;
                let trace_id = header.trace_id;
                for deferred in std::mem::take(&mut self.deferred) {
                    self.stream.data(
                        ctx,
                        trace_id,
                        deferred.flags,
                        deferred.reserved,
                        deferred.payload,
                        deferred.extension,
                    )?;
                }
                self.end_if_acked(ctx, trace_id);
                KafkaEvent::Window
            }
            FrameKind::Reset { .. } => {
                ctx.cancel(&mut self.wait);
                self.stream.on_reset(ctx);
                KafkaEvent::Reset
            }
            FrameKind::Signal { signal_id, .. } => {
                self.wait = None;
                KafkaEvent::Signal(signal_id)
            }
        };
        Ok(event)
    }
}

enum Routed {
    Http(HttpEvent),
    Kafka(KafkaRole, KafkaEvent),
    HttpViolation(FlowError),
    KafkaViolation(KafkaRole, FlowError),
    Ignored,
}

/// Hooks a concrete proxy implements; dispatch and lifecycle are shared.
pub(super) trait HttpProxy {
    /// The exchange and whichever Kafka streams are open.
    fn parts(&mut self) -> (&mut HttpExchange, Vec<&mut KafkaStream>);

    fn on_http(&mut self, ctx: &mut EngineContext, event: HttpEvent);

    fn on_kafka_begin(&mut self, ctx: &mut EngineContext, role: KafkaRole, extension: Extension);

    fn on_kafka_data(&mut self, ctx: &mut EngineContext, role: KafkaRole, data: KafkaData);

    fn on_kafka_flush(&mut self, _ctx: &mut EngineContext, _role: KafkaRole) {}

    fn on_kafka_end(&mut self, ctx: &mut EngineContext, role: KafkaRole);

    fn on_kafka_abort(&mut self, ctx: &mut EngineContext, role: KafkaRole);

    fn on_kafka_window(&mut self, ctx: &mut EngineContext, role: KafkaRole);

    fn on_kafka_reset(&mut self, ctx: &mut EngineContext, role: KafkaRole);

    /// A wait armed with [`KafkaStream::arm_wait`] expired.
    fn on_kafka_signal(&mut self, ctx: &mut EngineContext, role: KafkaRole, signal_id: u32);

    /// Budget credit arrived for a frame the proxy held back.
    fn on_budget_ready(&mut self, _ctx: &mut EngineContext) {}

    fn on_frame(&mut self, ctx: &mut EngineContext, frame: Frame) {
        let stream_id = frame.stream_id();
        let routed = {
            let (http, kafkas) = self.parts();
            if http.net.ids.initial_id == stream_id || http.net.ids.reply_id == stream_id {
                match http.receive(ctx, frame) {
                    Ok(Some(event)) => Routed::Http(event),
                    Ok(None) => Routed::Ignored,
                    Err(err) => Routed::HttpViolation(err),
                }
            } else if let Some(kafka) = kafkas.into_iter().find(|k| k.owns(stream_id)) {
                let role = kafka.role;
                match kafka.receive(ctx, frame) {
                    Ok(event) => Routed::Kafka(role, event),
                    Err(err) => Routed::KafkaViolation(role, err),
                }
            } else {
                Routed::Ignored
            }
        };

        match routed {
            Routed::Http(event) => self.on_http(ctx, event),
            Routed::Kafka(role, event) => match event {
                KafkaEvent::Begin(extension) => self.on_kafka_begin(ctx, role, extension),
                KafkaEvent::Data(data) => self.on_kafka_data(ctx, role, data),
                KafkaEvent::Flush => self.on_kafka_flush(ctx, role),
                KafkaEvent::End => self.on_kafka_end(ctx, role),
                KafkaEvent::Abort => self.on_kafka_abort(ctx, role),
                KafkaEvent::Window => self.on_kafka_window(ctx, role),
                KafkaEvent::Reset => self.on_kafka_reset(ctx, role),
                KafkaEvent::Signal(signal_id) => self.on_kafka_signal(ctx, role, signal_id),
            },
            Routed::HttpViolation(err) => {
                let (http, kafkas) = self.parts();
                warn!(stream_id, %err, "http flow violated");
                let trace_id = http.trace_id;
                http.fail(ctx);
                for kafka in kafkas {
                    kafka.cleanup(ctx, trace_id);
                }
            }
            Routed::KafkaViolation(role, err) => {
                warn!(stream_id, ?role, %err, "kafka flow violated");
                {
                    let (http, kafkas) = self.parts();
                    let trace_id = http.trace_id;
                    if let Some(kafka) = kafkas.into_iter().find(|k| k.role == role) {
                        kafka.cleanup(ctx, trace_id);
                    }
                }
                self.on_kafka_reset(ctx, role);
            }
            Routed::Ignored => {}
        }
        self.settle(ctx);
    }

    /// Close Kafka streams left open once the exchange is over.
    fn settle(&mut self, ctx: &mut EngineContext) {
        let (http, kafkas) = self.parts();
        if !http.net.state.closed() {
            return;
        }
        let trace_id = http.trace_id;
        for kafka in kafkas {
            if !kafka.is_done() {
                kafka.cleanup(ctx, trace_id);
            }
        }
    }

    fn is_done(&mut self) -> bool {
        let (http, kafkas) = self.parts();
        http.net.state.closed() && kafkas.iter().all(|k| k.is_done())
    }

    fn release(&mut self, ctx: &mut EngineContext) {
        let (http, kafkas) = self.parts();
        for kafka in kafkas {
            kafka.release(ctx);
        }
        ctx.budgets.release(http.net.ids.reply_id);
        ctx.unbind_pair(http.net.ids.initial_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefer_tokens_are_parsed() {
        let headers = HttpBeginEx::new().with("prefer", "respond-async; wait=5");
        assert_eq!(prefer_wait(&headers), Some(5));
        assert!(prefer_async(&headers));

        let headers = HttpBeginEx::new().with("prefer", "wait=x");
        assert_eq!(prefer_wait(&headers), None);
        assert!(!prefer_async(&headers));
        assert_eq!(prefer_wait(&HttpBeginEx::new()), None);
    }

    #[test]
    fn mirrored_ack_keeps_outstanding_bytes() {
        let from = Flow {
            seq: 120,
            ack: 100,
            ..Flow::default()
        };
        let to = Flow {
            seq: 50,
            ack: 0,
            ..Flow::default()
        };
        assert_eq!(mirrored_ack(&from, &to), 30);
        assert_eq!(mirrored_ack(&Flow { seq: 90, ..Flow::default() }, &to), 0);
    }

    #[test]
    fn held_records_are_sent_before_later_ones() {
        use crate::core::time::ManualClock;
        use crate::engine::{BufferSizing, FrameHeader, FLAG_FIN, FLAG_INIT};
        use std::sync::Arc;

        let mut ctx = EngineContext::new(Arc::new(ManualClock::new(0)), BufferSizing::default());
        let ids = StreamIds::new(1, 2, ctx.supply_initial_id(), 0);
        let mut kafka = KafkaStream {
            role: KafkaRole::Producer,
            stream: OpenedStream::new(ids),
            wait: None,
            deferred: Vec::new(),
            end_deferred: false,
        };
        let credit = FrameHeader {
            stream_id: ids.initial_id,
            maximum: 100,
            ..FrameHeader::default()
        };

        kafka
            .data(&mut ctx, 0, FLAG_INIT, 0, Some(Bytes::from_static(b"a")), Extension::None)
            .unwrap();
        // window opened but the held record has not been flushed yet
        kafka.stream.on_window(&credit, 0, 0).unwrap();
        kafka
            .data(&mut ctx, 0, FLAG_FIN, 3, Some(Bytes::from_static(b"bcd")), Extension::None)
            .unwrap();
        assert!(ctx.drain().iter().all(|f| f.name() != "DATA"));

        kafka.receive(&mut ctx, Frame::window(credit, 0, 0, 0)).unwrap();
        let sent: Vec<_> = ctx
            .drain()
            .into_iter()
            .filter(|f| f.name() == "DATA")
            .map(|f| (f.header.sequence, f.payload().to_vec()))
            .collect();
        assert_eq!(sent, vec![(0, b"a".to_vec()), (0, b"bcd".to_vec())]);
        assert_eq!(kafka.stream.initial.seq, 3);
    }

    #[test]
    fn content_length_defaults_to_zero() {
        assert_eq!(content_length(&HttpBeginEx::new().with("content-length", "12")), 12);
        assert_eq!(content_length(&HttpBeginEx::new().with("content-length", "x")), 0);
        assert_eq!(content_length(&HttpBeginEx::new()), 0);
    }
}
