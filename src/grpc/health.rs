//! Inline answers for `grpc.health.v1.Health`.
//!
//! Health checks never reach a route: the request message is decoded by hand
//! (field 1, a length-delimited service name) and answered from the set of
//! services the router reports as serving.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::message::{prefixed, MESSAGE_PREFIX};
use super::status::{GrpcStatus, CONTENT_TYPE_GRPC, UNIMPLEMENTED};
use crate::engine::{AcceptedStream, EngineContext, Frame, FrameHeader, FrameKind, FLAG_FIN, FLAG_INIT};
use crate::ext::{Extension, HttpBeginEx};

pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

const CHECK_METHOD: &str = "Check";
const SERVICE_FIELD_KEY: u8 = 0x0A;
const STATUS_FIELD_KEY: u8 = 0x08;
const SERVING: u8 = 1;
const SERVICE_UNKNOWN: &[u8] = b"grpc-status: 5\r\ngrpc-message: SERVICE_UNKNOWN\r\n";

fn read_varint(buf: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *buf.get(*cursor)?;
        *cursor += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// Service name from a framed `HealthCheckRequest`; empty when absent or malformed.
pub fn decode_request(message: &[u8]) -> String {
    let mut cursor = MESSAGE_PREFIX;
    if message.get(cursor) != Some(&SERVICE_FIELD_KEY) {
        return String::new();
    }
    cursor += 1;
    let Some(length) = read_varint(message, &mut cursor) else {
        return String::new();
    };
    let end = cursor.saturating_add(length as usize);
    match message.get(cursor..end) {
        Some(name) => String::from_utf8_lossy(name).into_owned(),
        None => String::new(),
    }
}

/// Framed `HealthCheckResponse` carrying `status`.
pub fn encode_response(status: u8) -> Bytes {
    prefixed(0, &[STATUS_FIELD_KEY, status])
}

pub(super) struct HealthServer {
    net: AcceptedStream,
    trace_id: u64,
    window: u32,
    request: BytesMut,
    /// Whether the requested service is known, once the request is complete.
    verdict: Option<bool>,
    responded: bool,
}

impl HealthServer {
    pub(super) fn accept(
        ctx: &mut EngineContext,
        header: &FrameHeader,
        affinity: u64,
        method: &str,
        window: u32,
    ) -> Option<Self> {
        let mut net = match AcceptedStream::accept(header) {
            Ok(net) => net,
            Err(err) => {
                warn!(stream_id = header.stream_id, %err, "rejecting health stream");
                return None;
            }
        };
        let trace_id = header.trace_id;
        if method != CHECK_METHOD {
            debug!(method, "unsupported health method");
            let status = GrpcStatus::new(UNIMPLEMENTED).trailers_only(CONTENT_TYPE_GRPC);
            net.begin(ctx, trace_id, affinity, Extension::HttpBegin(status));
            net.end(ctx, trace_id, Extension::None);
            net.reset(ctx, trace_id, Extension::None);
            return None;
        }
        let headers = HttpBeginEx::new()
            .with(":status", "200")
            .with("content-type", CONTENT_TYPE_GRPC);
        net.begin(ctx, trace_id, affinity, Extension::HttpBegin(headers));
        net.window(ctx, trace_id, window);
        Some(Self {
            net,
            trace_id,
            window,
            request: BytesMut::new(),
            verdict: None,
            responded: false,
        })
    }

    pub(super) fn is_done(&self) -> bool {
        self.net.state.closed()
    }

    pub(super) fn stream_ids(&self) -> (u64, u64) {
        (self.net.ids.initial_id, self.net.ids.reply_id)
    }

    pub(super) fn on_frame(&mut self, ctx: &mut EngineContext, services: &[String], frame: Frame) {
        let Frame { header, kind } = frame;
        self.trace_id = header.trace_id;
        match kind {
            FrameKind::Data {
                reserved, payload, ..
            } => {
                if let Err(err) = self.net.on_data(&header, reserved) {
                    warn!(stream_id = header.stream_id, %err, "health request flow violated");
                    self.fail(ctx);
                    return;
                }
                if let Some(payload) = payload {
                    self.request.extend_from_slice(&payload);
                }
                self.net.window(ctx, self.trace_id, self.window);
                if self.request_complete() {
                    self.decide(services);
                }
                self.respond(ctx);
            }
            FrameKind::End { .. } => {
                if let Err(err) = self.net.on_end(&header) {
                    debug!(stream_id = header.stream_id, %err, "health end out of sequence");
                }
                self.decide(services);
                self.respond(ctx);
            }
            FrameKind::Abort { .. } => {
                let _ = self.net.on_end(&header);
                self.net.abort(ctx, self.trace_id, Extension::None);
            }
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                if let Err(err) = self.net.on_window(&header, budget_id, padding) {
                    warn!(stream_id = header.stream_id, %err, "health reply window invalid");
                    self.fail(ctx);
                    return;
                }
                self.respond(ctx);
            }
            FrameKind::Reset { .. } => {
                self.net.on_reset(ctx);
                self.net.reset(ctx, self.trace_id, Extension::None);
            }
            FrameKind::Flush { reserved, .. } => {
                if self.net.on_data(&header, reserved).is_err() {
                    self.fail(ctx);
                }
            }
            FrameKind::Begin { .. } | FrameKind::Signal { .. } => {}
        }
    }

    pub(super) fn on_budget_ready(&mut self, ctx: &mut EngineContext) {
        self.respond(ctx);
    }

    fn request_complete(&self) -> bool {
        if self.request.len() < MESSAGE_PREFIX {
            return false;
        }
        let length = u32::from_be_bytes([
            self.request[1],
            self.request[2],
            self.request[3],
            self.request[4],
        ]) as usize;
        self.request.len() >= MESSAGE_PREFIX + length
    }

    fn decide(&mut self, services: &[String]) {
        if self.verdict.is_some() {
            return;
        }
        let service = decode_request(&self.request);
        let known = service.is_empty() || services.iter().any(|s| *s == service);
        debug!(service = %service, known, "health check");
        self.verdict = Some(known);
    }

    fn respond(&mut self, ctx: &mut EngineContext) {
        if self.responded || self.net.state.reply_closed() {
            return;
        }
        let Some(known) = self.verdict else {
            return;
        };
        let (flags, body) = if known {
            (FLAG_INIT | FLAG_FIN, encode_response(SERVING))
        } else {
            (FLAG_FIN, Bytes::from_static(SERVICE_UNKNOWN))
        };
        let Some(reserved) = self.net.claim_whole(ctx, body.len()) else {
            return;
        };
        if let Err(err) = self.net.data(ctx, self.trace_id, flags, reserved, Some(body), Extension::None) {
            warn!(%err, "health response exceeded window");
            self.fail(ctx);
            return;
        }
        self.responded = true;
        let end = if known {
            Extension::HttpEnd(GrpcStatus::ok().trailers())
        } else {
            Extension::None
        };
        self.net.end(ctx, self.trace_id, end);
    }

    fn fail(&mut self, ctx: &mut EngineContext) {
        self.net.reset(ctx, self.trace_id, Extension::None);
        self.net.abort(ctx, self.trace_id, Extension::None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_service_name() {
        let request = prefixed(0, &[0x0A, 0x03, b'f', b'o', b'o']);
        assert_eq!(decode_request(&request), "foo");
    }

    #[test]
    fn malformed_request_names_no_service() {
        assert_eq!(decode_request(&prefixed(0, &[])), "");
        assert_eq!(decode_request(&prefixed(0, &[0x12, 0x01, b'x'])), "");
        assert_eq!(decode_request(&prefixed(0, &[0x0A, 0x09, b'x'])), "");
        assert_eq!(decode_request(&[0, 0]), "");
    }

    #[test]
    fn serving_response_layout() {
        assert_eq!(encode_response(SERVING).as_ref(), &[0, 0, 0, 0, 2, 0x08, 0x01]);
    }
}
