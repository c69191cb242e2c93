//! Produce proxies.
//!
//! A request body becomes one Kafka record. With a reply topic the record
//! carries a correlation id, and a correlater stream fetches the matching
//! reply record to answer the request, either synchronously or through a
//! `202 Accepted` pointing at a later lookup.

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{EngineContext, FlowError, FrameHeader, FLAG_FIN, FLAG_INCOMPLETE, FLAG_INIT};
use crate::ext::{
    Extension, HttpBeginEx, KafkaAckMode, KafkaBeginEx, KafkaCapabilities, KafkaCondition,
    KafkaDataEx, KafkaFilter, KafkaHeader, KafkaPartitionOffset,
};

use super::etag;
use super::hash::ProduceHash;
use super::proxy::{
    content_length, HttpEvent, HttpExchange, HttpProxy, KafkaData, KafkaRole, KafkaStream,
};
use super::route::{HttpKafkaRoute, RouteId, CORRELATION_ID_PARAM};

/// Request headers that describe the HTTP exchange rather than the record.
const HOP_HEADERS: [&str; 2] = ["content-length", "prefer"];

/// The record a produce request writes, and how its reply is correlated.
#[derive(Debug, Clone)]
pub(super) struct ProduceRecord {
    topic: String,
    key: Option<String>,
    reply_to: Option<String>,
    /// Record etag from an `if-match` precondition.
    if_match: Option<String>,
    correlation_header: String,
    reply_to_header: String,
    ack_mode: KafkaAckMode,
    hash: ProduceHash,
}

impl ProduceRecord {
    pub(super) fn resolve(route: &HttpKafkaRoute, headers: &HttpBeginEx) -> Self {
        let idempotency_key = headers
            .header(&route.idempotency_header)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let if_match = headers
            .header("if-match")
            .and_then(etag::split)
            .and_then(|(_, record)| record)
            .map(str::to_string);
        Self {
            topic: route.topic.clone(),
            key: route.key.clone(),
            reply_to: route.reply_to.clone(),
            if_match,
            correlation_header: route.correlation_header.clone(),
            reply_to_header: route.reply_to_header.clone(),
            ack_mode: route.ack_mode,
            hash: ProduceHash::new(idempotency_key),
        }
    }

    pub(super) fn producer_begin(&self) -> KafkaBeginEx {
        KafkaBeginEx {
            capabilities: KafkaCapabilities::ProduceOnly,
            topic: self.topic.clone(),
            partitions: Vec::new(),
            filters: Vec::new(),
            ack_mode: self.ack_mode,
        }
    }

    /// Metadata of the first record frame, hashing key and headers as it goes.
    pub(super) fn first_frame(&mut self, headers: &HttpBeginEx, deferred: u32, timestamp: i64) -> KafkaDataEx {
        let key = self.key.as_ref().map(|key| {
            self.hash.update(key.as_bytes());
            Bytes::from(key.clone())
        });

        let mut record_headers = Vec::new();
        for header in &headers.headers {
            let name = header.name.as_str();
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            let value = if name.eq_ignore_ascii_case("if-match") {
                match &self.if_match {
                    Some(record) => record.as_str(),
                    None => continue,
                }
            } else {
                header.value.as_str()
            };
            self.hash.update(name.as_bytes());
            self.hash.update(value.as_bytes());
            record_headers.push(KafkaHeader::new(name, Bytes::from(value.to_string())));
        }
        if let Some(reply_to) = &self.reply_to {
            self.hash.update(self.reply_to_header.as_bytes());
            self.hash.update(reply_to.as_bytes());
            record_headers.push(KafkaHeader::new(
                self.reply_to_header.clone(),
                Bytes::from(reply_to.clone()),
            ));
        }

        KafkaDataEx {
            deferred,
            timestamp,
            partition: KafkaPartitionOffset::any(),
            progress: Vec::new(),
            key,
            headers: record_headers,
        }
    }

    /// Metadata of the closing record frame, naming the correlation id.
    pub(super) fn last_frame(&mut self) -> KafkaDataEx {
        let correlation_id = self.hash.digest().to_string();
        KafkaDataEx {
            headers: vec![KafkaHeader::new(self.correlation_header.clone(), correlation_id)],
            ..KafkaDataEx::default()
        }
    }

    pub(super) fn correlation_id(&mut self) -> String {
        self.hash.digest().to_string()
    }
}

/// Fetch of the reply record carrying `correlation_id`.
pub(super) fn correlater_begin(
    reply_to: &str,
    correlation_header: &str,
    correlation_id: &str,
    ack_mode: KafkaAckMode,
) -> KafkaBeginEx {
    KafkaBeginEx {
        capabilities: KafkaCapabilities::FetchOnly,
        topic: reply_to.to_string(),
        partitions: vec![KafkaPartitionOffset::historical()],
        filters: vec![KafkaFilter {
            conditions: vec![KafkaCondition::Header {
                name: correlation_header.to_string(),
                value: Bytes::from(correlation_id.to_string()),
            }],
        }],
        ack_mode,
    }
}

/// Response headers taken from a correlated reply record.
pub(super) fn correlated_response(
    ex: Option<&KafkaDataEx>,
    correlation_header: &str,
    content_length: usize,
) -> HttpBeginEx {
    let headers = ex.map(|ex| ex.headers.as_slice()).unwrap_or_default();
    let status = headers
        .iter()
        .find(|h| h.name == ":status")
        .and_then(KafkaHeader::value_str)
        .unwrap_or("200");
    let mut response = HttpBeginEx::new().with(":status", status);
    for header in headers {
        if header.name == ":status" || header.name == correlation_header {
            continue;
        }
        if let Some(value) = header.value_str() {
            response.push(header.name.clone(), value);
        }
    }
    if status != "204" && !response.contains("content-length") {
        response.push("content-length", content_length.to_string());
    }
    response
}

/// `202 Accepted` pointing at where the reply can be looked up.
pub(super) fn accepted_response(location: Option<&str>, correlation_id: &str) -> HttpBeginEx {
    let mut response = HttpBeginEx::new()
        .with(":status", "202")
        .with("content-length", "0");
    if let Some(location) = location {
        let param = format!("{{{CORRELATION_ID_PARAM}}}");
        response.push("location", location.replace(&param, correlation_id));
    }
    response
}

/// Forward a correlated reply record onto the HTTP response.
fn forward_reply(
    ctx: &mut EngineContext,
    http: &mut HttpExchange,
    correlater: &mut KafkaStream,
    correlation_header: &str,
    data: KafkaData,
) -> Result<(), FlowError> {
    let trace_id = http.trace_id;
    if http.net.state.reply_closing() || http.net.state.reply_closed() {
        correlater.ack_reply(ctx, trace_id);
        return Ok(());
    }
    if data.flags & FLAG_INIT != 0 {
        let ex = data.extension.kafka_data();
        let length = data.payload.as_ref().map_or(0, Bytes::len) + ex.map_or(0, |ex| ex.deferred as usize);
        http.respond(ctx, correlated_response(ex, correlation_header, length));
    }
    if let Some(payload) = data.payload.filter(|p| !p.is_empty()) {
        http.forward(ctx, data.flags, data.reserved, payload)?;
    }
    if data.flags & FLAG_FIN != 0 {
        correlater.end(ctx, trace_id);
        http.net.state.closing_reply();
    }
    correlater.mirror_reply(ctx, http, 0);
    Ok(())
}

/// Produce a record and answer `204` once Kafka acknowledges it.
pub(super) struct NoReplyProxy {
    http: HttpExchange,
    producer: KafkaStream,
    fin_sent: bool,
}

impl NoReplyProxy {
    pub(super) fn accept(
        ctx: &mut EngineContext,
        header: &FrameHeader,
        affinity: u64,
        route: &HttpKafkaRoute,
        headers: &HttpBeginEx,
    ) -> Result<Self, FlowError> {
        let mut record = ProduceRecord::resolve(route, headers);
        let http = HttpExchange::accept(header, affinity)?;
        let mut producer =
            KafkaStream::open(ctx, &http, route.id, KafkaRole::Producer, record.producer_begin());

        let tombstone = headers
            .method()
            .is_some_and(|method| method.eq_ignore_ascii_case("DELETE"));
        let (flags, payload, deferred) = if tombstone {
            (FLAG_INIT | FLAG_FIN, None, 0)
        } else {
            (FLAG_INIT, Some(Bytes::new()), content_length(headers))
        };
        let first = record.first_frame(headers, deferred, ctx.now_millis());
        producer.data(ctx, http.trace_id, flags, 0, payload, Extension::KafkaData(first))?;

        Ok(Self {
            http,
            producer,
            fin_sent: tombstone,
        })
    }

    fn fail(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.http.trace_id;
        self.http.fail(ctx);
        self.producer.cleanup(ctx, trace_id);
    }
}

impl HttpProxy for NoReplyProxy {
    fn parts(&mut self) -> (&mut HttpExchange, Vec<&mut KafkaStream>) {
        (&mut self.http, vec![&mut self.producer])
    }

    fn on_http(&mut self, ctx: &mut EngineContext, event: HttpEvent) {
        let trace_id = self.http.trace_id;
        match event {
            HttpEvent::Data {
                flags,
                reserved,
                payload,
            } => {
                let flags = flags & !(FLAG_INIT | FLAG_FIN);
                let sent = self
                    .producer
                    .data(ctx, trace_id, flags, reserved, payload, Extension::None);
                if let Err(err) = sent {
                    warn!(stream_id = self.http.owner(), %err, "request body overran record window");
                    self.fail(ctx);
                }
            }
            HttpEvent::End => {
                if !self.fin_sent {
                    self.fin_sent = true;
                    let sent = self.producer.data(
                        ctx,
                        trace_id,
                        FLAG_FIN,
                        0,
                        Some(Bytes::new()),
                        Extension::None,
                    );
                    if sent.is_err() {
                        self.fail(ctx);
                        return;
                    }
                }
                self.producer.end_deferred(ctx, trace_id);
            }
            HttpEvent::Abort => {
                self.producer.abort(ctx, trace_id);
                self.http.abort(ctx);
            }
            HttpEvent::Window => {}
            HttpEvent::Reset => {
                self.producer.cleanup(ctx, trace_id);
                self.http.net.reset(ctx, trace_id, Extension::None);
            }
        }
    }

    fn on_kafka_begin(&mut self, _ctx: &mut EngineContext, _role: KafkaRole, _extension: Extension) {}

    fn on_kafka_data(&mut self, ctx: &mut EngineContext, _role: KafkaRole, _data: KafkaData) {
        let trace_id = self.http.trace_id;
        self.producer.ack_reply(ctx, trace_id);
    }

    fn on_kafka_end(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.http.respond_status(ctx, "204");
        if self.http.net.state.initial_closed() {
            let trace_id = self.http.trace_id;
            self.producer.end(ctx, trace_id);
        }
        self.http.end(ctx);
    }

    fn on_kafka_abort(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.fail(ctx);
    }

    fn on_kafka_window(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.http.mirror_request(ctx, &self.producer.stream.initial);
    }

    fn on_kafka_reset(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.fail(ctx);
    }

    fn on_kafka_signal(&mut self, _ctx: &mut EngineContext, _role: KafkaRole, _signal_id: u32) {}
}

/// How a produce request with a reply topic is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ReplyMode {
    /// Answer with the correlated reply, or 500 if none arrives in time.
    Sync,
    /// Answer 202 once produced, unless `await_reply` and the reply arrives
    /// within the client's wait.
    Async { await_reply: bool },
}

/// Produce a record, then answer with its correlated reply.
pub(super) struct ProduceProxy {
    http: HttpExchange,
    producer: KafkaStream,
    correlater: Option<KafkaStream>,
    record: ProduceRecord,
    mode: ReplyMode,
    route_id: RouteId,
    async_location: Option<String>,
    wait_millis: i64,
}

impl ProduceProxy {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn accept(
        ctx: &mut EngineContext,
        header: &FrameHeader,
        affinity: u64,
        route: &HttpKafkaRoute,
        headers: &HttpBeginEx,
        mode: ReplyMode,
        wait_secs: u64,
    ) -> Result<Self, FlowError> {
        let mut record = ProduceRecord::resolve(route, headers);
        let http = HttpExchange::accept(header, affinity)?;
        let mut producer =
            KafkaStream::open(ctx, &http, route.id, KafkaRole::Producer, record.producer_begin());
        let first = record.first_frame(headers, content_length(headers), ctx.now_millis());
        producer.data(
            ctx,
            http.trace_id,
            FLAG_INIT,
            0,
            Some(Bytes::new()),
            Extension::KafkaData(first),
        )?;
        Ok(Self {
            http,
            producer,
            correlater: None,
            record,
            mode,
            route_id: route.id,
            async_location: route.async_location.clone(),
            wait_millis: wait_secs as i64 * 1000,
        })
    }

    fn awaits_reply(&self) -> bool {
        matches!(self.mode, ReplyMode::Sync | ReplyMode::Async { await_reply: true })
    }

    /// Close the produced record once the correlater is in place.
    ///
    /// A reply that arrives before this point belongs to an earlier identical
    /// request, so the record is marked incomplete and Kafka drops it.
    fn finish_record(&mut self, ctx: &mut EngineContext, flags: u8) {
        if self.producer.ending() {
            return;
        }
        let trace_id = self.http.trace_id;
        let last = self.record.last_frame();
        let sent = self.producer.data(
            ctx,
            trace_id,
            flags,
            0,
            Some(Bytes::new()),
            Extension::KafkaData(last),
        );
        if sent.is_err() {
            self.fail(ctx);
            return;
        }
        self.producer.end_deferred(ctx, trace_id);
    }

    fn open_correlater(&mut self, ctx: &mut EngineContext) {
        let Some(reply_to) = self.record.reply_to.clone() else {
            return;
        };
        let correlation_id = self.record.correlation_id();
        debug!(stream_id = self.http.owner(), %correlation_id, "awaiting correlated reply");
        let begin = correlater_begin(
            &reply_to,
            &self.record.correlation_header,
            &correlation_id,
            self.record.ack_mode,
        );
        let mut correlater = KafkaStream::open(ctx, &self.http, self.route_id, KafkaRole::Correlater, begin);
        correlater.arm_wait(ctx, self.http.trace_id, self.wait_millis);
        self.correlater = Some(correlater);
    }

    fn fail(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.http.trace_id;
        self.http.fail(ctx);
        self.producer.cleanup(ctx, trace_id);
        if let Some(correlater) = &mut self.correlater {
            correlater.cleanup(ctx, trace_id);
        }
    }
}

impl HttpProxy for ProduceProxy {
    fn parts(&mut self) -> (&mut HttpExchange, Vec<&mut KafkaStream>) {
        let mut kafkas = vec![&mut self.producer];
        kafkas.extend(self.correlater.as_mut());
        (&mut self.http, kafkas)
    }

    fn on_http(&mut self, ctx: &mut EngineContext, event: HttpEvent) {
        let trace_id = self.http.trace_id;
        match event {
            HttpEvent::Data {
                flags,
                reserved,
                payload,
            } => {
                if let Some(payload) = &payload {
                    self.record.hash.update(payload);
                }
                let flags = flags & !(FLAG_INIT | FLAG_FIN);
                let sent = self
                    .producer
                    .data(ctx, trace_id, flags, reserved, payload, Extension::None);
                if let Err(err) = sent {
                    warn!(stream_id = self.http.owner(), %err, "request body overran record window");
                    self.fail(ctx);
                }
            }
            HttpEvent::End => self.open_correlater(ctx),
            HttpEvent::Abort => {
                self.producer.abort(ctx, trace_id);
                if let Some(correlater) = &mut self.correlater {
                    correlater.abort(ctx, trace_id);
                }
                self.http.abort(ctx);
            }
            HttpEvent::Window => {
                if let Some(correlater) = &mut self.correlater {
                    correlater.mirror_reply(ctx, &self.http, 0);
                }
            }
            HttpEvent::Reset => {
                self.producer.cleanup(ctx, trace_id);
                if let Some(correlater) = &mut self.correlater {
                    correlater.cleanup(ctx, trace_id);
                }
                self.http.net.reset(ctx, trace_id, Extension::None);
            }
        }
    }

    fn on_kafka_begin(&mut self, ctx: &mut EngineContext, role: KafkaRole, _extension: Extension) {
        if role == KafkaRole::Correlater {
            if let Some(correlater) = &mut self.correlater {
                correlater.mirror_reply(ctx, &self.http, 0);
            }
        }
    }

    fn on_kafka_data(&mut self, ctx: &mut EngineContext, role: KafkaRole, data: KafkaData) {
        if role == KafkaRole::Producer {
            let trace_id = self.http.trace_id;
            self.producer.ack_reply(ctx, trace_id);
            return;
        }
        self.finish_record(ctx, FLAG_INCOMPLETE);
        let Some(correlater) = &mut self.correlater else {
            return;
        };
        let forwarded = forward_reply(ctx, &mut self.http, correlater, &self.record.correlation_header, data);
        if let Err(err) = forwarded {
            warn!(stream_id = self.http.owner(), %err, "reply record overran response window");
            self.fail(ctx);
        }
    }

    fn on_kafka_flush(&mut self, ctx: &mut EngineContext, role: KafkaRole) {
        if role == KafkaRole::Correlater {
            self.finish_record(ctx, FLAG_FIN);
        }
    }

    fn on_kafka_end(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        let replied = self
            .correlater
            .as_ref()
            .is_some_and(|c| c.stream.state.reply_closed());
        if self.awaits_reply() && !replied {
            return;
        }
        if !self.http.begun() {
            match self.mode {
                ReplyMode::Sync => self.http.respond_status(ctx, "500"),
                ReplyMode::Async { .. } => {
                    let correlation_id = self.record.correlation_id();
                    let accepted = accepted_response(self.async_location.as_deref(), &correlation_id);
                    self.http.respond(ctx, accepted);
                }
            }
        }
        if self.http.net.state.initial_closed() {
            let trace_id = self.http.trace_id;
            self.producer.end(ctx, trace_id);
            if let Some(correlater) = &mut self.correlater {
                correlater.end(ctx, trace_id);
            }
        }
        self.http.end(ctx);
    }

    fn on_kafka_abort(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.fail(ctx);
    }

    fn on_kafka_window(&mut self, ctx: &mut EngineContext, role: KafkaRole) {
        if role == KafkaRole::Producer {
            self.http.mirror_request(ctx, &self.producer.stream.initial);
        }
    }

    fn on_kafka_reset(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.fail(ctx);
    }

    fn on_kafka_signal(&mut self, ctx: &mut EngineContext, _role: KafkaRole, _signal_id: u32) {
        debug!(stream_id = self.http.owner(), "correlated reply wait expired");
        let trace_id = self.http.trace_id;
        if let Some(correlater) = &mut self.correlater {
            correlater.end(ctx, trace_id);
        }
    }
}

/// Look up the reply of an earlier asynchronous produce.
pub(super) struct CorrelateProxy {
    http: HttpExchange,
    correlater: KafkaStream,
    correlation_header: String,
    correlation_id: String,
    async_location: Option<String>,
    initial_window: u32,
}

impl CorrelateProxy {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn accept(
        ctx: &mut EngineContext,
        header: &FrameHeader,
        affinity: u64,
        route: &HttpKafkaRoute,
        reply_to: &str,
        correlation_id: String,
        wait_secs: u64,
        initial_window: u32,
    ) -> Result<Self, FlowError> {
        let mut http = HttpExchange::accept(header, affinity)?;
        http.ack_request(ctx, initial_window);
        let begin = correlater_begin(reply_to, &route.correlation_header, &correlation_id, route.ack_mode);
        let mut correlater = KafkaStream::open(ctx, &http, route.id, KafkaRole::Correlater, begin);
        correlater.arm_wait(ctx, http.trace_id, wait_secs as i64 * 1000);
        Ok(Self {
            http,
            correlater,
            correlation_header: route.correlation_header.clone(),
            correlation_id,
            async_location: route.async_location.clone(),
            initial_window,
        })
    }

    fn fail(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.http.trace_id;
        self.http.fail(ctx);
        self.correlater.cleanup(ctx, trace_id);
    }
}

impl HttpProxy for CorrelateProxy {
    fn parts(&mut self) -> (&mut HttpExchange, Vec<&mut KafkaStream>) {
        (&mut self.http, vec![&mut self.correlater])
    }

    fn on_http(&mut self, ctx: &mut EngineContext, event: HttpEvent) {
        let trace_id = self.http.trace_id;
        match event {
            HttpEvent::Data { .. } => self.http.ack_request(ctx, self.initial_window),
            HttpEvent::End => {
                if self.correlater.stream.state.reply_closed() {
                    self.correlater.end(ctx, trace_id);
                }
            }
            HttpEvent::Abort => {
                self.correlater.abort(ctx, trace_id);
                self.http.abort(ctx);
            }
            HttpEvent::Window => self.correlater.mirror_reply(ctx, &self.http, 0),
            HttpEvent::Reset => {
                self.correlater.cleanup(ctx, trace_id);
                self.http.net.reset(ctx, trace_id, Extension::None);
            }
        }
    }

    fn on_kafka_begin(&mut self, ctx: &mut EngineContext, _role: KafkaRole, _extension: Extension) {
        self.correlater.mirror_reply(ctx, &self.http, 0);
    }

    fn on_kafka_data(&mut self, ctx: &mut EngineContext, _role: KafkaRole, data: KafkaData) {
        let forwarded = forward_reply(
            ctx,
            &mut self.http,
            &mut self.correlater,
            &self.correlation_header,
            data,
        );
        if let Err(err) = forwarded {
            warn!(stream_id = self.http.owner(), %err, "reply record overran response window");
            self.fail(ctx);
        }
    }

    fn on_kafka_end(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        if !self.http.begun() {
            let accepted = accepted_response(self.async_location.as_deref(), &self.correlation_id);
            self.http.respond(ctx, accepted);
        }
        if self.http.net.state.initial_closed() {
            let trace_id = self.http.trace_id;
            self.correlater.end(ctx, trace_id);
        }
        self.http.end(ctx);
    }

    fn on_kafka_abort(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.fail(ctx);
    }

    fn on_kafka_window(&mut self, _ctx: &mut EngineContext, _role: KafkaRole) {}

    fn on_kafka_reset(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.fail(ctx);
    }

    fn on_kafka_signal(&mut self, ctx: &mut EngineContext, _role: KafkaRole, _signal_id: u32) {
        debug!(stream_id = self.http.owner(), correlation_id = %self.correlation_id, "reply lookup wait expired");
        let trace_id = self.http.trace_id;
        self.correlater.end(ctx, trace_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_kafka::route::HttpKafkaCapability;

    fn route() -> HttpKafkaRoute {
        HttpKafkaRoute {
            id: 4,
            capability: HttpKafkaCapability::Produce,
            topic: "requests".into(),
            key: Some("42".into()),
            filters: Vec::new(),
            merge: None,
            reply_to: Some("responses".into()),
            async_location: Some("/items/42;cid={correlationId}".into()),
            correlation_id: None,
            correlation_header: "x-correlation-id".into(),
            reply_to_header: "x-reply-to".into(),
            idempotency_header: "idempotency-key".into(),
            ack_mode: KafkaAckMode::LeaderOnly,
            wait_secs: 60,
        }
    }

    #[test]
    fn request_headers_become_record_headers() {
        let headers = HttpBeginEx::new()
            .with(":method", "PUT")
            .with(":path", "/items/42")
            .with("content-type", "application/json")
            .with("content-length", "12")
            .with("prefer", "wait=5")
            .with("idempotency-key", "k1")
            .with("if-match", "AQAAAAA=/rev-3");
        let mut record = ProduceRecord::resolve(&route(), &headers);
        let first = record.first_frame(&headers, 12, 1_000);

        assert_eq!(first.deferred, 12);
        assert_eq!(first.key, Some(Bytes::from_static(b"42")));
        let names: Vec<_> = first.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                ":method",
                ":path",
                "content-type",
                "idempotency-key",
                "if-match",
                "x-reply-to"
            ]
        );
        assert_eq!(first.header("if-match").and_then(KafkaHeader::value_str), Some("rev-3"));
        assert_eq!(first.header("x-reply-to").and_then(KafkaHeader::value_str), Some("responses"));

        record.hash.update(b"{\"id\":42}");
        let last = record.last_frame();
        let correlation = last.header("x-correlation-id").and_then(KafkaHeader::value_str);
        assert!(correlation.is_some_and(|id| id.starts_with("k1-")));
        assert_eq!(correlation, Some(record.correlation_id().as_str()));
    }

    #[test]
    fn missing_idempotency_key_is_generated() {
        let headers = HttpBeginEx::new().with("content-type", "text/plain");
        let mut record = ProduceRecord::resolve(&route(), &headers);
        let id = record.correlation_id();
        let (key, digest) = id.rsplit_once('-').unwrap();
        assert!(Uuid::parse_str(key).is_ok());
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn correlated_headers_drop_correlation_id() {
        let ex = KafkaDataEx {
            headers: vec![
                KafkaHeader::new("x-correlation-id", "k1-abc"),
                KafkaHeader::new("content-type", "text/plain"),
            ],
            ..KafkaDataEx::default()
        };
        let response = correlated_response(Some(&ex), "x-correlation-id", 5);
        assert_eq!(response.status(), Some("200"));
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.header("content-length"), Some("5"));
        assert!(!response.contains("x-correlation-id"));

        let ex = KafkaDataEx {
            headers: vec![KafkaHeader::new(":status", "204")],
            ..KafkaDataEx::default()
        };
        let response = correlated_response(Some(&ex), "x-correlation-id", 0);
        assert_eq!(response.status(), Some("204"));
        assert!(!response.contains("content-length"));
    }

    #[test]
    fn accepted_points_at_lookup() {
        let response = accepted_response(Some("/items/42;cid={correlationId}"), "k1-abc");
        assert_eq!(response.status(), Some("202"));
        assert_eq!(response.header("content-length"), Some("0"));
        assert_eq!(response.header("location"), Some("/items/42;cid=k1-abc"));
        assert!(!accepted_response(None, "k1-abc").contains("location"));
    }

    #[test]
    fn correlater_filters_on_correlation_header() {
        let begin = correlater_begin("responses", "correlation-id", "k1-abc", KafkaAckMode::None);
        assert_eq!(begin.capabilities, KafkaCapabilities::FetchOnly);
        assert_eq!(begin.topic, "responses");
        assert_eq!(begin.partitions, vec![KafkaPartitionOffset::historical()]);
        assert_eq!(
            begin.filters[0].conditions,
            vec![KafkaCondition::Header {
                name: "correlation-id".into(),
                value: Bytes::from_static(b"k1-abc"),
            }]
        );
    }
}
