//! Fetch proxies: one record per response, or every matching record merged.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::engine::{EngineContext, FlowError, FrameHeader, FLAG_FIN, FLAG_INIT};
use crate::ext::{
    Extension, HttpBeginEx, KafkaBeginEx, KafkaCapabilities, KafkaCondition, KafkaFilter,
    KafkaPartitionOffset,
};

use super::etag;
use super::proxy::{prefer_wait, HttpEvent, HttpExchange, HttpProxy, KafkaData, KafkaRole, KafkaStream};
use super::route::{HttpKafkaRoute, MergeFraming};

/// What a GET asks of the fetcher, resolved from its route and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct FetchRequest {
    pub(super) begin: KafkaBeginEx,
    /// The `if-none-match` value and its progress etag, when well formed.
    pub(super) if_none_match: Option<(String, String)>,
    pub(super) wait_millis: i64,
}

impl FetchRequest {
    pub(super) fn resolve(route: &HttpKafkaRoute, headers: &HttpBeginEx) -> Self {
        let wait_secs = prefer_wait(headers).map_or(0, |wait| wait.min(route.wait_secs));
        let if_none_match = headers.header("if-none-match").and_then(|value| {
            let (progress, _) = etag::split(value)?;
            Some((value.to_string(), progress.to_string()))
        });

        let decoded = if_none_match.as_ref().and_then(|(_, progress)| {
            if route.merge.is_some() {
                etag::decode_latest(progress)
            } else if wait_secs != 0 {
                etag::decode_live(progress)
            } else {
                etag::decode_historical(progress)
            }
        });
        let partitions = decoded.unwrap_or_else(|| vec![KafkaPartitionOffset::historical()]);

        Self {
            begin: KafkaBeginEx {
                capabilities: KafkaCapabilities::FetchOnly,
                topic: route.topic.clone(),
                partitions,
                filters: filters(route),
                ack_mode: route.ack_mode,
            },
            if_none_match,
            wait_millis: wait_secs as i64 * 1000,
        }
    }
}

/// Key and header filters as a single all-of filter.
fn filters(route: &HttpKafkaRoute) -> Vec<KafkaFilter> {
    let mut conditions = Vec::new();
    if let Some(key) = &route.key {
        conditions.push(KafkaCondition::Key(Bytes::from(key.clone())));
    }
    for (name, value) in &route.filters {
        conditions.push(KafkaCondition::Header {
            name: name.clone(),
            value: Bytes::from(value.clone()),
        });
    }
    if conditions.is_empty() {
        Vec::new()
    } else {
        vec![KafkaFilter { conditions }]
    }
}

/// Response headers for the first record of a single fetch.
fn record_response(data: &KafkaData) -> HttpBeginEx {
    let Some(payload) = &data.payload else {
        return HttpBeginEx::new().with(":status", "404");
    };
    let ex = data.extension.kafka_data();
    let length = payload.len() + ex.map_or(0, |ex| ex.deferred as usize);
    let mut headers = if length == 0 {
        HttpBeginEx::new().with(":status", "204")
    } else {
        HttpBeginEx::new()
            .with(":status", "200")
            .with("content-length", length.to_string())
    };
    if let Some(ex) = ex {
        if let Some(content_type) = ex.header("content-type").and_then(|h| h.value_str()) {
            headers.push("content-type", content_type);
        }
        let progress = etag::encode(&ex.progress);
        let value = match ex.header("etag").and_then(|h| h.value_str()) {
            Some(record) => format!("{progress}/{record}"),
            None => progress,
        };
        headers.push("etag", value);
    }
    headers
}

/// Answers a GET with the first matching record.
pub(super) struct FetchProxy {
    http: HttpExchange,
    fetcher: KafkaStream,
    if_none_match: Option<String>,
    initial_window: u32,
}

impl FetchProxy {
    pub(super) fn accept(
        ctx: &mut EngineContext,
        header: &FrameHeader,
        affinity: u64,
        route: &HttpKafkaRoute,
        headers: &HttpBeginEx,
        initial_window: u32,
    ) -> Result<Self, FlowError> {
        let request = FetchRequest::resolve(route, headers);
        let mut http = HttpExchange::accept(header, affinity)?;
        http.ack_request(ctx, initial_window);
        let mut fetcher = KafkaStream::open(ctx, &http, route.id, KafkaRole::Fetcher, request.begin);
        fetcher.arm_wait(ctx, http.trace_id, request.wait_millis);
        Ok(Self {
            http,
            fetcher,
            if_none_match: request.if_none_match.map(|(value, _)| value),
            initial_window,
        })
    }

    fn fail(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.http.trace_id;
        self.http.fail(ctx);
        self.fetcher.cleanup(ctx, trace_id);
    }
}

impl HttpProxy for FetchProxy {
    fn parts(&mut self) -> (&mut HttpExchange, Vec<&mut KafkaStream>) {
        (&mut self.http, vec![&mut self.fetcher])
    }

    fn on_http(&mut self, ctx: &mut EngineContext, event: HttpEvent) {
        let trace_id = self.http.trace_id;
        match event {
            HttpEvent::Data { .. } => self.http.ack_request(ctx, self.initial_window),
            HttpEvent::End => {
                if self.fetcher.stream.state.reply_closed() {
                    self.fetcher.end(ctx, trace_id);
                }
            }
            HttpEvent::Abort => self.fetcher.abort(ctx, trace_id),
            HttpEvent::Window => self.fetcher.mirror_reply(ctx, &self.http, 0),
            HttpEvent::Reset => self.fetcher.cleanup(ctx, trace_id),
        }
    }

    fn on_kafka_begin(&mut self, ctx: &mut EngineContext, _role: KafkaRole, _extension: Extension) {
        self.fetcher.mirror_reply(ctx, &self.http, 0);
    }

    fn on_kafka_data(&mut self, ctx: &mut EngineContext, _role: KafkaRole, data: KafkaData) {
        let trace_id = self.http.trace_id;
        if self.http.net.state.reply_closing() {
            self.fetcher.ack_reply(ctx, trace_id);
            return;
        }
        if data.flags & FLAG_INIT != 0 {
            self.http.respond(ctx, record_response(&data));
        }
        let fin = data.flags & FLAG_FIN != 0;
        if let Some(payload) = data.payload.filter(|p| !p.is_empty()) {
            if let Err(err) = self.http.forward(ctx, data.flags, data.reserved, payload) {
                warn!(stream_id = self.http.owner(), %err, "fetched record overran response window");
                self.fail(ctx);
                return;
            }
        }
        if fin {
            self.fetcher.end(ctx, trace_id);
            self.http.net.state.closing_reply();
        }
        self.fetcher.mirror_reply(ctx, &self.http, 0);
    }

    fn on_kafka_end(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        if !self.http.begun() {
            let headers = match &self.if_none_match {
                Some(value) => HttpBeginEx::new().with(":status", "304").with("etag", value.clone()),
                None => HttpBeginEx::new().with(":status", "404"),
            };
            self.http.respond(ctx, headers);
        }
        if self.http.net.state.initial_closed() {
            let trace_id = self.http.trace_id;
            self.fetcher.end(ctx, trace_id);
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
        debug!(stream_id = self.http.owner(), "fetch wait expired");
        let trace_id = self.http.trace_id;
        self.fetcher.end(ctx, trace_id);
    }
}

/// Answers a GET with every matching record joined into one body.
pub(super) struct FetchMergeProxy {
    http: HttpExchange,
    fetcher: KafkaStream,
    framing: MergeFraming,
    /// Progress etag of the client's cached snapshot.
    cached: Option<String>,
    initial_window: u32,
    messages: usize,
    /// Closing bytes waiting for response window.
    tail: Option<Bytes>,
}

impl FetchMergeProxy {
    pub(super) fn accept(
        ctx: &mut EngineContext,
        header: &FrameHeader,
        affinity: u64,
        route: &HttpKafkaRoute,
        framing: MergeFraming,
        headers: &HttpBeginEx,
        initial_window: u32,
    ) -> Result<Self, FlowError> {
        let request = FetchRequest::resolve(route, headers);
        let mut http = HttpExchange::accept(header, affinity)?;
        http.ack_request(ctx, initial_window);
        let mut fetcher = KafkaStream::open(ctx, &http, route.id, KafkaRole::Fetcher, request.begin);
        fetcher.arm_wait(ctx, http.trace_id, request.wait_millis);
        Ok(Self {
            http,
            fetcher,
            framing,
            cached: request.if_none_match.map(|(_, progress)| progress),
            initial_window,
            messages: 0,
            tail: None,
        })
    }

    /// Reply padding large enough for the framing added to any record.
    fn framing_pad(&self) -> u32 {
        self.framing.header.len().max(self.framing.separator.len()) as u32
    }

    fn mirror(&mut self, ctx: &mut EngineContext) {
        let pad = self.framing_pad();
        self.fetcher.mirror_reply(ctx, &self.http, pad);
    }

    fn respond_ok(&mut self, ctx: &mut EngineContext, etag: Option<String>) {
        let mut headers = HttpBeginEx::new()
            .with(":status", "200")
            .with("content-type", self.framing.content_type.clone());
        if let Some(etag) = etag {
            headers.push("etag", etag);
        }
        self.http.respond(ctx, headers);
    }

    fn finish(&mut self, ctx: &mut EngineContext) {
        self.respond_ok(ctx, None);
        let mut tail = BytesMut::new();
        if self.messages == 0 {
            tail.extend_from_slice(self.framing.header.as_bytes());
        }
        tail.extend_from_slice(self.framing.trailer.as_bytes());
        self.tail = Some(tail.freeze());
        self.flush_tail(ctx);
    }

    fn flush_tail(&mut self, ctx: &mut EngineContext) {
        let Some(tail) = self.tail.take() else {
            return;
        };
        if tail.is_empty() {
            self.http.end(ctx);
            return;
        }
        let Some(reserved) = self.http.net.claim_whole(ctx, tail.len()) else {
            self.tail = Some(tail);
            return;
        };
        match self.http.forward(ctx, FLAG_INIT | FLAG_FIN, reserved, tail) {
            Ok(()) => self.http.end(ctx),
            Err(err) => {
                warn!(stream_id = self.http.owner(), %err, "merge trailer overran response window");
                self.fail(ctx);
            }
        }
    }

    fn fail(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.http.trace_id;
        self.tail = None;
        self.http.fail(ctx);
        self.fetcher.cleanup(ctx, trace_id);
    }
}

impl HttpProxy for FetchMergeProxy {
    fn parts(&mut self) -> (&mut HttpExchange, Vec<&mut KafkaStream>) {
        (&mut self.http, vec![&mut self.fetcher])
    }

    fn on_http(&mut self, ctx: &mut EngineContext, event: HttpEvent) {
        let trace_id = self.http.trace_id;
        match event {
            HttpEvent::Data { .. } => self.http.ack_request(ctx, self.initial_window),
            HttpEvent::End => {
                if self.fetcher.stream.state.reply_closed() {
                    self.fetcher.end(ctx, trace_id);
                }
            }
            HttpEvent::Abort => self.fetcher.abort(ctx, trace_id),
            HttpEvent::Window => {
                self.flush_tail(ctx);
                self.mirror(ctx);
            }
            HttpEvent::Reset => {
                self.tail = None;
                self.fetcher.cleanup(ctx, trace_id);
            }
        }
    }

    fn on_kafka_begin(&mut self, ctx: &mut EngineContext, _role: KafkaRole, extension: Extension) {
        let snapshot = extension
            .kafka_begin()
            .filter(|begin| !begin.partitions.is_empty())
            .map(|begin| etag::encode_latest(&begin.partitions));
        match snapshot {
            Some(etag) if self.cached.as_deref() == Some(etag.as_str()) => {
                let headers = HttpBeginEx::new()
                    .with(":status", "304")
                    .with("content-type", self.framing.content_type.clone())
                    .with("etag", etag);
                self.http.respond(ctx, headers);
                self.http.end(ctx);
                let trace_id = self.http.trace_id;
                self.fetcher.end(ctx, trace_id);
                self.fetcher.reset(ctx, trace_id);
                return;
            }
            etag => self.respond_ok(ctx, etag),
        }
        self.mirror(ctx);
    }

    fn on_kafka_data(&mut self, ctx: &mut EngineContext, _role: KafkaRole, data: KafkaData) {
        let trace_id = self.http.trace_id;
        if self.http.net.state.reply_closing() || self.http.net.state.reply_closed() {
            self.fetcher.ack_reply(ctx, trace_id);
            return;
        }
        self.respond_ok(ctx, None);
        if let Some(payload) = data.payload.filter(|p| !p.is_empty()) {
            let prefix: &[u8] = if self.messages == 0 {
                self.framing.header.as_bytes()
            } else if data.flags & FLAG_INIT != 0 {
                self.framing.separator.as_bytes()
            } else {
                &[]
            };
            if data.flags & FLAG_INIT != 0 || self.messages == 0 {
                self.messages += 1;
            }
            let mut merged = BytesMut::with_capacity(prefix.len() + payload.len());
            merged.extend_from_slice(prefix);
            merged.extend_from_slice(&payload);
            if let Err(err) = self
                .http
                .forward(ctx, FLAG_INIT | FLAG_FIN, data.reserved, merged.freeze())
            {
                warn!(stream_id = self.http.owner(), %err, "merged record overran response window");
                self.fail(ctx);
                return;
            }
        }
        self.mirror(ctx);
    }

    fn on_kafka_end(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        if self.http.net.state.initial_closed() {
            let trace_id = self.http.trace_id;
            self.fetcher.end(ctx, trace_id);
        }
        self.finish(ctx);
    }

    fn on_kafka_abort(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.fail(ctx);
    }

    fn on_kafka_window(&mut self, _ctx: &mut EngineContext, _role: KafkaRole) {}

    fn on_kafka_reset(&mut self, ctx: &mut EngineContext, _role: KafkaRole) {
        self.fail(ctx);
    }

    fn on_kafka_signal(&mut self, ctx: &mut EngineContext, _role: KafkaRole, _signal_id: u32) {
        debug!(stream_id = self.http.owner(), "merged fetch wait expired");
        let trace_id = self.http.trace_id;
        self.fetcher.end(ctx, trace_id);
    }

    fn on_budget_ready(&mut self, ctx: &mut EngineContext) {
        self.flush_tail(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::{KafkaAckMode, KafkaDataEx, KafkaHeader};
    use crate::http_kafka::route::HttpKafkaCapability;

    fn route() -> HttpKafkaRoute {
        HttpKafkaRoute {
            id: 9,
            capability: HttpKafkaCapability::Fetch,
            topic: "items".into(),
            key: Some("42".into()),
            filters: vec![("tenant".into(), "acme".into())],
            merge: None,
            reply_to: None,
            async_location: None,
            correlation_id: None,
            correlation_header: "correlation-id".into(),
            reply_to_header: "reply-to".into(),
            idempotency_header: "idempotency-key".into(),
            ack_mode: KafkaAckMode::InSyncReplicas,
            wait_secs: 30,
        }
    }

    #[test]
    fn plain_get_fetches_history_with_filters() {
        let request = FetchRequest::resolve(&route(), &HttpBeginEx::new());
        assert_eq!(request.begin.partitions, vec![KafkaPartitionOffset::historical()]);
        assert_eq!(request.wait_millis, 0);
        assert_eq!(request.begin.filters.len(), 1);
        assert_eq!(
            request.begin.filters[0].conditions,
            vec![
                KafkaCondition::Key(Bytes::from_static(b"42")),
                KafkaCondition::Header {
                    name: "tenant".into(),
                    value: Bytes::from_static(b"acme"),
                },
            ]
        );
    }

    #[test]
    fn waiting_get_resumes_live_after_etag() {
        let etag = etag::encode(&[KafkaPartitionOffset::new(0, 5)]);
        let headers = HttpBeginEx::new()
            .with("prefer", "wait=600")
            .with("if-none-match", format!("{etag}/v3"));
        let request = FetchRequest::resolve(&route(), &headers);
        assert_eq!(request.wait_millis, 30_000);
        assert_eq!(request.begin.partitions, vec![KafkaPartitionOffset::new(0, 5)]);
        assert_eq!(request.if_none_match, Some((format!("{etag}/v3"), etag)));
    }

    #[test]
    fn first_record_shapes_the_response() {
        let ex = KafkaDataEx {
            deferred: 6,
            progress: vec![KafkaPartitionOffset::new(0, 3)],
            headers: vec![
                KafkaHeader::new("content-type", "text/plain"),
                KafkaHeader::new("etag", "r1"),
            ],
            ..KafkaDataEx::default()
        };
        let data = KafkaData {
            flags: FLAG_INIT,
            reserved: 4,
            payload: Some(Bytes::from_static(b"abcd")),
            extension: Extension::KafkaData(ex),
        };
        let headers = record_response(&data);
        assert_eq!(headers.status(), Some("200"));
        assert_eq!(headers.header("content-length"), Some("10"));
        assert_eq!(headers.header("content-type"), Some("text/plain"));
        let progress = etag::encode(&[KafkaPartitionOffset::new(0, 3)]);
        assert_eq!(headers.header("etag"), Some(format!("{progress}/r1").as_str()));

        let tombstone = KafkaData {
            flags: FLAG_INIT | FLAG_FIN,
            reserved: 0,
            payload: None,
            extension: Extension::None,
        };
        assert_eq!(record_response(&tombstone).status(), Some("404"));
    }
}
