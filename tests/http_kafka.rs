mod common;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use common::{find, header, header_at, names, opened, window, window_acked, NET};
use gantry::config::GatewayConfig;
use gantry::engine::{Frame, StreamFactory, FLAG_FIN, FLAG_INIT};
use gantry::ext::{Extension, HttpBeginEx, KafkaCondition, KafkaDataEx, KafkaHeader, KafkaPartitionOffset};
use gantry::http_kafka::{etag, ConfigHttpKafkaRouter};
use gantry::time::ManualClock;
use gantry::HttpKafkaProxyFactory;

const CONFIG: &str = r#"
[[http_kafka.routes]]
id = 5
method = "POST"
path = "/orders"
capability = "produce"
topic = "orders"
reply_to = "order-replies"
async_location = "/orders;cid={correlationId}"

[[http_kafka.routes]]
id = 6
method = "GET"
path = "/orders;cid={correlationId}"
capability = "produce"
topic = "orders"
reply_to = "order-replies"
async_location = "/orders;cid={correlationId}"
wait_secs = 30

[[http_kafka.routes]]
id = 7
method = "GET"
path = "/items/{id}"
capability = "fetch"
topic = "items"
key = "{id}"

[[http_kafka.routes]]
id = 8
method = "DELETE"
path = "/items/{id}"
capability = "produce"
topic = "items"
key = "{id}"
"#;

fn factory(clock: &ManualClock) -> HttpKafkaProxyFactory {
    let config = GatewayConfig::parse(Path::new("gantry.toml"), CONFIG).unwrap();
    config.validate().unwrap();
    let router = ConfigHttpKafkaRouter::new(&config.http_kafka);
    HttpKafkaProxyFactory::new(config.http_kafka, Box::new(router), Arc::new(clock.clone()))
}

fn request(method: &str, path: &str) -> HttpBeginEx {
    HttpBeginEx::new()
        .with(":method", method)
        .with(":scheme", "http")
        .with(":authority", "localhost:8080")
        .with(":path", path)
}

fn order() -> HttpBeginEx {
    request("POST", "/orders")
        .with("content-type", "application/json")
        .with("content-length", "5")
        .with("idempotency-key", "k1")
}

/// Correlation id the correlater filters on.
fn filtered_id(begin: &Frame) -> String {
    let fetch = begin.extension().kafka_begin().unwrap();
    match &fetch.filters[0].conditions[0] {
        KafkaCondition::Header { name, value } => {
            assert_eq!(name, "correlation-id");
            String::from_utf8(value.to_vec()).unwrap()
        }
        other => panic!("unexpected filter {other:?}"),
    }
}

/// Send the request body and END, returning the correlater BEGIN.
fn produce_body(factory: &mut HttpKafkaProxyFactory, producer: u64) -> Frame {
    factory.handle(window(producer, 1024));
    let frames = factory.drain();
    let first = find(&frames, "DATA", producer).unwrap();
    assert_eq!(first.extension().kafka_data().unwrap().deferred, 5);
    assert!(find(&frames, "WINDOW", NET).is_some());

    factory.handle(common::message(NET, 0, b"hello", Extension::None));
    factory.handle(Frame::end(header_at(NET, 5), Extension::None));
    let frames = factory.drain();
    let body = find(&frames, "DATA", producer).unwrap();
    assert_eq!(body.payload(), b"hello");
    frames
        .into_iter()
        .find(|f| f.name() == "BEGIN" && f.stream_id() != producer)
        .unwrap()
}

#[test]
fn produce_answers_with_correlated_reply() {
    let clock = ManualClock::new(0);
    let mut factory = factory(&clock);
    factory.handle(Frame::begin(header(NET), 0, Extension::HttpBegin(order())));
    let frames = factory.drain();
    let producer = opened(&frames).unwrap();
    assert_eq!(producer.extension().kafka_begin().unwrap().topic, "orders");
    let producer = producer.stream_id();

    let correlater = produce_body(&mut factory, producer);
    let correlation_id = filtered_id(&correlater);
    assert!(correlation_id.starts_with("k1-"));
    assert_eq!(correlater.extension().kafka_begin().unwrap().topic, "order-replies");
    let correlater = correlater.stream_id();

    factory.handle(window_acked(producer, 5, 1024));
    factory.handle(Frame::begin(header(correlater ^ 1), 0, Extension::None));
    factory.handle(window(NET ^ 1, 4096));
    let frames = factory.drain();
    assert_eq!(find(&frames, "WINDOW", correlater ^ 1).unwrap().header.maximum, 4096);

    // the record is only completed once the correlater is caught up
    factory.handle(Frame::flush(header(correlater ^ 1), 0, 0, Extension::None));
    let frames = factory.drain();
    let last = find(&frames, "DATA", producer).unwrap();
    let stamped = last.extension().kafka_data().unwrap().header("correlation-id").unwrap();
    assert_eq!(stamped.value_str(), Some(correlation_id.as_str()));
    assert!(find(&frames, "END", producer).is_some());

    let reply = KafkaDataEx {
        headers: vec![
            KafkaHeader::new(":status", "201"),
            KafkaHeader::new("content-type", "application/json"),
            KafkaHeader::new("correlation-id", correlation_id.clone()),
        ],
        ..KafkaDataEx::default()
    };
    factory.handle(Frame::data(
        header(correlater ^ 1),
        FLAG_INIT | FLAG_FIN,
        0,
        8,
        Some(Bytes::from_static(b"{\"id\":1}")),
        Extension::KafkaData(reply),
    ));
    let frames = factory.drain();
    let response = find(&frames, "BEGIN", NET ^ 1).unwrap().extension().http_begin().unwrap();
    assert_eq!(response.status(), Some("201"));
    assert_eq!(response.header("content-length"), Some("8"));
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.header("correlation-id"), None);
    assert_eq!(common::payloads(&frames, NET ^ 1), b"{\"id\":1}");

    factory.handle(Frame::end(header_at(correlater ^ 1, 8), Extension::None));
    let frames = factory.drain();
    assert!(find(&frames, "END", NET ^ 1).is_some());
    assert_eq!(factory.proxies(), 0);
}

#[test]
fn async_produce_points_at_reply_location() {
    let clock = ManualClock::new(0);
    let mut factory = factory(&clock);
    let headers = order().with("prefer", "respond-async");
    factory.handle(Frame::begin(header(NET), 0, Extension::HttpBegin(headers)));
    let producer = opened(&factory.drain()).unwrap().stream_id();
    let correlater = produce_body(&mut factory, producer);
    let correlation_id = filtered_id(&correlater);
    let correlater = correlater.stream_id();

    factory.handle(Frame::begin(header(correlater ^ 1), 0, Extension::None));
    factory.handle(Frame::flush(header(correlater ^ 1), 0, 0, Extension::None));
    factory.handle(window_acked(producer, 5, 1024));
    factory.handle(Frame::begin(header(producer ^ 1), 0, Extension::None));
    factory.handle(Frame::end(header(producer ^ 1), Extension::None));
    let frames = factory.drain();

    let response = find(&frames, "BEGIN", NET ^ 1).unwrap().extension().http_begin().unwrap();
    assert_eq!(response.status(), Some("202"));
    let location = format!("/orders;cid={correlation_id}");
    assert_eq!(response.header("location"), Some(location.as_str()));
    assert!(find(&frames, "END", NET ^ 1).is_some());
    assert_eq!(factory.proxies(), 0);
}

#[test]
fn reply_lookup_without_reply_is_still_accepted() {
    let clock = ManualClock::new(0);
    let mut factory = factory(&clock);
    let lookup = request("GET", "/orders;cid=k1-abc").with("prefer", "wait=5");
    factory.handle(Frame::begin(header(NET), 0, Extension::HttpBegin(lookup)));
    let frames = factory.drain();
    let correlater = opened(&frames).unwrap();
    assert_eq!(filtered_id(correlater), "k1-abc");
    let correlater = correlater.stream_id();
    factory.handle(Frame::end(header(NET), Extension::None));
    factory.handle(Frame::begin(header(correlater ^ 1), 0, Extension::None));
    factory.drain();

    clock.advance(4_999);
    factory.tick();
    assert!(factory.drain().is_empty());

    // the lookup gives up after the client's wait
    clock.advance(1);
    factory.tick();
    let frames = factory.drain();
    assert_eq!(names(&frames), vec!["END"]);
    assert_eq!(frames[0].stream_id(), correlater);

    factory.handle(Frame::end(header(correlater ^ 1), Extension::None));
    let frames = factory.drain();
    let response = find(&frames, "BEGIN", NET ^ 1).unwrap().extension().http_begin().unwrap();
    assert_eq!(response.status(), Some("202"));
    assert_eq!(response.header("location"), Some("/orders;cid=k1-abc"));
    assert_eq!(factory.proxies(), 0);
}

#[test]
fn unchanged_fetch_is_not_modified() {
    let clock = ManualClock::new(0);
    let mut factory = factory(&clock);
    let cached = etag::encode(&[KafkaPartitionOffset::new(0, 8)]);
    let get = request("GET", "/items/42").with("if-none-match", cached.as_str());
    factory.handle(Frame::begin(header(NET), 0, Extension::HttpBegin(get)));
    let frames = factory.drain();
    let fetcher = opened(&frames).unwrap();
    let fetch = fetcher.extension().kafka_begin().unwrap();
    assert_eq!(fetch.partitions[0].partition_offset, 8);
    assert_eq!(
        fetch.filters[0].conditions,
        vec![KafkaCondition::Key(Bytes::from_static(b"42"))]
    );
    let fetcher = fetcher.stream_id();

    factory.handle(Frame::end(header(NET), Extension::None));
    factory.handle(Frame::begin(header(fetcher ^ 1), 0, Extension::None));
    factory.handle(Frame::end(header(fetcher ^ 1), Extension::None));
    let frames = factory.drain();
    let response = find(&frames, "BEGIN", NET ^ 1).unwrap().extension().http_begin().unwrap();
    assert_eq!(response.status(), Some("304"));
    assert_eq!(response.header("etag"), Some(cached.as_str()));
    assert_eq!(factory.proxies(), 0);
}

#[test]
fn delete_produces_tombstone() {
    let clock = ManualClock::new(0);
    let mut factory = factory(&clock);
    factory.handle(Frame::begin(header(NET), 0, Extension::HttpBegin(request("DELETE", "/items/42"))));
    let producer = opened(&factory.drain()).unwrap().stream_id();

    factory.handle(window(producer, 1024));
    let frames = factory.drain();
    let tombstone = find(&frames, "DATA", producer).unwrap();
    assert!(matches!(
        tombstone.kind,
        gantry::FrameKind::Data { flags, payload: None, .. } if flags == FLAG_INIT | FLAG_FIN
    ));
    let record = tombstone.extension().kafka_data().unwrap();
    assert_eq!(record.key.as_deref(), Some(&b"42"[..]));

    factory.handle(Frame::end(header(NET), Extension::None));
    let frames = factory.drain();
    assert!(find(&frames, "END", producer).is_some());

    factory.handle(Frame::begin(header(producer ^ 1), 0, Extension::None));
    factory.handle(Frame::end(header(producer ^ 1), Extension::None));
    let frames = factory.drain();
    let response = find(&frames, "BEGIN", NET ^ 1).unwrap().extension().http_begin().unwrap();
    assert_eq!(response.status(), Some("204"));
    assert_eq!(factory.proxies(), 0);
}
