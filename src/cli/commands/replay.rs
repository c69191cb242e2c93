//! Replay a captured MQTT client byte stream through the server engine.

use std::sync::Arc;

use super::load_config;
use crate::cli::args::ReplayArgs;
use crate::core::config::GatewayConfig;
use crate::core::time::SystemClock;
use crate::engine::{Frame, FrameHeader, StreamFactory, FLAG_FIN, FLAG_INIT};
use crate::ext::Extension;
use crate::mqtt::{ConfigMqttRouter, MqttServerFactory};
use crate::ops::telemetry::LogHandle;
use anyhow::{bail, Context, Result};
use bytes::Bytes;

const NET: u64 = 3;

pub async fn run_replay(args: ReplayArgs, log: Option<&LogHandle>) -> Result<()> {
    let config = load_config(args.config.as_deref(), log)?;
    let capture = tokio::fs::read(&args.capture)
        .await
        .with_context(|| format!("unable to read capture {}", args.capture.display()))?;
    if capture.is_empty() {
        bail!("capture {} is empty", args.capture.display());
    }

    for frame in replay(&config, Bytes::from(capture), args.window) {
        println!("{}", describe(&frame));
    }
    Ok(())
}

fn header(stream_id: u64) -> FrameHeader {
    FrameHeader {
        origin_id: 1,
        routed_id: 2,
        stream_id,
        ..FrameHeader::default()
    }
}

/// Frames the engine emits for one connection sending `capture` then closing.
fn replay(config: &GatewayConfig, capture: Bytes, window: u32) -> Vec<Frame> {
    let router = ConfigMqttRouter::new(config.mqtt.routes.clone());
    let chunk = config.mqtt.initial_window.max(1) as usize;
    let mut factory = MqttServerFactory::new(config.mqtt.clone(), Box::new(router), Arc::new(SystemClock));
    let mut emitted = Vec::new();

    factory.handle(Frame::begin(header(NET), 0, Extension::None));
    factory.handle(Frame::window(
        FrameHeader {
            maximum: window,
            ..header(NET ^ 1)
        },
        0,
        0,
        0,
    ));
    emitted.extend(factory.drain());

    let mut sequence = 0u64;
    let mut offset = 0;
    while offset < capture.len() {
        let end = (offset + chunk).min(capture.len());
        let flags = match (offset == 0, end == capture.len()) {
            (true, true) => FLAG_INIT | FLAG_FIN,
            (true, false) => FLAG_INIT,
            (false, true) => FLAG_FIN,
            (false, false) => 0,
        };
        let payload = capture.slice(offset..end);
        let reserved = payload.len() as u32;
        factory.handle(Frame::data(
            FrameHeader {
                sequence,
                ..header(NET)
            },
            flags,
            0,
            reserved,
            Some(payload),
            Extension::None,
        ));
        emitted.extend(factory.drain());
        sequence += reserved as u64;
        offset = end;
    }

    factory.handle(Frame::end(
        FrameHeader {
            sequence,
            ..header(NET)
        },
        Extension::None,
    ));
    emitted.extend(factory.drain());
    emitted
}

fn describe(frame: &Frame) -> String {
    let mut line = format!(
        "{:<6} stream={} seq={} ack={} max={}",
        frame.name(),
        frame.stream_id(),
        frame.header.sequence,
        frame.header.acknowledge,
        frame.header.maximum,
    );
    let payload = frame.payload();
    if !payload.is_empty() {
        line.push_str(&format!(" payload={}", payload.len()));
    }
    let extension = frame.extension();
    if !extension.is_none() {
        line.push_str(&format!(" {extension:?}"));
    }
    line
}
