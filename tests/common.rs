//! Shared frame helpers for integration tests.
//!
//! Every engine is driven the same way: feed frames through
//! [`StreamFactory::handle`], then inspect what [`StreamFactory::drain`]
//! returns.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use bytes::Bytes;
use gantry::engine::{Frame, FrameHeader, FLAG_FIN, FLAG_INIT};
use gantry::ext::Extension;

/// Initial id of the host-opened stream under test; its reply id is `NET ^ 1`.
pub const NET: u64 = 3;

pub fn header(stream_id: u64) -> FrameHeader {
    FrameHeader {
        origin_id: 1,
        routed_id: 2,
        stream_id,
        ..FrameHeader::default()
    }
}

pub fn header_at(stream_id: u64, sequence: u64) -> FrameHeader {
    FrameHeader {
        sequence,
        ..header(stream_id)
    }
}

pub fn window(stream_id: u64, maximum: u32) -> Frame {
    Frame::window(
        FrameHeader {
            maximum,
            ..header(stream_id)
        },
        0,
        0,
        0,
    )
}

/// WINDOW acknowledging everything up to `acknowledge`.
pub fn window_acked(stream_id: u64, acknowledge: u64, maximum: u32) -> Frame {
    Frame::window(
        FrameHeader {
            sequence: acknowledge,
            acknowledge,
            maximum,
            ..header(stream_id)
        },
        0,
        0,
        0,
    )
}

/// One whole message at `sequence`, reserving exactly its length.
pub fn message(stream_id: u64, sequence: u64, payload: &'static [u8], extension: Extension) -> Frame {
    Frame::data(
        header_at(stream_id, sequence),
        FLAG_INIT | FLAG_FIN,
        0,
        payload.len() as u32,
        Some(Bytes::from_static(payload)),
        extension,
    )
}

pub fn names(frames: &[Frame]) -> Vec<&'static str> {
    frames.iter().map(Frame::name).collect()
}

/// First frame named `name` on `stream_id`.
pub fn find<'a>(frames: &'a [Frame], name: &str, stream_id: u64) -> Option<&'a Frame> {
    frames
        .iter()
        .find(|f| f.name() == name && f.stream_id() == stream_id)
}

/// The first BEGIN opened by the engine itself.
pub fn opened(frames: &[Frame]) -> Option<&Frame> {
    frames
        .iter()
        .find(|f| f.name() == "BEGIN" && gantry::EngineContext::is_supplied(f.stream_id()))
}

/// Concatenated DATA payloads on `stream_id`.
pub fn payloads(frames: &[Frame], stream_id: u64) -> Vec<u8> {
    frames
        .iter()
        .filter(|f| f.name() == "DATA" && f.stream_id() == stream_id)
        .flat_map(|f| f.payload().to_vec())
        .collect()
}
