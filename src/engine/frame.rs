use bytes::Bytes;

use super::flow::Flow;
use crate::ext::Extension;

/// DATA flag: frame completes the message.
pub const FLAG_FIN: u8 = 0x01;
/// DATA flag: frame starts a new message.
pub const FLAG_INIT: u8 = 0x02;
/// DATA flag: message is abandoned before completion.
pub const FLAG_INCOMPLETE: u8 = 0x04;

/// Addressing and flow stamp carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
    pub sequence: u64,
    pub acknowledge: u64,
    pub maximum: u32,
    pub trace_id: u64,
    pub authorization: u64,
}

impl FrameHeader {
    pub fn new(
        origin_id: u64,
        routed_id: u64,
        stream_id: u64,
        sequence: u64,
        acknowledge: u64,
        maximum: u32,
        trace_id: u64,
        authorization: u64,
    ) -> Self {
        Self {
            origin_id,
            routed_id,
            stream_id,
            sequence,
            acknowledge,
            maximum,
            trace_id,
            authorization,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Begin {
        affinity: u64,
        extension: Extension,
    },
    Data {
        flags: u8,
        budget_id: u64,
        reserved: u32,
        /// `None` carries a null value, distinct from an empty payload.
        payload: Option<Bytes>,
        extension: Extension,
    },
    End {
        extension: Extension,
    },
    Abort {
        extension: Extension,
    },
    Flush {
        budget_id: u64,
        reserved: u32,
        extension: Extension,
    },
    Window {
        budget_id: u64,
        padding: u32,
        capabilities: u8,
    },
    Reset {
        extension: Extension,
    },
    Signal {
        signal_id: u32,
        context: i32,
    },
}

/// One transport event on a duplex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub kind: FrameKind,
}

impl Frame {
    pub fn begin(header: FrameHeader, affinity: u64, extension: Extension) -> Self {
        Self {
            header,
            kind: FrameKind::Begin {
                affinity,
                extension,
            },
        }
    }

    pub fn data(
        header: FrameHeader,
        flags: u8,
        budget_id: u64,
        reserved: u32,
        payload: Option<Bytes>,
        extension: Extension,
    ) -> Self {
        Self {
            header,
            kind: FrameKind::Data {
                flags,
                budget_id,
                reserved,
                payload,
                extension,
            },
        }
    }

    pub fn end(header: FrameHeader, extension: Extension) -> Self {
        Self {
            header,
            kind: FrameKind::End { extension },
        }
    }

    pub fn abort(header: FrameHeader, extension: Extension) -> Self {
        Self {
            header,
            kind: FrameKind::Abort { extension },
        }
    }

    pub fn flush(header: FrameHeader, budget_id: u64, reserved: u32, extension: Extension) -> Self {
        Self {
            header,
            kind: FrameKind::Flush {
                budget_id,
                reserved,
                extension,
            },
        }
    }

    pub fn window(header: FrameHeader, budget_id: u64, padding: u32, capabilities: u8) -> Self {
        Self {
            header,
            kind: FrameKind::Window {
                budget_id,
                padding,
                capabilities,
            },
        }
    }

    pub fn reset(header: FrameHeader, extension: Extension) -> Self {
        Self {
            header,
            kind: FrameKind::Reset { extension },
        }
    }

    pub fn signal(header: FrameHeader, signal_id: u32, context: i32) -> Self {
        Self {
            header,
            kind: FrameKind::Signal { signal_id, context },
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.header.stream_id
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            FrameKind::Begin { .. } => "BEGIN",
            FrameKind::Data { .. } => "DATA",
            FrameKind::End { .. } => "END",
            FrameKind::Abort { .. } => "ABORT",
            FrameKind::Flush { .. } => "FLUSH",
            FrameKind::Window { .. } => "WINDOW",
            FrameKind::Reset { .. } => "RESET",
            FrameKind::Signal { .. } => "SIGNAL",
        }
    }

    pub fn extension(&self) -> &Extension {
        const NONE: &Extension = &Extension::None;
        match &self.kind {
            FrameKind::Begin { extension, .. }
            | FrameKind::Data { extension, .. }
            | FrameKind::End { extension }
            | FrameKind::Abort { extension }
            | FrameKind::Flush { extension, .. }
            | FrameKind::Reset { extension } => extension,
            FrameKind::Window { .. } | FrameKind::Signal { .. } => NONE,
        }
    }

    /// Payload of a DATA frame, empty for every other kind.
    pub fn payload(&self) -> &[u8] {
        match &self.kind {
            FrameKind::Data {
                payload: Some(payload),
                ..
            } => payload,
            _ => &[],
        }
    }
}

/// Identity of one duplex stream: its routing pair and both direction ids.
///
/// The initial direction flows from the stream opener to the acceptor; the
/// reply direction flows back. The reply id is always the initial id with the
/// low bit flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamIds {
    pub origin_id: u64,
    pub routed_id: u64,
    pub initial_id: u64,
    pub reply_id: u64,
    pub authorization: u64,
}

impl StreamIds {
    pub fn new(origin_id: u64, routed_id: u64, initial_id: u64, authorization: u64) -> Self {
        Self {
            origin_id,
            routed_id,
            initial_id,
            reply_id: initial_id ^ 1,
            authorization,
        }
    }

    /// Header for a frame travelling on the initial stream id.
    pub fn initial(&self, flow: &Flow, trace_id: u64) -> FrameHeader {
        self.stamp(self.initial_id, flow, trace_id)
    }

    /// Header for a frame travelling on the reply stream id.
    pub fn reply(&self, flow: &Flow, trace_id: u64) -> FrameHeader {
        self.stamp(self.reply_id, flow, trace_id)
    }

    fn stamp(&self, stream_id: u64, flow: &Flow, trace_id: u64) -> FrameHeader {
        FrameHeader::new(
            self.origin_id,
            self.routed_id,
            stream_id,
            flow.seq,
            flow.ack,
            flow.max,
            trace_id,
            self.authorization,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::HttpEndEx;

    #[test]
    fn reply_id_flips_low_bit() {
        let ids = StreamIds::new(1, 2, 7, 0);
        assert_eq!(ids.reply_id, 6);
        let ids = StreamIds::new(1, 2, 6, 0);
        assert_eq!(ids.reply_id, 7);
    }

    #[test]
    fn header_stamps_flow_position() {
        let ids = StreamIds::new(1, 2, 9, 42);
        let flow = Flow {
            seq: 100,
            ack: 60,
            max: 512,
            ..Flow::default()
        };
        let header = ids.reply(&flow, 5);
        assert_eq!(header.stream_id, 8);
        assert_eq!((header.sequence, header.acknowledge, header.maximum), (100, 60, 512));
        assert_eq!(header.trace_id, 5);
        assert_eq!(header.authorization, 42);
    }

    #[test]
    fn extension_and_payload_accessors() {
        let header = FrameHeader::default();
        let end = Frame::end(header, Extension::HttpEnd(HttpEndEx::default().with("grpc-status", "0")));
        assert_eq!(end.name(), "END");
        assert!(end.extension().http_end().is_some());
        assert!(end.payload().is_empty());

        let data = Frame::data(header, FLAG_INIT | FLAG_FIN, 0, 3, Some(Bytes::from_static(b"abc")), Extension::None);
        assert_eq!(data.payload(), b"abc");
        assert!(Frame::window(header, 0, 0, 0).extension().is_none());
    }
}
