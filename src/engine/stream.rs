//! Per-stream bookkeeping for the two roles an engine plays.
//!
//! An [`AcceptedStream`] was opened by the peer: inbound BEGIN/DATA/END/ABORT
//! arrive on the initial id and the engine answers on the reply id. An
//! [`OpenedStream`] is the mirror image, begun by the engine itself. Both
//! stamp headers from the flow position before reserving window, so a DATA
//! header always carries the sequence at which its bytes start.

use bytes::Bytes;

use super::context::EngineContext;
use super::flow::{Flow, FlowError, StreamState};
use super::frame::{Frame, FrameHeader, StreamIds};
use super::signal::SignalTarget;
use crate::ext::Extension;

/// Reserve whole-frame credit on `flow` for `length` payload bytes.
///
/// Returns the reserved amount including padding, or `None` when the window
/// or the shared budget cannot cover the frame yet. A deferred budget claim
/// registers `watcher` for a flush notification.
fn claim_whole(ctx: &mut EngineContext, flow: &Flow, watcher: u64, length: usize) -> Option<u32> {
    if !flow.fits(length) {
        return None;
    }
    let reserved = length + flow.pad as usize;
    let claimed = ctx.budgets.claim(flow.budget_id, watcher, reserved, reserved);
    (claimed >= reserved).then_some(reserved as u32)
}

/// Reserve as much of `length` as the window and budget allow.
///
/// Returns `(payload_bytes, reserved)`; zero payload bytes means nothing can
/// be sent now.
fn claim_partial(
    ctx: &mut EngineContext,
    flow: &Flow,
    watcher: u64,
    length: usize,
) -> (usize, u32) {
    let pad = flow.pad as usize;
    let available = flow.available() - pad as i64;
    if length == 0 || available <= 0 {
        return (0, 0);
    }
    let max = length.min(available as usize) + pad;
    let claimed = ctx.budgets.claim(flow.budget_id, watcher, pad + 1, max);
    if claimed <= pad {
        return (0, 0);
    }
    (claimed - pad, claimed as u32)
}

/// A stream this engine opened toward the application side.
#[derive(Debug, Clone)]
pub struct OpenedStream {
    pub ids: StreamIds,
    pub initial: Flow,
    pub reply: Flow,
    pub state: StreamState,
}

impl OpenedStream {
    pub fn new(ids: StreamIds) -> Self {
        Self {
            ids,
            initial: Flow::default(),
            reply: Flow::default(),
            state: StreamState::default(),
        }
    }

    pub fn signal_target(&self, trace_id: u64) -> SignalTarget {
        SignalTarget {
            origin_id: self.ids.origin_id,
            routed_id: self.ids.routed_id,
            stream_id: self.ids.initial_id,
            trace_id,
        }
    }

    pub fn begin(&mut self, ctx: &mut EngineContext, trace_id: u64, affinity: u64, extension: Extension) {
        let header = self.ids.initial(&self.initial, trace_id);
        ctx.emit(Frame::begin(header, affinity, extension));
        self.state.opening_initial();
    }

    pub fn data(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: u64,
        flags: u8,
        reserved: u32,
        payload: Option<Bytes>,
        extension: Extension,
    ) -> Result<(), FlowError> {
        let header = self.ids.initial(&self.initial, trace_id);
        self.initial.send(reserved)?;
        ctx.emit(Frame::data(header, flags, self.initial.budget_id, reserved, payload, extension));
        Ok(())
    }

    pub fn flush(&mut self, ctx: &mut EngineContext, trace_id: u64, extension: Extension) {
        let header = self.ids.initial(&self.initial, trace_id);
        ctx.emit(Frame::flush(header, self.initial.budget_id, 0, extension));
    }

    pub fn end(&mut self, ctx: &mut EngineContext, trace_id: u64, extension: Extension) {
        if self.state.initial_closed() {
            return;
        }
        let header = self.ids.initial(&self.initial, trace_id);
        ctx.emit(Frame::end(header, extension));
        self.state.close_initial();
        ctx.budgets.release(self.ids.initial_id);
    }

    pub fn abort(&mut self, ctx: &mut EngineContext, trace_id: u64, extension: Extension) {
        if self.state.initial_closed() {
            return;
        }
        let header = self.ids.initial(&self.initial, trace_id);
        ctx.emit(Frame::abort(header, extension));
        self.state.close_initial();
        ctx.budgets.release(self.ids.initial_id);
    }

    /// Grant the peer reply window, acknowledging everything received.
    pub fn window(&mut self, ctx: &mut EngineContext, trace_id: u64, maximum: u32) {
        let seq = self.reply.seq;
        self.window_to(ctx, trace_id, seq, maximum);
    }

    /// Grant reply window up to `acknowledge`, emitting only when it moves.
    pub fn window_to(&mut self, ctx: &mut EngineContext, trace_id: u64, acknowledge: u64, maximum: u32) {
        self.window_with(ctx, trace_id, acknowledge, maximum, 0, 0);
    }

    /// Grant reply window carrying a shared budget and per-frame padding.
    pub fn window_with(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: u64,
        acknowledge: u64,
        maximum: u32,
        budget_id: u64,
        padding: u32,
    ) {
        if self.state.reply_closed() {
            return;
        }
        let before = (self.reply.ack, self.reply.max, self.reply.pad);
        self.reply.grant(acknowledge, maximum);
        self.reply.pad = padding;
        if (self.reply.ack, self.reply.max, self.reply.pad) != before {
            let header = self.ids.reply(&self.reply, trace_id);
            ctx.emit(Frame::window(header, budget_id, padding, 0));
        }
    }

    pub fn reset(&mut self, ctx: &mut EngineContext, trace_id: u64, extension: Extension) {
        if self.state.reply_closed() {
            return;
        }
        let header = self.ids.reply(&self.reply, trace_id);
        ctx.emit(Frame::reset(header, extension));
        self.state.close_reply();
    }

    /// Close both directions: END or ABORT the initial, RESET an opened reply.
    pub fn cleanup(&mut self, ctx: &mut EngineContext, trace_id: u64, abort: bool) {
        if abort {
            self.abort(ctx, trace_id, Extension::None);
        } else {
            self.end(ctx, trace_id, Extension::None);
        }
        if self.state.reply_opened() {
            self.reset(ctx, trace_id, Extension::None);
        }
    }

    pub fn claim_whole(&self, ctx: &mut EngineContext, length: usize) -> Option<u32> {
        claim_whole(ctx, &self.initial, self.ids.initial_id, length)
    }

    pub fn claim_partial(&self, ctx: &mut EngineContext, length: usize) -> (usize, u32) {
        claim_partial(ctx, &self.initial, self.ids.initial_id, length)
    }

    /// WINDOW received for the initial direction.
    pub fn on_window(&mut self, header: &FrameHeader, budget_id: u64, padding: u32) -> Result<(), FlowError> {
        self.initial
            .credit(header.sequence, header.acknowledge, header.maximum, padding, budget_id)?;
        self.state.open_initial();
        Ok(())
    }

    /// RESET received for the initial direction.
    pub fn on_reset(&mut self, ctx: &mut EngineContext) {
        self.state.close_initial();
        ctx.budgets.release(self.ids.initial_id);
    }

    /// BEGIN received on the reply direction.
    pub fn on_begin(&mut self, header: &FrameHeader) -> Result<(), FlowError> {
        self.reply.open(header.sequence, header.acknowledge)?;
        self.state.open_reply();
        Ok(())
    }

    /// DATA or FLUSH received on the reply direction.
    pub fn on_data(&mut self, header: &FrameHeader, reserved: u32) -> Result<(), FlowError> {
        self.reply.receive(header.sequence, reserved)
    }

    /// END or ABORT received on the reply direction.
    pub fn on_end(&mut self, header: &FrameHeader) -> Result<(), FlowError> {
        self.state.close_reply();
        self.reply.close(header.sequence)
    }
}

/// A stream the host opened toward this engine.
#[derive(Debug, Clone)]
pub struct AcceptedStream {
    pub ids: StreamIds,
    pub initial: Flow,
    pub reply: Flow,
    pub state: StreamState,
}

impl AcceptedStream {
    /// Bookkeeping for a stream opened by an inbound BEGIN.
    pub fn accept(header: &FrameHeader) -> Result<Self, FlowError> {
        let ids = StreamIds::new(
            header.origin_id,
            header.routed_id,
            header.stream_id,
            header.authorization,
        );
        let mut initial = Flow::default();
        initial.open(header.sequence, header.acknowledge)?;
        let mut state = StreamState::default();
        state.open_initial();
        Ok(Self {
            ids,
            initial,
            reply: Flow::default(),
            state,
        })
    }

    pub fn signal_target(&self, trace_id: u64) -> SignalTarget {
        SignalTarget {
            origin_id: self.ids.origin_id,
            routed_id: self.ids.routed_id,
            stream_id: self.ids.initial_id,
            trace_id,
        }
    }

    /// Answer the peer BEGIN on the reply direction.
    pub fn begin(&mut self, ctx: &mut EngineContext, trace_id: u64, affinity: u64, extension: Extension) {
        let header = self.ids.reply(&self.reply, trace_id);
        ctx.emit(Frame::begin(header, affinity, extension));
        self.state.opening_reply();
    }

    pub fn data(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: u64,
        flags: u8,
        reserved: u32,
        payload: Option<Bytes>,
        extension: Extension,
    ) -> Result<(), FlowError> {
        let header = self.ids.reply(&self.reply, trace_id);
        self.reply.send(reserved)?;
        ctx.emit(Frame::data(header, flags, self.reply.budget_id, reserved, payload, extension));
        Ok(())
    }

    pub fn flush(&mut self, ctx: &mut EngineContext, trace_id: u64, extension: Extension) {
        let header = self.ids.reply(&self.reply, trace_id);
        ctx.emit(Frame::flush(header, self.reply.budget_id, 0, extension));
    }

    pub fn end(&mut self, ctx: &mut EngineContext, trace_id: u64, extension: Extension) {
        if self.state.reply_closed() {
            return;
        }
        let header = self.ids.reply(&self.reply, trace_id);
        ctx.emit(Frame::end(header, extension));
        self.state.close_reply();
        ctx.budgets.release(self.ids.reply_id);
    }

    pub fn abort(&mut self, ctx: &mut EngineContext, trace_id: u64, extension: Extension) {
        if self.state.reply_closed() {
            return;
        }
        let header = self.ids.reply(&self.reply, trace_id);
        ctx.emit(Frame::abort(header, extension));
        self.state.close_reply();
        ctx.budgets.release(self.ids.reply_id);
    }

    /// Grant initial window up to `acknowledge`, emitting only when it moves.
    pub fn window_to(&mut self, ctx: &mut EngineContext, trace_id: u64, acknowledge: u64, maximum: u32) {
        self.window_with(ctx, trace_id, acknowledge, maximum, 0, 0);
    }

    /// Grant initial window carrying a shared budget and per-frame padding.
    pub fn window_with(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: u64,
        acknowledge: u64,
        maximum: u32,
        budget_id: u64,
        padding: u32,
    ) {
        if self.state.initial_closed() {
            return;
        }
        let before = (self.initial.ack, self.initial.max, self.initial.pad);
        self.initial.grant(acknowledge, maximum);
        self.initial.pad = padding;
        if (self.initial.ack, self.initial.max, self.initial.pad) != before {
            let header = self.ids.initial(&self.initial, trace_id);
            ctx.emit(Frame::window(header, budget_id, padding, 0));
        }
    }

    /// Grant initial window, acknowledging everything received.
    pub fn window(&mut self, ctx: &mut EngineContext, trace_id: u64, maximum: u32) {
        let seq = self.initial.seq;
        self.window_to(ctx, trace_id, seq, maximum);
    }

    pub fn reset(&mut self, ctx: &mut EngineContext, trace_id: u64, extension: Extension) {
        if self.state.initial_closed() {
            return;
        }
        let header = self.ids.initial(&self.initial, trace_id);
        ctx.emit(Frame::reset(header, extension));
        self.state.close_initial();
    }

    pub fn claim_whole(&self, ctx: &mut EngineContext, length: usize) -> Option<u32> {
        claim_whole(ctx, &self.reply, self.ids.reply_id, length)
    }

    pub fn claim_partial(&self, ctx: &mut EngineContext, length: usize) -> (usize, u32) {
        claim_partial(ctx, &self.reply, self.ids.reply_id, length)
    }

    /// DATA or FLUSH received on the initial direction.
    pub fn on_data(&mut self, header: &FrameHeader, reserved: u32) -> Result<(), FlowError> {
        self.initial.receive(header.sequence, reserved)
    }

    /// END or ABORT received on the initial direction.
    pub fn on_end(&mut self, header: &FrameHeader) -> Result<(), FlowError> {
        self.state.close_initial();
        self.initial.close(header.sequence)
    }

    /// WINDOW received for the reply direction.
    pub fn on_window(&mut self, header: &FrameHeader, budget_id: u64, padding: u32) -> Result<(), FlowError> {
        self.reply
            .credit(header.sequence, header.acknowledge, header.maximum, padding, budget_id)?;
        self.state.open_reply();
        Ok(())
    }

    /// RESET received for the reply direction.
    pub fn on_reset(&mut self, ctx: &mut EngineContext) {
        self.state.close_reply();
        ctx.budgets.release(self.ids.reply_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::time::ManualClock;
    use crate::engine::context::BufferSizing;
    use crate::engine::frame::FrameKind;

    fn context() -> EngineContext {
        EngineContext::new(Arc::new(ManualClock::new(0)), BufferSizing::default())
    }

    fn begin_header(stream_id: u64) -> FrameHeader {
        FrameHeader {
            origin_id: 1,
            routed_id: 2,
            stream_id,
            ..FrameHeader::default()
        }
    }

    #[test]
    fn accepted_stream_answers_on_reply_id() {
        let mut ctx = context();
        let mut stream = AcceptedStream::accept(&begin_header(5)).unwrap();
        stream.begin(&mut ctx, 0, 0, Extension::None);
        stream.window(&mut ctx, 0, 1024);

        let frames = ctx.drain();
        assert_eq!(frames[0].name(), "BEGIN");
        assert_eq!(frames[0].stream_id(), 4);
        assert_eq!(frames[1].name(), "WINDOW");
        assert_eq!(frames[1].stream_id(), 5);
        assert_eq!(frames[1].header.maximum, 1024);

        // unchanged grant is not repeated
        stream.window(&mut ctx, 0, 1024);
        assert!(ctx.drain().is_empty());
    }

    #[test]
    fn data_header_carries_sequence_before_reservation() {
        let mut ctx = context();
        let ids = StreamIds::new(1, 2, ctx.supply_initial_id(), 0);
        let mut stream = OpenedStream::new(ids);
        stream.begin(&mut ctx, 0, 0, Extension::None);
        let window = FrameHeader {
            sequence: 0,
            acknowledge: 0,
            maximum: 100,
            ..FrameHeader::default()
        };
        stream.on_window(&window, 0, 0).unwrap();

        let reserved = stream.claim_whole(&mut ctx, 40).unwrap();
        stream
            .data(&mut ctx, 0, 0x03, reserved, Some(Bytes::from_static(&[0; 40])), Extension::None)
            .unwrap();
        let reserved = stream.claim_whole(&mut ctx, 40).unwrap();
        stream
            .data(&mut ctx, 0, 0x03, reserved, Some(Bytes::from_static(&[0; 40])), Extension::None)
            .unwrap();
        assert!(stream.claim_whole(&mut ctx, 40).is_none());

        let frames = ctx.drain();
        let sequences: Vec<u64> = frames
            .iter()
            .filter(|f| matches!(f.kind, FrameKind::Data { .. }))
            .map(|f| f.header.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 40]);
    }

    #[test]
    fn partial_claim_respects_padding() {
        let mut ctx = context();
        let mut stream = AcceptedStream::accept(&begin_header(9)).unwrap();
        let window = FrameHeader {
            maximum: 20,
            ..FrameHeader::default()
        };
        stream.on_window(&window, 0, 5).unwrap();
        assert_eq!(stream.claim_partial(&mut ctx, 100), (15, 20));
        assert_eq!(stream.claim_partial(&mut ctx, 0), (0, 0));
    }

    #[test]
    fn end_is_sent_once() {
        let mut ctx = context();
        let mut stream = AcceptedStream::accept(&begin_header(3)).unwrap();
        stream.end(&mut ctx, 0, Extension::None);
        stream.end(&mut ctx, 0, Extension::None);
        assert_eq!(ctx.drain().len(), 1);
        assert!(stream.state.reply_closed());
    }
}
