use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::budget::Budgets;
use super::buffer::BufferPool;
use super::frame::Frame;
use super::signal::{SignalTarget, TimerHandle, TimerQueue};
use crate::core::time::Clock;

/// Stream ids supplied by the engine start here, clear of host-assigned ids.
const ENGINE_STREAM_ID_BASE: u64 = 1 << 48;

/// Slot sizing for an engine's reassembly buffers.
#[derive(Debug, Clone, Copy)]
pub struct BufferSizing {
    pub slot_count: usize,
    pub slot_capacity: usize,
}

impl Default for BufferSizing {
    fn default() -> Self {
        Self {
            slot_count: 256,
            slot_capacity: 64 * 1024,
        }
    }
}

/// Per-engine runtime: outbox, id supply, clock, timers, budgets and buffers.
///
/// Everything an engine touches outside its own stream state lives here, so a
/// factory stays single-threaded and side-effect free apart from this value.
pub struct EngineContext {
    clock: Arc<dyn Clock>,
    outbox: VecDeque<Frame>,
    next_stream_id: u64,
    next_trace_id: u64,
    owners: HashMap<u64, u64>,
    pub timers: TimerQueue,
    pub budgets: Budgets,
    pub buffers: BufferPool,
}

impl EngineContext {
    pub fn new(clock: Arc<dyn Clock>, sizing: BufferSizing) -> Self {
        Self {
            clock,
            outbox: VecDeque::new(),
            next_stream_id: ENGINE_STREAM_ID_BASE + 1,
            next_trace_id: 0,
            owners: HashMap::new(),
            timers: TimerQueue::new(),
            budgets: Budgets::new(),
            buffers: BufferPool::new(sizing.slot_count, sizing.slot_capacity),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn emit(&mut self, frame: Frame) {
        self.outbox.push_back(frame);
    }

    pub fn drain(&mut self) -> Vec<Frame> {
        self.outbox.drain(..).collect()
    }

    pub fn pending_frames(&self) -> usize {
        self.outbox.len()
    }

    /// Next initial stream id; always odd so the reply id is `id ^ 1`.
    pub fn supply_initial_id(&mut self) -> u64 {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        id
    }

    pub fn supply_reply_id(initial_id: u64) -> u64 {
        initial_id ^ 1
    }

    /// Whether a stream id came from this engine's supply rather than the host.
    pub fn is_supplied(stream_id: u64) -> bool {
        stream_id > ENGINE_STREAM_ID_BASE
    }

    pub fn supply_trace_id(&mut self) -> u64 {
        self.next_trace_id += 1;
        self.next_trace_id
    }

    /// Record which connection owns a stream id, for inbound dispatch.
    pub fn bind(&mut self, stream_id: u64, owner: u64) {
        self.owners.insert(stream_id, owner);
    }

    /// Bind both directions of a stream.
    pub fn bind_pair(&mut self, initial_id: u64, owner: u64) {
        self.bind(initial_id, owner);
        self.bind(initial_id ^ 1, owner);
    }

    pub fn unbind_pair(&mut self, initial_id: u64) {
        self.owners.remove(&initial_id);
        self.owners.remove(&(initial_id ^ 1));
    }

    pub fn owner(&self, stream_id: u64) -> Option<u64> {
        self.owners.get(&stream_id).copied()
    }

    pub fn bound(&self) -> usize {
        self.owners.len()
    }

    pub fn signal_at(
        &mut self,
        at_millis: i64,
        target: SignalTarget,
        signal_id: u32,
        context: i32,
    ) -> TimerHandle {
        self.timers.schedule(at_millis, target, signal_id, context)
    }

    /// Cancel and clear a timer slot, if armed.
    pub fn cancel(&mut self, handle: &mut Option<TimerHandle>) {
        if let Some(handle) = handle.take() {
            self.timers.cancel(handle);
        }
    }

    /// Signals now due according to the clock.
    pub fn expire_timers(&mut self) -> Vec<Frame> {
        let now = self.now_millis();
        self.timers.expire(now)
    }
}
