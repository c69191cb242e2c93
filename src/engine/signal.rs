use std::collections::{BTreeMap, HashMap};

use super::frame::{Frame, FrameHeader};

/// Cancel token for a scheduled signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Where a fired signal is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalTarget {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    target: SignalTarget,
    signal_id: u32,
    context: i32,
}

/// Deadline-ordered signal timers.
///
/// Firing produces SIGNAL frames addressed to the owning stream, which the
/// engine feeds back through its normal frame dispatch.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    deadlines: BTreeMap<(i64, TimerHandle), Timer>,
    index: HashMap<TimerHandle, i64>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        at_millis: i64,
        target: SignalTarget,
        signal_id: u32,
        context: i32,
    ) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        self.deadlines.insert(
            (at_millis, handle),
            Timer {
                target,
                signal_id,
                context,
            },
        );
        self.index.insert(handle, at_millis);
        handle
    }

    /// Returns whether the timer was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.index.remove(&handle) {
            Some(at) => self.deadlines.remove(&(at, handle)).is_some(),
            None => false,
        }
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.index.contains_key(&handle)
    }

    pub fn pending(&self) -> usize {
        self.index.len()
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.deadlines.keys().next().map(|(at, _)| *at)
    }

    /// Remove every timer due at or before `now`, in deadline order.
    pub fn expire(&mut self, now_millis: i64) -> Vec<Frame> {
        let mut fired = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            let (at, handle) = *entry.key();
            if at > now_millis {
                break;
            }
            let timer = entry.remove();
            self.index.remove(&handle);
            let target = timer.target;
            let header = FrameHeader {
                origin_id: target.origin_id,
                routed_id: target.routed_id,
                stream_id: target.stream_id,
                trace_id: target.trace_id,
                ..FrameHeader::default()
            };
            fired.push(Frame::signal(header, timer.signal_id, timer.context));
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::frame::FrameKind;

    fn target(stream_id: u64) -> SignalTarget {
        SignalTarget {
            origin_id: 1,
            routed_id: 2,
            stream_id,
            trace_id: 0,
        }
    }

    #[test]
    fn expire_fires_due_timers_in_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(300, target(5), 2, 0);
        timers.schedule(100, target(3), 1, 7);
        timers.schedule(900, target(7), 3, 0);

        let fired = timers.expire(300);
        let ids: Vec<u64> = fired.iter().map(Frame::stream_id).collect();
        assert_eq!(ids, vec![3, 5]);
        assert!(matches!(
            fired[0].kind,
            FrameKind::Signal { signal_id: 1, context: 7 }
        ));
        assert_eq!(timers.pending(), 1);
        assert_eq!(timers.next_deadline(), Some(900));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = TimerQueue::new();
        let handle = timers.schedule(100, target(3), 1, 0);
        assert!(timers.is_pending(handle));
        assert!(timers.cancel(handle));
        assert!(!timers.cancel(handle));
        assert!(timers.expire(1_000).is_empty());
    }
}
