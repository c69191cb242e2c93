//! Duplex-stream substrate shared by every protocol engine.
//!
//! Engines are sans-io: the host feeds [`Frame`]s into a [`StreamFactory`]
//! and drains the frames it produces from the [`EngineContext`] outbox.
//! Timers fire as SIGNAL frames routed back through the same dispatch.

pub mod budget;
pub mod buffer;
pub mod context;
pub mod flow;
pub mod frame;
pub mod signal;
pub mod stream;

pub use budget::{Budgets, NO_BUDGET};
pub use buffer::{BufferPool, SlotId};
pub use context::{BufferSizing, EngineContext};
pub use flow::{Flow, FlowError, StreamState};
pub use frame::{Frame, FrameHeader, FrameKind, StreamIds, FLAG_FIN, FLAG_INCOMPLETE, FLAG_INIT};
pub use signal::{SignalTarget, TimerHandle, TimerQueue};
pub use stream::{AcceptedStream, OpenedStream};

/// A protocol engine driven one frame at a time.
pub trait StreamFactory {
    /// Dispatch one inbound frame.
    fn handle(&mut self, frame: Frame);

    fn context(&mut self) -> &mut EngineContext;

    /// Deliver every signal whose deadline has passed.
    fn tick(&mut self) {
        let due = self.context().expire_timers();
        for signal in due {
            self.handle(signal);
        }
    }

    /// Take the frames produced so far.
    fn drain(&mut self) -> Vec<Frame> {
        self.context().drain()
    }
}
