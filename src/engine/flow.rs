use bitflags::bitflags;
use thiserror::Error;

/// Flow-control ledger for one direction of a stream.
///
/// `seq` counts bytes (plus padding) sent, `ack` counts bytes the receiver
/// has released, and `max` is the receiver's window. `ack <= seq <= ack + max`
/// holds after every successful transition; a transition that would break it
/// is rejected and leaves the ledger unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flow {
    pub seq: u64,
    pub ack: u64,
    pub max: u32,
    pub pad: u32,
    pub budget_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("sequence regressed (current={current}, received={received})")]
    SequenceRegressed { current: u64, received: u64 },
    #[error("window exceeded (seq={seq}, ack={ack}, max={max})")]
    WindowExceeded { seq: u64, ack: u64, max: u32 },
    #[error("acknowledge {ack} beyond sequence {seq}")]
    AckBeyondSeq { seq: u64, ack: u64 },
    #[error("acknowledge regressed (current={current}, received={received})")]
    AckRegressed { current: u64, received: u64 },
}

impl Flow {
    /// Sync sequence and acknowledge from a peer BEGIN.
    pub fn open(&mut self, sequence: u64, acknowledge: u64) -> Result<(), FlowError> {
        if acknowledge > sequence {
            return Err(FlowError::AckBeyondSeq {
                seq: sequence,
                ack: acknowledge,
            });
        }
        self.seq = sequence;
        self.ack = acknowledge;
        Ok(())
    }

    /// Account for a DATA or FLUSH received on this direction.
    pub fn receive(&mut self, sequence: u64, reserved: u32) -> Result<(), FlowError> {
        if sequence < self.seq {
            return Err(FlowError::SequenceRegressed {
                current: self.seq,
                received: sequence,
            });
        }
        self.seq = self.advance(sequence, reserved)?;
        Ok(())
    }

    /// Account for an END or ABORT received on this direction.
    pub fn close(&mut self, sequence: u64) -> Result<(), FlowError> {
        if sequence < self.seq {
            return Err(FlowError::SequenceRegressed {
                current: self.seq,
                received: sequence,
            });
        }
        self.seq = sequence;
        Ok(())
    }

    /// Apply a WINDOW received for this direction.
    pub fn credit(
        &mut self,
        sequence: u64,
        acknowledge: u64,
        maximum: u32,
        padding: u32,
        budget_id: u64,
    ) -> Result<(), FlowError> {
        if acknowledge > sequence || sequence > self.seq {
            return Err(FlowError::AckBeyondSeq {
                seq: self.seq,
                ack: acknowledge,
            });
        }
        if acknowledge < self.ack {
            return Err(FlowError::AckRegressed {
                current: self.ack,
                received: acknowledge,
            });
        }
        self.ack = acknowledge;
        self.max = maximum;
        self.pad = padding;
        self.budget_id = budget_id;
        Ok(())
    }

    /// Reserve window for a frame about to be sent.
    pub fn send(&mut self, reserved: u32) -> Result<(), FlowError> {
        self.seq = self.advance(self.seq, reserved)?;
        Ok(())
    }

    /// Sequence after `reserved` bytes at `sequence`, if the window admits it.
    fn advance(&self, sequence: u64, reserved: u32) -> Result<u64, FlowError> {
        let limit = self.ack.saturating_add(self.max as u64);
        match sequence.checked_add(reserved as u64) {
            Some(next) if next <= limit => Ok(next),
            next => Err(FlowError::WindowExceeded {
                seq: next.unwrap_or(u64::MAX),
                ack: self.ack,
                max: self.max,
            }),
        }
    }

    /// Release received bytes back to the sender, clamped to what was received.
    pub fn grant(&mut self, acknowledge: u64, maximum: u32) {
        self.ack = acknowledge.clamp(self.ack, self.seq);
        self.max = maximum;
    }

    /// Bytes that may still be sent, ignoring padding.
    pub fn available(&self) -> i64 {
        self.max as i64 - (self.seq - self.ack) as i64
    }

    /// Whether a frame of `length` payload bytes fits with padding.
    pub fn fits(&self, length: usize) -> bool {
        self.available() >= length as i64 + self.pad as i64
    }

    pub fn has_window(&self) -> bool {
        self.max > 0
    }
}

bitflags! {
    /// Handshake phase of both directions of a stream.
    ///
    /// High nibble tracks the initial direction, low nibble the reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamState: u8 {
        const INITIAL_OPENING = 0x10;
        const INITIAL_OPENED = 0x20;
        const INITIAL_CLOSING = 0x40;
        const INITIAL_CLOSED = 0x80;
        const REPLY_OPENING = 0x01;
        const REPLY_OPENED = 0x02;
        const REPLY_CLOSING = 0x04;
        const REPLY_CLOSED = 0x08;
    }
}

impl StreamState {
    pub fn opening_initial(&mut self) {
        self.insert(Self::INITIAL_OPENING);
    }

    pub fn open_initial(&mut self) {
        self.insert(Self::INITIAL_OPENING | Self::INITIAL_OPENED);
    }

    pub fn closing_initial(&mut self) {
        self.insert(Self::INITIAL_CLOSING);
    }

    pub fn close_initial(&mut self) {
        self.insert(Self::INITIAL_CLOSING | Self::INITIAL_CLOSED);
    }

    pub fn opening_reply(&mut self) {
        self.insert(Self::REPLY_OPENING);
    }

    pub fn open_reply(&mut self) {
        self.insert(Self::REPLY_OPENING | Self::REPLY_OPENED);
    }

    pub fn closing_reply(&mut self) {
        self.insert(Self::REPLY_CLOSING);
    }

    pub fn close_reply(&mut self) {
        self.insert(Self::REPLY_CLOSING | Self::REPLY_CLOSED);
    }

    pub fn initial_opening(self) -> bool {
        self.contains(Self::INITIAL_OPENING)
    }

    pub fn initial_opened(self) -> bool {
        self.contains(Self::INITIAL_OPENED)
    }

    pub fn initial_closing(self) -> bool {
        self.contains(Self::INITIAL_CLOSING)
    }

    pub fn initial_closed(self) -> bool {
        self.contains(Self::INITIAL_CLOSED)
    }

    pub fn reply_opening(self) -> bool {
        self.contains(Self::REPLY_OPENING)
    }

    pub fn reply_opened(self) -> bool {
        self.contains(Self::REPLY_OPENED)
    }

    pub fn reply_closing(self) -> bool {
        self.contains(Self::REPLY_CLOSING)
    }

    pub fn reply_closed(self) -> bool {
        self.contains(Self::REPLY_CLOSED)
    }

    /// Both directions have reached a terminal state.
    pub fn closed(self) -> bool {
        self.initial_closed() && self.reply_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(max: u32) -> Flow {
        Flow {
            max,
            ..Flow::default()
        }
    }

    #[test]
    fn receive_within_window_advances_sequence() {
        let mut flow = window(100);
        flow.receive(0, 40).unwrap();
        flow.receive(40, 60).unwrap();
        assert_eq!(flow.seq, 100);
        assert_eq!(flow.available(), 0);
    }

    #[test]
    fn receive_beyond_window_is_rejected_without_change() {
        let mut flow = window(100);
        flow.receive(0, 90).unwrap();
        let err = flow.receive(90, 11).unwrap_err();
        assert!(matches!(err, FlowError::WindowExceeded { seq: 101, .. }));
        assert_eq!(flow.seq, 90);
    }

    #[test]
    fn receive_near_sequence_limit_is_a_window_violation() {
        let mut flow = window(100);
        let err = flow.receive(u64::MAX - 2, 10).unwrap_err();
        assert!(matches!(err, FlowError::WindowExceeded { seq: u64::MAX, .. }));
        assert_eq!(flow.seq, 0);
    }

    #[test]
    fn receive_rejects_regressed_sequence() {
        let mut flow = window(100);
        flow.receive(0, 50).unwrap();
        assert!(matches!(
            flow.receive(10, 1),
            Err(FlowError::SequenceRegressed { current: 50, received: 10 })
        ));
    }

    #[test]
    fn credit_checks_acknowledge_bounds() {
        let mut flow = window(100);
        flow.send(80).unwrap();
        flow.credit(80, 50, 100, 0, 0).unwrap();
        assert_eq!(flow.available(), 70);
        assert!(matches!(
            flow.credit(80, 40, 100, 0, 0),
            Err(FlowError::AckRegressed { .. })
        ));
        assert!(matches!(
            flow.credit(90, 90, 100, 0, 0),
            Err(FlowError::AckBeyondSeq { .. })
        ));
    }

    #[test]
    fn send_respects_padding_aware_fit() {
        let mut flow = window(100);
        flow.pad = 10;
        assert!(flow.fits(90));
        assert!(!flow.fits(91));
        flow.send(100).unwrap();
        assert!(flow.send(1).is_err());
        assert!(flow.seq <= flow.ack + flow.max as u64);
    }

    #[test]
    fn grant_clamps_to_received() {
        let mut flow = window(100);
        flow.receive(0, 30).unwrap();
        flow.grant(500, 200);
        assert_eq!(flow.ack, 30);
        assert_eq!(flow.max, 200);
        flow.grant(0, 200);
        assert_eq!(flow.ack, 30);
    }

    #[test]
    fn closed_requires_both_directions() {
        let mut state = StreamState::default();
        state.open_initial();
        state.close_initial();
        assert!(state.initial_closed());
        assert!(!state.closed());
        state.close_reply();
        assert!(state.closed());
        assert!(state.reply_closing());
    }
}
