//! Tor SENDME Flow Control
//!
//! Implements Tor's fixed-window flow control.
//!
//! ## How It Works:
//!
//! 1. **Windows:** Each stream and circuit has send/receive windows
//! 2. **Decrement:** Window decrements on each DATA cell sent/received
//! 3. **SENDME:** Once the receive window has dropped by one increment,
//!    send a SENDME and credit it back
//! 4. **Increment:** Receiving SENDME increments the send window
//!
//! ## Window Values
//!
//! - **Initial window:** 1000 cells (circuit), 500 cells (stream)
//! - **Increment:** 100 cells per SENDME (circuit), 50 cells (stream)
//!
//! A send window never goes below zero: the owner stops sending and waits
//! for credit instead.

use crate::error::{Result, TorError};
use std::collections::VecDeque;
use std::marker::PhantomData;

/// Window sizes for one level of flow control
pub trait WindowParams {
    /// Window size at creation
    const INITIAL_WINDOW: u16;
    /// Credit carried by one SENDME
    const WINDOW_INCREMENT: u16;
    /// Used in log and error messages
    const LEVEL: &'static str;
}

/// Circuit-level windows
#[derive(Debug, Clone, Copy)]
pub struct CircuitWindow;

impl WindowParams for CircuitWindow {
    const INITIAL_WINDOW: u16 = 1000;
    const WINDOW_INCREMENT: u16 = 100;
    const LEVEL: &'static str = "circuit";
}

/// Stream-level windows
#[derive(Debug, Clone, Copy)]
pub struct StreamWindow;

impl WindowParams for StreamWindow {
    const INITIAL_WINDOW: u16 = 500;
    const WINDOW_INCREMENT: u16 = 50;
    const LEVEL: &'static str = "stream";
}

/// Digest of the cell a SENDME is expected to acknowledge
pub type SendmeTag = [u8; 20];

/// Send and receive windows for one circuit or stream
///
/// Owned by exactly one task; nothing here is shared.
#[derive(Debug, Clone)]
pub struct FlowControl<P: WindowParams> {
    send_window: u16,
    recv_window: u16,
    /// One entry per SENDME we are owed, oldest first
    expected: VecDeque<Option<SendmeTag>>,
    _params: PhantomData<P>,
}

/// Circuit-level flow control
pub type CircuitFlowControl = FlowControl<CircuitWindow>;

/// Stream-level flow control
pub type StreamFlowControl = FlowControl<StreamWindow>;

impl<P: WindowParams> FlowControl<P> {
    /// Create new flow control with full windows
    pub fn new() -> Self {
        Self {
            send_window: P::INITIAL_WINDOW,
            recv_window: P::INITIAL_WINDOW,
            expected: VecDeque::new(),
            _params: PhantomData,
        }
    }

    /// Cells we can still send before needing a SENDME
    pub fn send_window(&self) -> u16 {
        self.send_window
    }

    /// Cells the peer can still send us before we owe a SENDME
    pub fn recv_window(&self) -> u16 {
        self.recv_window
    }

    /// Check if we can send a cell
    pub fn can_send(&self) -> bool {
        self.send_window > 0
    }

    /// Decrement send window when sending a DATA cell
    ///
    /// `tag` is the digest of the outgoing cell; it is remembered when this
    /// cell completes an increment, since that is the cell the peer's
    /// SENDME will acknowledge.
    pub fn on_send(&mut self, tag: Option<SendmeTag>) -> Result<u16> {
        let window = self.send_window.checked_sub(1).ok_or_else(|| {
            TorError::Protocol(format!("{} send window exhausted", P::LEVEL))
        })?;
        self.send_window = window;

        if window % P::WINDOW_INCREMENT == 0 {
            self.expected.push_back(tag);
        }
        Ok(window)
    }

    /// Increment send window when receiving SENDME
    ///
    /// A SENDME nobody asked for, or one whose digest does not match the
    /// cell it acknowledges, is a protocol violation.
    pub fn on_sendme_received(&mut self, tag: Option<SendmeTag>) -> Result<u16> {
        let expected = self.expected.pop_front().ok_or_else(|| {
            TorError::Protocol(format!("unexpected {} SENDME", P::LEVEL))
        })?;

        if let (Some(expected), Some(got)) = (expected, tag) {
            if expected != got {
                return Err(TorError::Protocol(format!(
                    "{} SENDME acknowledges the wrong cell",
                    P::LEVEL
                )));
            }
        }

        self.send_window += P::WINDOW_INCREMENT;
        log::debug!(
            "{} send window: {} (+{})",
            P::LEVEL,
            self.send_window,
            P::WINDOW_INCREMENT
        );
        Ok(self.send_window)
    }

    /// Decrement receive window when a DATA cell arrives
    pub fn on_receive(&mut self) -> Result<u16> {
        let window = self.recv_window.checked_sub(1).ok_or_else(|| {
            TorError::Protocol(format!("peer overran {} receive window", P::LEVEL))
        })?;
        self.recv_window = window;
        Ok(window)
    }

    /// Whether the receive window has dropped by a full increment
    pub fn needs_sendme(&self) -> bool {
        self.recv_window <= P::INITIAL_WINDOW - P::WINDOW_INCREMENT
    }

    /// Credit the receive window after sending a SENDME
    pub fn on_sendme_sent(&mut self) {
        self.recv_window += P::WINDOW_INCREMENT;
    }
}

impl<P: WindowParams> Default for FlowControl<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_flow_control_basic() {
        let mut fc = CircuitFlowControl::new();

        // Initial state
        assert_eq!(fc.send_window(), 1000);
        assert_eq!(fc.recv_window(), 1000);
        assert!(fc.can_send());

        // Send one increment of cells
        for _ in 0..100 {
            fc.on_send(Some([7; 20])).unwrap();
        }
        assert_eq!(fc.send_window(), 900);

        // Receive SENDME
        assert_eq!(fc.on_sendme_received(Some([7; 20])).unwrap(), 1000);
    }

    #[test]
    fn test_stream_flow_control_basic() {
        let mut fc = StreamFlowControl::new();
        assert_eq!(fc.send_window(), 500);

        for _ in 0..50 {
            fc.on_send(None).unwrap();
        }
        assert_eq!(fc.send_window(), 450);

        assert_eq!(fc.on_sendme_received(None).unwrap(), 500);
    }

    #[test]
    fn test_window_exhaustion() {
        let mut fc = StreamFlowControl::new();

        // Exhaust window
        for _ in 0..500 {
            assert!(fc.can_send());
            fc.on_send(None).unwrap();
        }

        // Never below zero
        assert!(!fc.can_send());
        assert!(fc.on_send(None).is_err());
        assert_eq!(fc.send_window(), 0);

        // Unblock with SENDME
        fc.on_sendme_received(None).unwrap();
        assert!(fc.can_send());
        assert_eq!(fc.send_window(), 50);
    }

    #[test]
    fn test_unexpected_sendme() {
        let mut fc = CircuitFlowControl::new();
        assert!(fc.on_sendme_received(None).is_err());

        // 99 cells do not earn a SENDME yet
        for _ in 0..99 {
            fc.on_send(Some([1; 20])).unwrap();
        }
        assert!(fc.on_sendme_received(None).is_err());
        assert_eq!(fc.send_window(), 901);
    }

    #[test]
    fn test_sendme_tag_records_hundredth_cell() {
        let mut fc = CircuitFlowControl::new();
        for i in 1..=200u8 {
            fc.on_send(Some([i; 20])).unwrap();
        }

        // Wrong digest
        let mut other = fc.clone();
        assert!(other.on_sendme_received(Some([99; 20])).is_err());

        // Digests are matched oldest first
        assert_eq!(fc.on_sendme_received(Some([100; 20])).unwrap(), 900);
        assert_eq!(fc.on_sendme_received(Some([200; 20])).unwrap(), 1000);
    }

    #[test]
    fn test_circuit_flow_control_receive() {
        let mut fc = CircuitFlowControl::new();

        for i in 1..=100 {
            fc.on_receive().unwrap();
            assert_eq!(fc.needs_sendme(), i == 100);
        }
        assert_eq!(fc.recv_window(), 900);

        fc.on_sendme_sent();
        assert_eq!(fc.recv_window(), 1000);
        assert!(!fc.needs_sendme());
    }

    #[test]
    fn test_stream_flow_control_receive() {
        let mut fc = StreamFlowControl::new();

        for i in 1..=50 {
            fc.on_receive().unwrap();
            assert_eq!(fc.needs_sendme(), i == 50);
        }
        fc.on_sendme_sent();
        assert_eq!(fc.recv_window(), 500);
    }

    #[test]
    fn test_receive_overrun() {
        let mut fc = StreamFlowControl::new();
        for _ in 0..500 {
            fc.on_receive().unwrap();
        }
        assert!(fc.on_receive().is_err());
    }

    #[test]
    fn test_interleaved_send_receive() {
        let mut fc = StreamFlowControl::new();

        // Send 250 cells
        for _ in 0..250 {
            fc.on_send(None).unwrap();
        }
        assert_eq!(fc.send_window(), 250);

        // Receiving does not touch the send side
        for _ in 0..50 {
            fc.on_receive().unwrap();
        }
        assert!(fc.needs_sendme());
        assert_eq!(fc.send_window(), 250);
    }
}
