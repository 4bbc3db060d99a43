//! Sliding-window flow control
//!
//! All sequence arithmetic is modulo the link's [`Modulus`]; ordering is always expressed as
//! forward distance from a reference point, never as a raw comparison.

use bitflags::bitflags;

use crate::{send_buffer::SendBuffer, shared::Modulus};

bitflags! {
    /// Flow control conditions of a circuit
    ///
    /// These combine freely, e.g. both ends can be busy while an acknowledgement is pending.
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
    pub struct Condition: u8 {
        /// The peer sent RNR and must not be sent data
        const PEER_RX_BUSY = 0x01;
        /// We sent RNR and drop incoming data
        const OWN_RX_BUSY = 0x02;
        /// Accepted data has not yet been acknowledged
        const ACK_PENDING = 0x04;
        /// An interrupt we sent awaits confirmation
        const INTERRUPT_PENDING = 0x08;
        /// A reject was sent for the current gap
        const REJECT_SENT = 0x10;
    }
}

/// Outcome of offering a data frame to the receive window
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataVerdict {
    /// In sequence; `vr` advanced
    Accepted,
    /// Not the expected sequence number
    OutOfSequence {
        /// Whether the frame lies behind `vr`, i.e. was already received
        duplicate: bool,
    },
    /// We are flow-controlling the peer and the frame was not accepted
    ReceiverBusy,
}

/// Whether to acknowledge received data now or later
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckPolicy {
    /// The receive window is full
    SendNow,
    /// Wait for the ack-delay timer or a piggyback opportunity
    Delay,
}

/// Sequence counters and flow control state of one circuit
#[derive(Debug, Clone)]
pub struct Window {
    modulus: Modulus,
    /// Next sequence number to send
    vs: u8,
    /// Lowest unacknowledged sequence number
    va: u8,
    /// Next sequence number expected from the peer
    vr: u8,
    /// Value of `vr` carried by the last acknowledgement we sent
    vl: u8,
    window_in: u8,
    window_out: u8,
    pub(crate) condition: Condition,
}

impl Window {
    /// Fresh counters for a circuit using the given window sizes
    ///
    /// Sizes are clamped to `1..M`.
    pub fn new(modulus: Modulus, window_in: u8, window_out: u8) -> Self {
        let clamp = |x: u8| x.clamp(1, modulus.get() - 1);
        Self {
            modulus,
            vs: 0,
            va: 0,
            vr: 0,
            vl: 0,
            window_in: clamp(window_in),
            window_out: clamp(window_out),
            condition: Condition::empty(),
        }
    }

    /// Whether `nr` lies in `[va, vs]`, walking forward modulo `M`
    pub fn validate_ack(&self, nr: u8) -> bool {
        nr < self.modulus.get()
            && self.modulus.distance(self.va, nr) <= self.modulus.distance(self.va, self.vs)
    }

    /// Advance `va` to a validated `nr`, releasing acknowledged frames from `sent`
    ///
    /// Returns the number of frames newly acknowledged.
    pub fn apply_ack(&mut self, nr: u8, sent: &mut SendBuffer) -> usize {
        debug_assert!(self.validate_ack(nr));
        let acked = self.modulus.distance(self.va, nr) as usize;
        self.va = nr;
        sent.acknowledge(acked);
        acked
    }

    /// Offer a data frame with sequence number `ns`
    pub fn accept_data(&mut self, ns: u8) -> DataVerdict {
        if self.condition.contains(Condition::OWN_RX_BUSY) {
            return DataVerdict::ReceiverBusy;
        }
        if ns == self.vr {
            self.vr = self.modulus.add(self.vr, 1);
            self.condition.remove(Condition::REJECT_SENT);
            return DataVerdict::Accepted;
        }
        // Anything the peer could legally send next lies within window_in of vr
        let ahead = self.modulus.distance(self.vr, ns);
        DataVerdict::OutOfSequence {
            duplicate: ahead >= self.window_in,
        }
    }

    /// Decide how to acknowledge, updating [`Condition::ACK_PENDING`]
    pub fn ack_policy(&mut self) -> AckPolicy {
        if self.modulus.add(self.vl, self.window_in) == self.vr {
            self.condition.remove(Condition::ACK_PENDING);
            AckPolicy::SendNow
        } else {
            self.condition.insert(Condition::ACK_PENDING);
            AckPolicy::Delay
        }
    }

    /// Whether the output window admits another data frame
    pub fn can_send(&self) -> bool {
        !self.condition.contains(Condition::PEER_RX_BUSY)
            && self.vs != self.modulus.add(self.va, self.window_out)
    }

    /// Stamp the next outgoing data frame, advancing `vs`
    pub fn take_send_seq(&mut self) -> u8 {
        let ns = self.vs;
        self.vs = self.modulus.add(self.vs, 1);
        ns
    }

    /// Record that an acknowledgement carrying `vr` went out
    pub fn acked(&mut self) {
        self.vl = self.vr;
        self.condition.remove(Condition::ACK_PENDING);
    }

    /// Zero every counter and clear every condition
    pub fn reset(&mut self) {
        self.vs = 0;
        self.va = 0;
        self.vr = 0;
        self.vl = 0;
        self.condition = Condition::empty();
    }

    /// Retransmit from `va`
    pub fn rewind(&mut self) {
        self.vs = self.va;
    }

    /// Next sequence number to send
    pub fn vs(&self) -> u8 {
        self.vs
    }

    /// Lowest unacknowledged sequence number
    pub fn va(&self) -> u8 {
        self.va
    }

    /// Next expected sequence number
    pub fn vr(&self) -> u8 {
        self.vr
    }

    /// Last acknowledged receive sequence number
    pub fn vl(&self) -> u8 {
        self.vl
    }

    /// Current flow control conditions
    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// Sequence numbering in use
    pub fn modulus(&self) -> Modulus {
        self.modulus
    }

    /// Receive window size
    pub fn window_in(&self) -> u8 {
        self.window_in
    }

    /// Send window size
    pub fn window_out(&self) -> u8 {
        self.window_out
    }

    #[cfg(test)]
    pub(crate) fn set_counters(&mut self, vs: u8, va: u8, vr: u8, vl: u8) {
        self.vs = vs;
        self.va = va;
        self.vr = vr;
        self.vl = vl;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_buffer::Segment;
    use bytes::Bytes;

    #[test]
    fn ack_range_wraps() {
        let mut w = Window::new(Modulus::Basic, 7, 7);
        w.set_counters(2, 6, 0, 0);
        for nr in [6, 7, 0, 1, 2] {
            assert!(w.validate_ack(nr), "nr {nr}");
        }
        for nr in [3, 4, 5, 8, 200] {
            assert!(!w.validate_ack(nr), "nr {nr}");
        }
    }

    #[test]
    fn nothing_outstanding_accepts_only_va() {
        let mut w = Window::new(Modulus::Extended, 2, 2);
        w.set_counters(77, 77, 0, 0);
        assert!(w.validate_ack(77));
        assert!(!w.validate_ack(78));
        assert!(!w.validate_ack(76));
    }

    #[test]
    fn apply_ack_releases_frames() {
        let mut w = Window::new(Modulus::Basic, 2, 7);
        let mut sent = SendBuffer::default();
        for _ in 0..3 {
            sent.push(Segment::new(Bytes::from_static(b"x"), false));
            sent.pop_send();
            w.take_send_seq();
        }
        assert_eq!(sent.unacked(), 3);
        assert_eq!(w.apply_ack(2, &mut sent), 2);
        assert_eq!(w.va(), 2);
        assert_eq!(sent.unacked(), 1);
    }

    #[test]
    fn window_full_sends_now() {
        let mut w = Window::new(Modulus::Basic, 2, 2);
        assert_eq!(w.accept_data(0), DataVerdict::Accepted);
        assert_eq!(w.ack_policy(), AckPolicy::Delay);
        assert!(w.condition().contains(Condition::ACK_PENDING));
        assert_eq!(w.accept_data(1), DataVerdict::Accepted);
        assert_eq!(w.ack_policy(), AckPolicy::SendNow);
        assert!(!w.condition().contains(Condition::ACK_PENDING));
    }

    #[test]
    fn out_of_sequence_classification() {
        let mut w = Window::new(Modulus::Basic, 2, 2);
        w.set_counters(0, 0, 5, 5);
        assert_eq!(
            w.accept_data(4),
            DataVerdict::OutOfSequence { duplicate: true }
        );
        assert_eq!(
            w.accept_data(6),
            DataVerdict::OutOfSequence { duplicate: false }
        );
        assert_eq!(w.vr(), 5);
        w.condition.insert(Condition::OWN_RX_BUSY);
        assert_eq!(w.accept_data(5), DataVerdict::ReceiverBusy);
        assert_eq!(w.vr(), 5);
    }

    #[test]
    fn gaps_in_a_wide_window() {
        let mut w = Window::new(Modulus::Basic, 7, 7);
        assert_eq!(
            w.accept_data(1),
            DataVerdict::OutOfSequence { duplicate: false }
        );
        assert_eq!(
            w.accept_data(6),
            DataVerdict::OutOfSequence { duplicate: false }
        );
        assert_eq!(
            w.accept_data(7),
            DataVerdict::OutOfSequence { duplicate: true }
        );

        let mut w = Window::new(Modulus::Extended, 127, 127);
        w.set_counters(0, 0, 100, 100);
        assert_eq!(
            w.accept_data(101),
            DataVerdict::OutOfSequence { duplicate: false }
        );
        assert_eq!(
            w.accept_data(98),
            DataVerdict::OutOfSequence { duplicate: false }
        );
        assert_eq!(
            w.accept_data(99),
            DataVerdict::OutOfSequence { duplicate: true }
        );
        assert_eq!(w.vr(), 100);
    }

    #[test]
    fn output_window_closes() {
        let mut w = Window::new(Modulus::Basic, 2, 2);
        assert!(w.can_send());
        w.take_send_seq();
        w.take_send_seq();
        assert!(!w.can_send());
        w.rewind();
        assert_eq!(w.vs(), 0);
        assert!(w.can_send());
        w.condition.insert(Condition::PEER_RX_BUSY);
        assert!(!w.can_send());
    }

    #[test]
    fn sizes_are_clamped_to_modulus() {
        let w = Window::new(Modulus::Basic, 0, 200);
        assert_eq!(w.window_in(), 1);
        assert_eq!(w.window_out(), 7);
    }
}
