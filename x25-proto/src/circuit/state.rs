use std::fmt;

use crate::frame::Cause;

/// Procedure a circuit is in
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Call request sent (or waiting for the link to come up), no answer yet
    AwaitingCallAccepted,
    /// Data transfer
    Connected,
    /// Reset request sent, waiting for confirmation
    AwaitingResetConfirm,
    /// Clear request sent, waiting for confirmation
    AwaitingClearConfirm,
    /// Terminal
    Idle,
}

impl State {
    /// Whether the circuit has finished
    pub fn is_closed(self) -> bool {
        self == Self::Idle
    }
}

/// Reasons why a circuit ended
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CloseReason {
    /// The peer refused our call
    Refused(Cause),
    /// The peer cleared the circuit
    Cleared(Cause),
    /// We cleared the circuit and the peer confirmed
    LocallyCleared,
    /// A call, reset or clear procedure ran out of retries
    TimedOut,
    /// No data was exchanged for the configured idle timeout
    IdleTimeout,
    /// The underlying link went down
    LinkDown,
    /// The link was restarted
    Restarted(Cause),
    /// Messages repeatedly could not be delivered
    ResourceExhausted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(cause) => write!(f, "call refused: {cause}"),
            Self::Cleared(cause) => write!(f, "cleared by peer: {cause}"),
            Self::LocallyCleared => f.write_str("closed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::LinkDown => f.write_str("link down"),
            Self::Restarted(cause) => write!(f, "link restarted: {cause}"),
            Self::ResourceExhausted => f.write_str("repeated delivery failures"),
        }
    }
}
