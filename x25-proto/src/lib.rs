//! Low-level protocol logic for an X.25 style packet layer
//!
//! x25-proto contains a fully deterministic implementation of the virtual-circuit packet layer
//! used by X.25 and ROSE packet radio networks. It contains no I/O and takes every timestamp
//! from its caller. Most users will want the tokio-based x25 crate instead.
//!
//! The most important type is [`Neighbour`], which represents the protocol state of one link to
//! an adjacent node. It brings the link up with the restart procedure, dispatches incoming
//! frames to circuits by logical channel, and collects the frames circuits want to send. Each
//! circuit runs call setup, windowed data transfer, interrupts, resets and clearing on its own.
//!
//! Frames leave through an [`Egress`] queue, a three-band priority discipline feeding a
//! [`NetDevice`], so that control traffic overtakes bulk data.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
// Fixes welcome:
#![allow(clippy::too_many_arguments)]

use bytes::Bytes;

mod address;
pub use crate::address::{Address, AddressError, Callsign, MAX_ADDRESS_DIGITS};

mod circuit;
pub use crate::circuit::{CircuitStats, CloseReason, Event, SendError, State};

#[doc(hidden)]
pub mod coding;

mod config;
pub use crate::config::{
    CircuitConfig, ConfigError, NeighbourConfig, OutOfSequencePolicy, QueueConfig,
};

mod facilities;
pub use crate::facilities::{Directional, Facilities, Nsap, MAX_DIGIS, MAX_IDENT_LEN};

mod frame;
pub use crate::frame::{
    CallSetup, Cause, Data, Frame, FrameType, Header, Packet, HEADER_SIZE, MAX_CALL_USER_DATA,
    MAX_INTERRUPT_DATA,
};

mod neighbour;
pub use crate::neighbour::{
    CircuitHandle, ConnectError, LinkState, Neighbour, NeighbourStats, UnknownCircuit,
    MAX_CALL_REQUEST_USER_DATA,
};

pub mod qdisc;
pub use crate::qdisc::{Band, Egress, EgressState, NetDevice, QueueEntry};

mod reassembly;
pub use crate::reassembly::{Reassembly, ReassemblyError};

mod send_buffer;

mod shared;
pub use crate::shared::{Lci, Modulus};

#[cfg(test)]
mod tests;

mod window;
pub use crate::window::{AckPolicy, Condition, DataVerdict, Window};

/// Which end of a circuit placed the call
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// Sent the call request
    Caller = 0,
    /// Accepted the call request
    Callee = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Caller`
    pub fn is_caller(self) -> bool {
        self == Self::Caller
    }

    /// Place our incoming and outgoing values in wire order
    ///
    /// Facilities name directions after the calling and called ends; what flows from the
    /// called end is incoming for the caller.
    pub(crate) fn directional<T>(self, incoming: T, outgoing: T) -> Directional<T> {
        match self {
            Self::Caller => Directional {
                from_called: incoming,
                from_calling: outgoing,
            },
            Self::Callee => Directional {
                from_called: outgoing,
                from_calling: incoming,
            },
        }
    }

    /// Inverse of [`directional`](Self::directional), yielding `(incoming, outgoing)`
    pub(crate) fn split<T>(self, value: Directional<T>) -> (T, T) {
        match self {
            Self::Caller => (value.from_called, value.from_calling),
            Self::Callee => (value.from_calling, value.from_called),
        }
    }
}

/// An outgoing frame
#[derive(Debug, Clone)]
pub struct Transmit {
    /// Channel the frame belongs to
    pub lci: Lci,
    /// Priority band the frame should be queued in
    pub band: Band,
    /// Encoded frame, header included
    pub contents: Bytes,
}
