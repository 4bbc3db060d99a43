//! X.25 style virtual circuits over a shared link, driven by tokio
//!
//! This crate runs the packet layer of [`x25-proto`](proto) on a tokio runtime. A [`Device`]
//! owns the egress queue of one physical link and feeds it through a [`Link`]; a [`Neighbour`]
//! runs the restart procedure and every circuit to the node at the other end of that link.
//!
//! Calls are placed with [`Neighbour::connect`] and answered with [`Neighbour::accept`]. Both
//! yield a [`Circuit`], which sends messages and reports what the peer does as [`Event`]s.
//!
//! Frames received from the link are not read by this crate; whoever owns the link hands them
//! to [`Neighbour::frame_received`], and reports link establishment and failure with
//! [`Neighbour::link_up`] and [`Neighbour::link_down`].

#![warn(missing_docs)]
#![warn(unreachable_pub)]

use std::time::Instant;

mod circuit;
mod device;
mod mutex;
mod neighbour;

pub use proto::{
    qdisc, Address, AddressError, Band, CallSetup, Callsign, Cause, CircuitConfig, CircuitStats,
    CloseReason, ConfigError, ConnectError, Event, Facilities, Lci, LinkState, NeighbourConfig,
    NeighbourStats, OutOfSequencePolicy, QueueConfig, SendError, State,
};

pub use crate::circuit::{Circuit, Connecting, ConnectionError};
pub use crate::device::{Device, Link};
pub use crate::neighbour::Neighbour;


/// Current time on the runtime's clock, so that paused test time applies to protocol timers
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
