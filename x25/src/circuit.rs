use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use proto::{
    Address, CircuitHandle, CircuitStats, CloseReason, Event, Facilities, Lci, SendError, State,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{neighbour::NeighbourInner, now};

/// In-progress outgoing call
///
/// Resolves to the connected [`Circuit`] once the peer accepts. Dropping it clears the call.
#[must_use = "futures/streams/sinks do nothing unless you `.await` or poll them"]
pub struct Connecting {
    circuit: Option<Circuit>,
}

impl Connecting {
    pub(crate) fn new(circuit: Circuit) -> Self {
        Self {
            circuit: Some(circuit),
        }
    }
}

impl Future for Connecting {
    type Output = Result<Circuit, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let Some(circuit) = self.circuit.as_mut() else {
            panic!("polled after completion");
        };
        loop {
            match circuit.events.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Event::Connected { user_data })) => {
                    circuit.user_data = user_data;
                    break;
                }
                Poll::Ready(Some(Event::Closed(reason))) => {
                    circuit.closed = true;
                    self.circuit = None;
                    return Poll::Ready(Err(ConnectionError::Closed(reason)));
                }
                Poll::Ready(Some(event)) => {
                    trace!(?event, "ignoring event during call setup");
                }
                Poll::Ready(None) => {
                    circuit.closed = true;
                    self.circuit = None;
                    return Poll::Ready(Err(ConnectionError::DriverLost));
                }
            }
        }
        match self.circuit.take() {
            Some(circuit) => Poll::Ready(Ok(circuit)),
            None => Poll::Pending,
        }
    }
}

impl fmt::Debug for Connecting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connecting")
            .field("circuit", &self.circuit)
            .finish()
    }
}

/// A virtual circuit to a remote station
///
/// Messages and other happenings on the circuit are read with [`next_event`](Self::next_event).
/// Dropping the circuit clears it.
pub struct Circuit {
    neighbour: Arc<NeighbourInner>,
    handle: CircuitHandle,
    remote: Address,
    events: mpsc::UnboundedReceiver<Event>,
    /// Call user data of the call accepted frame
    user_data: Bytes,
    /// Set once `Closed` was delivered or the driver went away
    closed: bool,
}

impl Circuit {
    pub(crate) fn new(
        neighbour: Arc<NeighbourInner>,
        handle: CircuitHandle,
        remote: Address,
        events: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            neighbour,
            handle,
            remote,
            events,
            user_data: Bytes::new(),
            closed: false,
        }
    }

    /// Queue a message; it is split into frames as the negotiated packet size requires
    pub fn send(&self, data: Bytes) -> Result<(), SendError> {
        let ch = self.handle;
        self.neighbour.operate("send", |n| n.send(now(), ch, data))
    }

    /// Queue a message with the qualifier bit set on every frame
    pub fn send_qualified(&self, data: Bytes) -> Result<(), SendError> {
        let ch = self.handle;
        self.neighbour
            .operate("send_qualified", |n| n.send_qualified(now(), ch, data))
    }

    /// Send up to 32 octets of expedited data, ahead of anything queued
    pub fn send_interrupt(&self, data: Bytes) -> Result<(), SendError> {
        let ch = self.handle;
        self.neighbour
            .operate("send_interrupt", |n| n.send_interrupt(ch, data))
    }

    /// Ask the peer to stop sending data, or to resume
    pub fn set_receiver_busy(&self, busy: bool) -> Result<(), SendError> {
        let ch = self.handle;
        self.neighbour
            .operate("set_receiver_busy", |n| n.set_receiver_busy(ch, busy))
    }

    /// Resynchronise the circuit, discarding data in flight in both directions
    pub fn reset(&self) -> Result<(), SendError> {
        let ch = self.handle;
        self.neighbour
            .operate("reset", |n| n.request_reset(now(), ch))
    }

    /// Clear the circuit
    ///
    /// [`Event::Closed`] is delivered once the peer confirms.
    pub fn disconnect(&self) {
        let ch = self.handle;
        if self
            .neighbour
            .operate("disconnect", |n| n.request_clear(now(), ch))
            .is_err()
        {
            trace!(%ch, "circuit already gone");
        }
    }

    /// Wait for the next event
    ///
    /// Returns `None` after [`Event::Closed`] has been returned, or if the neighbour's
    /// background task has stopped.
    pub async fn next_event(&mut self) -> Option<Event> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await;
        match event {
            Some(Event::Closed(_)) | None => self.closed = true,
            Some(_) => {}
        }
        event
    }

    /// Address of the other end
    pub fn remote(&self) -> Address {
        self.remote
    }

    /// Call user data the peer sent when accepting our call
    ///
    /// Empty for calls we accepted; their user data is part of the call setup returned by
    /// [`Neighbour::accept`](crate::Neighbour::accept).
    pub fn accepted_user_data(&self) -> &Bytes {
        &self.user_data
    }

    /// Logical channel the circuit runs on, if it is still open
    pub fn lci(&self) -> Option<Lci> {
        self.neighbour.state.lock("lci").inner.lci(self.handle)
    }

    /// Current procedure, if the circuit is still open
    pub fn state(&self) -> Option<State> {
        self.neighbour.state.lock("state").inner.state(self.handle)
    }

    /// Negotiated facilities, if the circuit is still open
    pub fn facilities(&self) -> Option<Facilities> {
        self.neighbour
            .state
            .lock("facilities")
            .inner
            .facilities(self.handle)
            .cloned()
    }

    /// Counters, if the circuit is still open
    pub fn stats(&self) -> Option<CircuitStats> {
        self.neighbour
            .state
            .lock("circuit_stats")
            .inner
            .circuit_stats(self.handle)
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let ch = self.handle;
        let _ = self
            .neighbour
            .operate("drop circuit", |n| n.request_clear(now(), ch));
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("handle", &self.handle)
            .field("remote", &self.remote)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Reasons why a call could not be completed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The circuit closed before it connected
    #[error("{0}")]
    Closed(CloseReason),
    /// The neighbour's background task stopped
    #[error("neighbour driver stopped")]
    DriverLost,
}
