use std::{collections::VecDeque, fmt, sync::Arc, time::Instant};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    address::Address,
    circuit::{Circuit, CircuitStats, CloseReason, Event, SendError, State},
    config::NeighbourConfig,
    facilities::Facilities,
    frame::{CallSetup, Cause, Frame, Packet},
    qdisc::{Band, Egress, Enqueue, NetDevice},
    shared::{Lci, Modulus},
    window::Window,
    Side, Transmit,
};

/// Longest call user data accepted by [`Neighbour::connect`]
pub const MAX_CALL_REQUEST_USER_DATA: usize = 16;

/// Protocol state of one link to an adjacent node and every circuit running over it
///
/// This object performs no I/O whatsoever. It consumes frames received from the link via
/// [`handle`](Self::handle), and produces frames to send via
/// [`poll_transmit`](Self::poll_transmit) and events for circuit owners via
/// [`poll`](Self::poll). Timers are driven by [`poll_timeout`](Self::poll_timeout) and
/// [`handle_timeout`](Self::handle_timeout).
pub struct Neighbour {
    config: Arc<NeighbourConfig>,
    modulus: Modulus,
    link: LinkState,
    /// T20, armed while our restart request is unanswered
    restart_timer: Option<Instant>,
    circuits: Slab<CircuitMeta>,
    by_lci: FxHashMap<Lci, usize>,
    next_generation: u32,
    rng: StdRng,
    events: VecDeque<(CircuitHandle, Event)>,
    transmits: VecDeque<Transmit>,
    stats: NeighbourStats,
}

struct CircuitMeta {
    generation: u32,
    circuit: Circuit,
}

impl Neighbour {
    /// Create the state for a link that is currently down
    ///
    /// The sequence numbering modulus is taken from `config` and never changes afterwards.
    pub fn new(config: Arc<NeighbourConfig>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            modulus: match config.extended {
                true => Modulus::Extended,
                false => Modulus::Basic,
            },
            link: LinkState::Down,
            restart_timer: None,
            circuits: Slab::new(),
            by_lci: FxHashMap::default(),
            next_generation: 0,
            rng,
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            stats: NeighbourStats::default(),
            config,
        }
    }

    /// The underlying link has been established; run the restart procedure
    pub fn link_up(&mut self, now: Instant) {
        if self.link != LinkState::Down {
            trace!(link = ?self.link, "link already established");
            return;
        }
        debug!("link established, restarting");
        self.link = LinkState::Restarting;
        self.send_restart(now);
    }

    /// The underlying link failed
    ///
    /// Every circuit is closed with [`CloseReason::LinkDown`] and anything not yet collected by
    /// [`poll_transmit`](Self::poll_transmit) is discarded.
    pub fn link_down(&mut self) {
        if self.link == LinkState::Down && self.circuits.is_empty() {
            return;
        }
        debug!(circuits = self.circuits.len(), "link down");
        self.link = LinkState::Down;
        self.restart_timer = None;
        self.transmits.clear();
        self.close_all(CloseReason::LinkDown);
    }

    /// Place a call to `remote`
    ///
    /// If the link is still restarting, the call request is held until the restart completes.
    /// A random token is added to `facilities` unless one is already present.
    pub fn connect(
        &mut self,
        now: Instant,
        remote: Address,
        mut facilities: Facilities,
        user_data: Bytes,
    ) -> Result<CircuitHandle, ConnectError> {
        if self.link == LinkState::Down {
            return Err(ConnectError::LinkDown);
        }
        if user_data.len() > MAX_CALL_REQUEST_USER_DATA {
            return Err(ConnectError::UserDataTooLong);
        }
        if self.circuits.len() >= self.config.max_circuits {
            return Err(ConnectError::TooManyCircuits);
        }
        let lci = self.free_lci().ok_or(ConnectError::TooManyCircuits)?;
        if facilities.random.is_none() {
            facilities.random = Some(self.rng.gen());
        }

        let mut circuit = Circuit::outgoing(
            lci,
            self.modulus,
            self.config.circuit.clone(),
            self.config.local_address,
            remote,
            facilities,
            user_data,
        );
        if self.link == LinkState::Up {
            circuit.start_call(now);
        } else {
            debug!(%lci, "call held until restart completes");
        }
        let ch = self.insert(circuit);
        self.drain(ch.slot);
        Ok(ch)
    }

    /// Process a frame received from the link
    ///
    /// Returns the circuit the frame was dispatched to, if any. Frames that cannot be used are
    /// logged and dropped.
    pub fn handle(&mut self, now: Instant, data: Bytes) -> Option<CircuitHandle> {
        self.stats.frames_rx += 1;
        let packet = Packet::decode(data);
        if let Frame::Illegal = packet.frame {
            debug!("dropping unparseable frame");
            self.stats.dropped += 1;
            return None;
        }
        if packet.header.modulus != self.modulus {
            debug!(
                lci = %packet.header.lci,
                got = %packet.header.modulus,
                "dropping frame with foreign sequence numbering"
            );
            self.stats.dropped += 1;
            return None;
        }

        let lci = packet.header.lci;
        if lci.is_link() {
            self.handle_link(now, packet.frame);
            return None;
        }
        if self.link != LinkState::Up {
            debug!(%lci, link = ?self.link, "dropping frame while link is not up");
            self.stats.dropped += 1;
            return None;
        }

        if let Some(&slot) = self.by_lci.get(&lci) {
            if let Frame::CallRequest(_) = packet.frame {
                debug!(%lci, "call collision, ignoring incoming call");
                self.stats.dropped += 1;
                return None;
            }
            let meta = &mut self.circuits[slot];
            let ch = CircuitHandle {
                slot,
                generation: meta.generation,
            };
            let _guard = debug_span!("circuit", %lci).entered();
            meta.circuit.handle(now, packet);
            self.drain(slot);
            return Some(ch);
        }

        match packet.frame {
            Frame::CallRequest(setup) => self.handle_call(now, lci, setup),
            frame => {
                debug!(%lci, frame = ?frame.ty(), "dropping frame for unknown channel");
                self.stats.dropped += 1;
                None
            }
        }
    }

    fn handle_call(&mut self, now: Instant, lci: Lci, setup: CallSetup) -> Option<CircuitHandle> {
        let refuse = if !self.config.accept_incoming {
            Some("not accepting calls")
        } else if self.circuits.len() >= self.config.max_circuits {
            Some("circuit limit reached")
        } else {
            None
        };
        if let Some(why) = refuse {
            debug!(%lci, calling = %setup.calling, why, "refusing call");
            self.stats.refused += 1;
            self.transmit_link(lci, Frame::ClearRequest(Cause::NUMBER_BUSY));
            return None;
        }

        debug!(%lci, calling = %setup.calling, called = %setup.called, "accepting call");
        let circuit = Circuit::incoming(
            now,
            lci,
            self.modulus,
            self.config.circuit.clone(),
            self.config.local_address,
            setup,
        );
        let ch = self.insert(circuit);
        self.drain(ch.slot);
        Some(ch)
    }

    fn handle_link(&mut self, now: Instant, frame: Frame) {
        match frame {
            Frame::RestartRequest(cause) => {
                debug!(%cause, link = ?self.link, "peer restarted the link");
                self.stats.restarts += 1;
                // discard traffic of circuits that are about to go away
                self.transmits.retain(|t| t.lci.is_link());
                self.transmit_link(Lci::LINK, Frame::RestartConfirmation);
                match self.link {
                    LinkState::Up => self.close_all(CloseReason::Restarted(cause)),
                    LinkState::Restarting | LinkState::Down => self.established(now),
                }
            }
            Frame::RestartConfirmation => match self.link {
                LinkState::Restarting => {
                    debug!("restart confirmed");
                    self.established(now);
                }
                _ => debug!(link = ?self.link, "unexpected restart confirmation"),
            },
            Frame::Diagnostic { code, explanation } => {
                warn!(code, ?explanation, "diagnostic from peer");
            }
            Frame::RegistrationRequest(_) | Frame::RegistrationConfirmation(_) => {
                debug!("ignoring registration frame");
            }
            frame => {
                debug!(frame = ?frame.ty(), "ignoring frame on link channel");
                self.stats.dropped += 1;
            }
        }
    }

    /// The restart procedure finished; release held call requests
    fn established(&mut self, now: Instant) {
        self.link = LinkState::Up;
        self.restart_timer = None;
        let pending = self
            .circuits
            .iter()
            .filter(|(_, meta)| meta.circuit.is_call_pending())
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();
        for slot in pending {
            self.circuits[slot].circuit.start_call(now);
            self.drain(slot);
        }
    }

    fn send_restart(&mut self, now: Instant) {
        self.transmit_link(Lci::LINK, Frame::RestartRequest(Cause::DTE_ORIGINATED));
        self.restart_timer = Some(now + self.config.restart_timeout);
    }

    /// Queue a frame that belongs to no circuit
    fn transmit_link(&mut self, lci: Lci, frame: Frame) {
        trace!(%lci, frame = ?frame.ty(), "sending");
        self.transmits.push_back(Transmit {
            lci,
            band: Band::Control,
            contents: Packet::new(lci, self.modulus, frame).to_bytes(),
        });
    }

    /// Get the next frame to send on the link
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Move every queued frame into a device's egress queue and start it
    ///
    /// Returns how many frames the discipline accepted.
    pub fn flush(&mut self, now: Instant, egress: &mut Egress, dev: &mut dyn NetDevice) -> usize {
        let mut accepted = 0;
        while let Some(transmit) = self.transmits.pop_front() {
            if egress.enqueue(now, transmit.into(), dev) != Enqueue::Dropped {
                accepted += 1;
            }
        }
        accepted
    }

    /// Get the next event for a circuit owner
    pub fn poll(&mut self) -> Option<(CircuitHandle, Event)> {
        self.events.pop_front()
    }

    /// The earliest time at which [`handle_timeout`](Self::handle_timeout) should be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.circuits
            .iter()
            .filter_map(|(_, meta)| meta.circuit.poll_timeout())
            .chain(self.restart_timer)
            .min()
    }

    /// Process timer expirations
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.restart_timer.map_or(false, |t| t <= now) {
            warn!("restart not confirmed, retrying");
            self.send_restart(now);
        }
        let expired = self
            .circuits
            .iter()
            .filter(|(_, meta)| meta.circuit.poll_timeout().map_or(false, |t| t <= now))
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();
        for slot in expired {
            let circuit = &mut self.circuits[slot].circuit;
            let _guard = debug_span!("circuit", lci = %circuit.lci()).entered();
            circuit.handle_timeout(now);
            self.drain(slot);
        }
    }

    /// Queue a message on a connected circuit
    pub fn send(&mut self, now: Instant, ch: CircuitHandle, data: Bytes) -> Result<(), SendError> {
        self.with_circuit(ch, |c| c.send(now, data, false))?
    }

    /// Queue a message with the qualifier bit set on each of its frames
    pub fn send_qualified(
        &mut self,
        now: Instant,
        ch: CircuitHandle,
        data: Bytes,
    ) -> Result<(), SendError> {
        self.with_circuit(ch, |c| c.send(now, data, true))?
    }

    /// Send interrupt data, bypassing flow control
    pub fn send_interrupt(&mut self, ch: CircuitHandle, data: Bytes) -> Result<(), SendError> {
        self.with_circuit(ch, |c| c.send_interrupt(data))?
    }

    /// Tell the peer to stop (`true`) or resume (`false`) sending data
    pub fn set_receiver_busy(&mut self, ch: CircuitHandle, busy: bool) -> Result<(), SendError> {
        self.with_circuit(ch, |c| c.set_receiver_busy(busy))?
    }

    /// Resynchronise a connected circuit, discarding data in flight in both directions
    pub fn request_reset(&mut self, now: Instant, ch: CircuitHandle) -> Result<(), SendError> {
        self.with_circuit(ch, |c| c.request_reset(now))?
    }

    /// Clear a circuit
    ///
    /// [`Event::Closed`] follows once the peer confirms, or immediately if the call request
    /// never left.
    pub fn request_clear(&mut self, now: Instant, ch: CircuitHandle) -> Result<(), UnknownCircuit> {
        self.with_circuit(ch, |c| c.request_clear(now))
    }

    /// Current procedure of a circuit
    pub fn state(&self, ch: CircuitHandle) -> Option<State> {
        self.get(ch).map(Circuit::state)
    }

    /// Address of the other end of a circuit
    pub fn remote(&self, ch: CircuitHandle) -> Option<Address> {
        self.get(ch).map(Circuit::remote)
    }

    /// Channel a circuit runs on
    pub fn lci(&self, ch: CircuitHandle) -> Option<Lci> {
        self.get(ch).map(Circuit::lci)
    }

    /// Whether we placed the call
    pub fn side(&self, ch: CircuitHandle) -> Option<Side> {
        self.get(ch).map(Circuit::side)
    }

    /// Facilities proposed for an outgoing call, or negotiated once connected
    pub fn facilities(&self, ch: CircuitHandle) -> Option<&Facilities> {
        self.get(ch).map(Circuit::facilities)
    }

    /// Counters of a circuit
    pub fn circuit_stats(&self, ch: CircuitHandle) -> Option<CircuitStats> {
        self.get(ch).map(Circuit::stats)
    }

    /// Sequence state of a circuit
    pub fn window(&self, ch: CircuitHandle) -> Option<&Window> {
        self.get(ch).map(Circuit::window)
    }

    /// Whether a circuit still holds data that the peer has not acknowledged
    pub fn has_outstanding(&self, ch: CircuitHandle) -> Option<bool> {
        self.get(ch).map(Circuit::has_outstanding)
    }

    /// State of the link procedure
    pub fn link_state(&self) -> LinkState {
        self.link
    }

    /// Sequence numbering used on this link
    pub fn modulus(&self) -> Modulus {
        self.modulus
    }

    /// Number of circuits that have not yet reported [`Event::Closed`]
    pub fn circuit_count(&self) -> usize {
        self.circuits.len()
    }

    /// Link-wide counters
    pub fn stats(&self) -> NeighbourStats {
        self.stats
    }

    fn get(&self, ch: CircuitHandle) -> Option<&Circuit> {
        self.circuits
            .get(ch.slot)
            .filter(|meta| meta.generation == ch.generation)
            .map(|meta| &meta.circuit)
    }

    /// Run `f` on a live circuit, then collect what it produced
    fn with_circuit<T>(
        &mut self,
        ch: CircuitHandle,
        f: impl FnOnce(&mut Circuit) -> T,
    ) -> Result<T, UnknownCircuit> {
        let meta = match self.circuits.get_mut(ch.slot) {
            Some(meta) if meta.generation == ch.generation => meta,
            _ => return Err(UnknownCircuit),
        };
        let result = f(&mut meta.circuit);
        self.drain(ch.slot);
        Ok(result)
    }

    fn insert(&mut self, circuit: Circuit) -> CircuitHandle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let lci = circuit.lci();
        let slot = self.circuits.insert(CircuitMeta {
            generation,
            circuit,
        });
        self.by_lci.insert(lci, slot);
        CircuitHandle { slot, generation }
    }

    /// Lowest channel in the configured range with no circuit on it
    fn free_lci(&self) -> Option<Lci> {
        self.config
            .lci_range
            .clone()
            .map(Lci)
            .find(|lci| !self.by_lci.contains_key(lci))
    }

    /// Collect a circuit's frames and events, and forget it once it has closed
    fn drain(&mut self, slot: usize) {
        let Some(meta) = self.circuits.get_mut(slot) else {
            return;
        };
        let ch = CircuitHandle {
            slot,
            generation: meta.generation,
        };
        while let Some(transmit) = meta.circuit.poll_transmit() {
            self.transmits.push_back(transmit);
        }
        let mut closed = false;
        while let Some(event) = meta.circuit.poll() {
            closed |= matches!(event, Event::Closed(_));
            self.events.push_back((ch, event));
        }
        if closed {
            let meta = self.circuits.remove(slot);
            self.by_lci.remove(&meta.circuit.lci());
            trace!(lci = %meta.circuit.lci(), "circuit removed");
        }
    }

    fn close_all(&mut self, reason: CloseReason) {
        let slots = self.circuits.iter().map(|(slot, _)| slot).collect::<Vec<_>>();
        for slot in slots {
            self.circuits[slot].circuit.force_close(reason.clone());
            self.drain(slot);
        }
    }
}

impl fmt::Debug for Neighbour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Neighbour")
            .field("modulus", &self.modulus)
            .field("link", &self.link)
            .field("circuits", &self.circuits.len())
            .field("events", &self.events.len())
            .field("transmits", &self.transmits.len())
            .finish_non_exhaustive()
    }
}

/// Progress of the restart procedure that brings a link into service
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkState {
    /// No link
    Down,
    /// Restart request sent, waiting for confirmation
    Restarting,
    /// Calls may be placed
    Up,
}

/// Link-wide counters
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct NeighbourStats {
    /// Frames received from the link
    pub frames_rx: u64,
    /// Received frames that were not used
    pub dropped: u64,
    /// Incoming calls refused
    pub refused: u64,
    /// Restarts initiated by the peer
    pub restarts: u64,
}

/// Internal identifier for a circuit on a [`Neighbour`]
///
/// Handles of closed circuits never refer to a circuit created later, even if it reuses the
/// same storage.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CircuitHandle {
    slot: usize,
    generation: u32,
}

impl fmt::Display for CircuitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

/// Errors in the parameters being used to place a call
///
/// These arise before any frame has been sent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The link is down
    #[error("link is down")]
    LinkDown,
    /// Every channel is in use, or the configured circuit limit is reached
    #[error("too many circuits")]
    TooManyCircuits,
    /// Call user data longer than [`MAX_CALL_REQUEST_USER_DATA`]
    #[error("call user data too long")]
    UserDataTooLong,
}

/// Error indicating that a circuit handle does not refer to a live circuit
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("unknown circuit")]
pub struct UnknownCircuit;

impl From<UnknownCircuit> for SendError {
    fn from(_: UnknownCircuit) -> Self {
        Self::UnknownCircuit
    }
}
