use std::{collections::VecDeque, sync::Arc, time::Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    address::Address,
    config::{CircuitConfig, OutOfSequencePolicy, DEFAULT_PACKET_SIZE, DEFAULT_WINDOW},
    facilities::{Directional, Facilities},
    frame::{CallSetup, Cause, Data, Frame, Header, Packet, MAX_INTERRUPT_DATA},
    qdisc::Band,
    reassembly::{Reassembler, Reassembly, ReassemblyError},
    send_buffer::{SendBuffer, Segment},
    shared::{Lci, Modulus},
    window::{AckPolicy, Condition, DataVerdict, Window},
    Side, Transmit,
};

mod state;
pub use state::{CloseReason, State};

mod timer;
use timer::{Timer, TimerTable};

/// Diagnostic: received N(R) outside the send window
const DIAG_INVALID_PR: u8 = 0x02;
/// Diagnostic: data field longer than the negotiated packet size
const DIAG_PACKET_TOO_LONG: u8 = 0x27;
/// Diagnostic: a procedure timer expired
const DIAG_TIMER_EXPIRED: u8 = 0x30;

/// Protocol state and logic for a single virtual circuit
///
/// Circuits are owned by a [`Neighbour`](crate::Neighbour), which routes frames to them by
/// logical channel and collects the frames and events they produce.
pub(crate) struct Circuit {
    lci: Lci,
    side: Side,
    local: Address,
    remote: Address,
    config: Arc<CircuitConfig>,
    state: State,
    window: Window,
    send_buffer: SendBuffer,
    reassembler: Reassembler,
    timers: TimerTable,
    /// Proposed facilities while calling, negotiated ones afterwards
    facilities: Facilities,
    packet_size_in: u16,
    packet_size_out: u16,
    /// Call request not yet sent because the link is restarting
    call_pending: Option<Bytes>,
    /// Cause carried by the reset or clear request we are retrying
    pending_cause: Cause,
    /// What to report once our clear request is confirmed
    close_reason: CloseReason,
    retries: u8,
    delivery_failures: u8,
    events: VecDeque<Event>,
    transmits: VecDeque<Transmit>,
    stats: CircuitStats,
}

impl Circuit {
    /// A circuit for a call we are placing
    ///
    /// Nothing is sent until [`start_call`](Self::start_call).
    pub(crate) fn outgoing(
        lci: Lci,
        modulus: Modulus,
        config: Arc<CircuitConfig>,
        local: Address,
        remote: Address,
        mut facilities: Facilities,
        user_data: Bytes,
    ) -> Self {
        let side = Side::Caller;
        let window = side.directional(
            clamp_window(config.window_in, modulus),
            clamp_window(config.window_out, modulus),
        );
        if facilities.window_size.is_none() && window != Directional::both(DEFAULT_WINDOW) {
            facilities.window_size = Some(window);
        }
        let packet = side.directional(config.packet_size_in, config.packet_size_out);
        if facilities.packet_size.is_none() && packet != Directional::both(DEFAULT_PACKET_SIZE) {
            facilities.packet_size = Some(packet);
        }
        let mut this = Self::new(lci, side, modulus, config, local, remote);
        this.facilities = facilities;
        this.call_pending = Some(user_data);
        this
    }

    /// A circuit for an incoming call we are accepting
    ///
    /// Queues the call accepted frame and enters data transfer immediately.
    pub(crate) fn incoming(
        now: Instant,
        lci: Lci,
        modulus: Modulus,
        config: Arc<CircuitConfig>,
        local: Address,
        setup: CallSetup,
    ) -> Self {
        let side = Side::Callee;
        let mut this = Self::new(lci, side, modulus, config, local, setup.calling);
        let ours = this.local_proposal();
        let theirs = Negotiable {
            window: setup
                .facilities
                .window_size
                .unwrap_or(Directional::both(DEFAULT_WINDOW)),
            packet: setup
                .facilities
                .packet_size
                .unwrap_or(Directional::both(DEFAULT_PACKET_SIZE)),
        };
        let agreed = this.adopt(ours, theirs);

        let mut reply = Facilities::default();
        if setup.facilities.window_size.is_some() || agreed.window != Directional::both(DEFAULT_WINDOW)
        {
            reply.window_size = Some(agreed.window);
        }
        if setup.facilities.packet_size.is_some()
            || agreed.packet != Directional::both(DEFAULT_PACKET_SIZE)
        {
            reply.packet_size = Some(agreed.packet);
        }
        this.facilities = Facilities {
            window_size: Some(agreed.window),
            packet_size: Some(agreed.packet),
            ..setup.facilities.clone()
        };
        this.transmit(Frame::CallAccepted(CallSetup {
            facilities: reply,
            ..CallSetup::default()
        }));
        this.state = State::Connected;
        this.touch_idle(now);
        debug!(lci = %lci, remote = %this.remote, "accepted incoming call");
        this.events.push_back(Event::Incoming(setup));
        this
    }

    fn new(
        lci: Lci,
        side: Side,
        modulus: Modulus,
        config: Arc<CircuitConfig>,
        local: Address,
        remote: Address,
    ) -> Self {
        Self {
            lci,
            side,
            local,
            remote,
            window: Window::new(
                modulus,
                clamp_window(config.window_in, modulus),
                clamp_window(config.window_out, modulus),
            ),
            packet_size_in: config.packet_size_in,
            packet_size_out: config.packet_size_out,
            reassembler: Reassembler::new(config.max_message_size),
            config,
            state: State::AwaitingCallAccepted,
            send_buffer: SendBuffer::default(),
            timers: TimerTable::default(),
            facilities: Facilities::default(),
            call_pending: None,
            pending_cause: Cause::DTE_ORIGINATED,
            close_reason: CloseReason::LocallyCleared,
            retries: 0,
            delivery_failures: 0,
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            stats: CircuitStats::default(),
        }
    }

    /// Send the call request of an outgoing circuit
    pub(crate) fn start_call(&mut self, now: Instant) {
        let Some(user_data) = self.call_pending.take() else {
            return;
        };
        self.transmit(Frame::CallRequest(CallSetup {
            called: self.remote,
            calling: self.local,
            facilities: self.facilities.clone(),
            user_data,
        }));
        self.timers
            .set(Timer::Call, now + self.config.call_timeout);
        debug!(lci = %self.lci, remote = %self.remote, "call request sent");
    }

    /// Whether the call request is still waiting for the link
    pub(crate) fn is_call_pending(&self) -> bool {
        self.call_pending.is_some()
    }

    /// Process one frame addressed to this circuit
    pub(crate) fn handle(&mut self, now: Instant, packet: Packet) {
        self.stats.frames_rx += 1;
        trace!(lci = %self.lci, state = ?self.state, frame = ?packet.frame.ty(), "got frame");
        match self.state {
            State::AwaitingCallAccepted => self.handle_awaiting_call(now, packet.frame),
            State::Connected => {
                self.handle_connected(now, packet.header, packet.frame);
                self.kick();
            }
            State::AwaitingResetConfirm => self.handle_awaiting_reset(now, packet.frame),
            State::AwaitingClearConfirm => self.handle_awaiting_clear(packet.frame),
            State::Idle => debug!(lci = %self.lci, "frame for closed circuit"),
        }
    }

    fn handle_awaiting_call(&mut self, now: Instant, frame: Frame) {
        match frame {
            Frame::CallAccepted(setup) => {
                let ours = self.proposal();
                let theirs = Negotiable {
                    window: setup.facilities.window_size.unwrap_or(ours.window),
                    packet: setup.facilities.packet_size.unwrap_or(ours.packet),
                };
                let agreed = self.adopt(ours, theirs);
                self.facilities.window_size = Some(agreed.window);
                self.facilities.packet_size = Some(agreed.packet);
                self.timers.stop(Timer::Call);
                self.state = State::Connected;
                self.touch_idle(now);
                debug!(
                    lci = %self.lci,
                    window_in = self.window.window_in(),
                    window_out = self.window.window_out(),
                    packet_in = self.packet_size_in,
                    packet_out = self.packet_size_out,
                    "call connected"
                );
                self.events.push_back(Event::Connected {
                    user_data: setup.user_data,
                });
                self.kick();
            }
            Frame::ClearRequest(cause) => {
                self.transmit(Frame::ClearConfirmation);
                debug!(lci = %self.lci, %cause, "call refused");
                self.close(CloseReason::Refused(cause));
            }
            frame => debug!(lci = %self.lci, frame = ?frame.ty(), "ignoring frame while calling"),
        }
    }

    fn handle_awaiting_clear(&mut self, frame: Frame) {
        match frame {
            Frame::ClearRequest(_) => {
                self.transmit(Frame::ClearConfirmation);
                self.close(self.close_reason.clone());
            }
            Frame::ClearConfirmation => self.close(self.close_reason.clone()),
            frame => trace!(lci = %self.lci, frame = ?frame.ty(), "ignoring frame while clearing"),
        }
    }

    fn handle_awaiting_reset(&mut self, now: Instant, frame: Frame) {
        match frame {
            Frame::ResetRequest(_) | Frame::ResetConfirmation => {
                if matches!(frame, Frame::ResetRequest(_)) {
                    self.transmit(Frame::ResetConfirmation);
                }
                self.timers.stop(Timer::Reset);
                self.window.reset();
                self.retries = 0;
                self.state = State::Connected;
                self.touch_idle(now);
                debug!(lci = %self.lci, "reset complete");
            }
            Frame::ClearRequest(cause) => self.cleared_by_peer(cause),
            frame => trace!(lci = %self.lci, frame = ?frame.ty(), "ignoring frame while resetting"),
        }
    }

    fn handle_connected(&mut self, now: Instant, header: Header, frame: Frame) {
        match frame {
            Frame::ResetRequest(cause) => {
                self.clear_queues();
                self.transmit(Frame::ResetConfirmation);
                self.window.reset();
                self.timers.stop(Timer::AckDelay);
                self.stats.resets += 1;
                debug!(lci = %self.lci, %cause, "reset by peer");
                self.events.push_back(Event::Reset(cause));
            }
            Frame::ClearRequest(cause) => self.cleared_by_peer(cause),
            Frame::ReceiveReady { nr } | Frame::ReceiveNotReady { nr } => {
                if !self.window.validate_ack(nr) {
                    self.invalid_nr(now, nr);
                    return;
                }
                self.window.apply_ack(nr, &mut self.send_buffer);
                let busy = matches!(frame, Frame::ReceiveNotReady { .. });
                self.window.condition.set(Condition::PEER_RX_BUSY, busy);
            }
            Frame::Reject { nr } => {
                if !self.window.validate_ack(nr) {
                    self.invalid_nr(now, nr);
                    return;
                }
                self.window.apply_ack(nr, &mut self.send_buffer);
                let requeued = self.send_buffer.unacked();
                self.send_buffer.requeue_unacked();
                self.window.rewind();
                self.stats.retransmits += requeued as u64;
                debug!(lci = %self.lci, nr, requeued, "peer rejected, retransmitting");
            }
            Frame::Data(data) => self.handle_data(now, header, data),
            Frame::Interrupt(data) => {
                self.transmit(Frame::InterruptConfirmation);
                if self.config.urgent_inline {
                    self.events.push_back(Event::Payload {
                        data,
                        qualifier: false,
                    });
                } else {
                    self.events.push_back(Event::Interrupt(data));
                }
            }
            Frame::InterruptConfirmation => {
                self.window.condition.remove(Condition::INTERRUPT_PENDING);
            }
            frame => debug!(lci = %self.lci, frame = ?frame.ty(), "ignoring unexpected frame"),
        }
    }

    fn handle_data(&mut self, now: Instant, header: Header, data: Data) {
        if !self.window.validate_ack(data.nr) {
            self.invalid_nr(now, data.nr);
            return;
        }
        self.window.apply_ack(data.nr, &mut self.send_buffer);
        if data.payload.len() > self.packet_size_in as usize {
            warn!(lci = %self.lci, len = data.payload.len(), "data field exceeds packet size");
            self.start_reset(
                now,
                Cause::LOCAL_PROCEDURE_ERROR.with_diagnostic(DIAG_PACKET_TOO_LONG),
            );
            return;
        }

        let mut ack_now = header.d;
        match self.window.accept_data(data.ns) {
            DataVerdict::Accepted => {
                self.stats.bytes_rx += data.payload.len() as u64;
                self.touch_idle(now);
                self.deliver(now, data.payload, data.more, header.q);
                if self.state != State::Connected {
                    return;
                }
            }
            DataVerdict::ReceiverBusy => {
                trace!(lci = %self.lci, ns = data.ns, "receiver busy, dropping data");
                // nothing was accepted, so there is nothing to acknowledge unless asked
                if !ack_now {
                    return;
                }
            }
            DataVerdict::OutOfSequence { duplicate } => match self.config.out_of_sequence {
                OutOfSequencePolicy::Drop => {
                    debug!(
                        lci = %self.lci,
                        ns = data.ns,
                        vr = self.window.vr(),
                        "dropping out of sequence data"
                    );
                }
                OutOfSequencePolicy::Reject if duplicate => ack_now = true,
                OutOfSequencePolicy::Reject => {
                    if !self.window.condition.contains(Condition::REJECT_SENT) {
                        debug!(lci = %self.lci, ns = data.ns, vr = self.window.vr(), "rejecting");
                        self.transmit(Frame::Reject {
                            nr: self.window.vr(),
                        });
                        self.window.acked();
                        self.window.condition.insert(Condition::REJECT_SENT);
                        self.timers.stop(Timer::AckDelay);
                    }
                    return;
                }
            },
        }

        if ack_now {
            self.enquiry_response();
            return;
        }
        match self.window.ack_policy() {
            AckPolicy::SendNow => self.enquiry_response(),
            AckPolicy::Delay => {
                if !self.timers.is_set(Timer::AckDelay) {
                    self.timers
                        .set(Timer::AckDelay, now + self.config.ack_delay);
                }
            }
        }
    }

    fn deliver(&mut self, now: Instant, payload: Bytes, more: bool, qualifier: bool) {
        match self.reassembler.on_frame(payload, more) {
            Ok(Reassembly::Pending) => {}
            Ok(Reassembly::Complete(data)) => {
                self.delivery_failures = 0;
                self.events.push_back(Event::Payload { data, qualifier });
            }
            Err(e) => {
                self.delivery_failures = self.delivery_failures.saturating_add(1);
                warn!(lci = %self.lci, failures = self.delivery_failures, "delivery failed: {e}");
                self.events.push_back(Event::DeliveryFailed(e));
                if self.delivery_failures > self.config.max_delivery_failures {
                    self.start_clear(
                        now,
                        Cause::NETWORK_CONGESTION,
                        CloseReason::ResourceExhausted,
                    );
                }
            }
        }
    }

    fn invalid_nr(&mut self, now: Instant, nr: u8) {
        warn!(
            lci = %self.lci,
            nr,
            va = self.window.va(),
            vs = self.window.vs(),
            "invalid N(R), resetting"
        );
        self.start_reset(
            now,
            Cause::LOCAL_PROCEDURE_ERROR.with_diagnostic(DIAG_INVALID_PR),
        );
    }

    fn cleared_by_peer(&mut self, cause: Cause) {
        self.clear_queues();
        self.transmit(Frame::ClearConfirmation);
        debug!(lci = %self.lci, %cause, "cleared by peer");
        self.close(CloseReason::Cleared(cause));
    }

    /// Process timer expiry
    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            trace!(lci = %self.lci, ?timer, "timeout");
            match (timer, self.state) {
                (Timer::AckDelay, State::Connected) => {
                    if self.window.condition.contains(Condition::ACK_PENDING) {
                        self.enquiry_response();
                    }
                }
                (Timer::Call, State::AwaitingCallAccepted) => {
                    warn!(lci = %self.lci, "call not accepted in time");
                    self.start_clear(
                        now,
                        Cause::DTE_ORIGINATED.with_diagnostic(DIAG_TIMER_EXPIRED),
                        CloseReason::TimedOut,
                    );
                }
                (Timer::Reset, State::AwaitingResetConfirm) => {
                    if self.retries < self.config.max_retries {
                        self.retries += 1;
                        warn!(lci = %self.lci, retry = self.retries, "retrying reset");
                        self.transmit(Frame::ResetRequest(self.pending_cause));
                        self.timers
                            .set(Timer::Reset, now + self.config.reset_timeout);
                    } else {
                        warn!(lci = %self.lci, "reset not confirmed, clearing");
                        self.start_clear(
                            now,
                            Cause::DTE_ORIGINATED.with_diagnostic(DIAG_TIMER_EXPIRED),
                            CloseReason::TimedOut,
                        );
                    }
                }
                (Timer::Clear, State::AwaitingClearConfirm) => {
                    if self.retries < self.config.max_retries {
                        self.retries += 1;
                        warn!(lci = %self.lci, retry = self.retries, "retrying clear");
                        self.transmit(Frame::ClearRequest(self.pending_cause));
                        self.timers
                            .set(Timer::Clear, now + self.config.clear_timeout);
                    } else {
                        warn!(lci = %self.lci, "clear not confirmed, giving up");
                        self.close(CloseReason::TimedOut);
                    }
                }
                (Timer::Idle, State::Connected | State::AwaitingResetConfirm) => {
                    debug!(lci = %self.lci, "idle timeout");
                    self.start_clear(now, Cause::DTE_ORIGINATED, CloseReason::IdleTimeout);
                }
                (timer, state) => trace!(?timer, ?state, "stale timer"),
            }
        }
    }

    /// Earliest time at which [`handle_timeout`](Self::handle_timeout) should be called
    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Queue a message for transmission, split into frames of the negotiated packet size
    pub(crate) fn send(
        &mut self,
        now: Instant,
        mut data: Bytes,
        qualifier: bool,
    ) -> Result<(), SendError> {
        if self.state != State::Connected {
            return Err(SendError::NotConnected);
        }
        let size = self.packet_size_out as usize;
        loop {
            let payload = data.split_to(data.len().min(size));
            let more = !data.is_empty();
            self.send_buffer.push(Segment {
                payload,
                more,
                qualifier,
            });
            if !more {
                break;
            }
        }
        self.touch_idle(now);
        self.kick();
        Ok(())
    }

    /// Send expedited data outside flow control
    pub(crate) fn send_interrupt(&mut self, data: Bytes) -> Result<(), SendError> {
        if self.state != State::Connected {
            return Err(SendError::NotConnected);
        }
        if data.is_empty() || data.len() > MAX_INTERRUPT_DATA {
            return Err(SendError::InterruptSize);
        }
        if self.window.condition.contains(Condition::INTERRUPT_PENDING) {
            return Err(SendError::InterruptPending);
        }
        self.window.condition.insert(Condition::INTERRUPT_PENDING);
        self.transmit(Frame::Interrupt(data));
        Ok(())
    }

    /// Start or stop flow-controlling the peer
    pub(crate) fn set_receiver_busy(&mut self, busy: bool) -> Result<(), SendError> {
        if self.state != State::Connected {
            return Err(SendError::NotConnected);
        }
        if self.window.condition.contains(Condition::OWN_RX_BUSY) != busy {
            self.window.condition.set(Condition::OWN_RX_BUSY, busy);
            self.enquiry_response();
        }
        Ok(())
    }

    /// Resynchronise flow control with the peer, discarding data in flight
    pub(crate) fn request_reset(&mut self, now: Instant) -> Result<(), SendError> {
        if self.state != State::Connected {
            return Err(SendError::NotConnected);
        }
        self.start_reset(now, Cause::DTE_ORIGINATED);
        Ok(())
    }

    /// Hang up
    ///
    /// A circuit whose call request never left is closed on the spot.
    pub(crate) fn request_clear(&mut self, now: Instant) {
        match self.state {
            State::Idle | State::AwaitingClearConfirm => {}
            State::AwaitingCallAccepted if self.call_pending.is_some() => {
                self.close(CloseReason::LocallyCleared)
            }
            _ => self.start_clear(now, Cause::DTE_ORIGINATED, CloseReason::LocallyCleared),
        }
    }

    /// Close without any exchange with the peer, e.g. because the link is gone
    pub(crate) fn force_close(&mut self, reason: CloseReason) {
        if !self.state.is_closed() {
            debug!(lci = %self.lci, %reason, "circuit force-closed");
            self.transmits.clear();
            self.close(reason);
        }
    }

    fn start_reset(&mut self, now: Instant, cause: Cause) {
        self.clear_queues();
        self.window.reset();
        self.transmit(Frame::ResetRequest(cause));
        self.pending_cause = cause;
        self.retries = 0;
        self.state = State::AwaitingResetConfirm;
        self.timers
            .set(Timer::Reset, now + self.config.reset_timeout);
        self.stats.resets += 1;
        self.events.push_back(Event::Reset(cause));
    }

    fn start_clear(&mut self, now: Instant, cause: Cause, reason: CloseReason) {
        self.clear_queues();
        self.transmit(Frame::ClearRequest(cause));
        self.pending_cause = cause;
        self.close_reason = reason;
        self.retries = 0;
        self.state = State::AwaitingClearConfirm;
        self.timers.stop(Timer::Idle);
        self.timers
            .set(Timer::Clear, now + self.config.clear_timeout);
    }

    fn close(&mut self, reason: CloseReason) {
        self.clear_queues();
        self.timers.stop_all();
        self.call_pending = None;
        self.state = State::Idle;
        self.events.push_back(Event::Closed(reason));
    }

    fn clear_queues(&mut self) {
        self.send_buffer.clear();
        self.reassembler.clear();
    }

    /// Send queued data while the window is open
    ///
    /// Every data frame carries `vr`, acknowledging anything pending.
    fn kick(&mut self) {
        if self.state != State::Connected {
            return;
        }
        let mut sent = false;
        while self.window.can_send() {
            let Some(segment) = self.send_buffer.pop_send() else {
                break;
            };
            let ns = self.window.take_send_seq();
            self.stats.bytes_tx += segment.payload.len() as u64;
            let mut header = Header::new(self.lci, self.window.modulus());
            header.q = segment.qualifier;
            self.transmit_packet(Packet {
                header,
                frame: Frame::Data(Data {
                    ns,
                    nr: self.window.vr(),
                    more: segment.more,
                    payload: segment.payload,
                }),
            });
            self.window.acked();
            sent = true;
        }
        if sent {
            self.timers.stop(Timer::AckDelay);
        }
    }

    /// Acknowledge everything received so far with RR, or RNR while we are busy
    fn enquiry_response(&mut self) {
        let nr = self.window.vr();
        let frame = match self.window.condition.contains(Condition::OWN_RX_BUSY) {
            true => Frame::ReceiveNotReady { nr },
            false => Frame::ReceiveReady { nr },
        };
        self.transmit(frame);
        self.window.acked();
        self.timers.stop(Timer::AckDelay);
    }

    fn touch_idle(&mut self, now: Instant) {
        if let Some(timeout) = self.config.idle_timeout {
            self.timers.set(Timer::Idle, now + timeout);
        }
    }

    fn transmit(&mut self, frame: Frame) {
        let packet = Packet::new(self.lci, self.window.modulus(), frame);
        self.transmit_packet(packet);
    }

    fn transmit_packet(&mut self, packet: Packet) {
        trace!(lci = %self.lci, frame = ?packet.frame.ty(), "sending");
        self.stats.frames_tx += 1;
        // Only interrupts may overtake earlier frames of the same circuit
        let band = match packet.frame {
            Frame::Interrupt(_) | Frame::InterruptConfirmation => Band::Control,
            _ => Band::Data,
        };
        self.transmits.push_back(Transmit {
            lci: self.lci,
            band,
            contents: packet.to_bytes(),
        });
    }

    /// Window and packet sizes we proposed, as they would appear on the wire
    fn proposal(&self) -> Negotiable {
        Negotiable {
            window: self
                .facilities
                .window_size
                .unwrap_or(Directional::both(DEFAULT_WINDOW)),
            packet: self
                .facilities
                .packet_size
                .unwrap_or(Directional::both(DEFAULT_PACKET_SIZE)),
        }
    }

    /// Our configured sizes, as they would appear on the wire
    fn local_proposal(&self) -> Negotiable {
        let modulus = self.window.modulus();
        Negotiable {
            window: self.side.directional(
                clamp_window(self.config.window_in, modulus),
                clamp_window(self.config.window_out, modulus),
            ),
            packet: self
                .side
                .directional(self.config.packet_size_in, self.config.packet_size_out),
        }
    }

    /// Settle on the smaller of each proposal and apply the result
    fn adopt(&mut self, ours: Negotiable, theirs: Negotiable) -> Negotiable {
        let modulus = self.window.modulus();
        let window = ours.window.min(theirs.window);
        let window = Directional {
            from_called: clamp_window(window.from_called, modulus),
            from_calling: clamp_window(window.from_calling, modulus),
        };
        let packet = ours.packet.min(theirs.packet);
        let packet = Directional {
            from_called: packet.from_called.clamp(16, 4096),
            from_calling: packet.from_calling.clamp(16, 4096),
        };
        let (window_in, window_out) = self.side.split(window);
        (self.packet_size_in, self.packet_size_out) = self.side.split(packet);
        self.window = Window::new(modulus, window_in, window_out);
        Negotiable { window, packet }
    }

    pub(crate) fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub(crate) fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub(crate) fn lci(&self) -> Lci {
        self.lci
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn remote(&self) -> Address {
        self.remote
    }

    pub(crate) fn side(&self) -> Side {
        self.side
    }

    pub(crate) fn facilities(&self) -> &Facilities {
        &self.facilities
    }

    pub(crate) fn window(&self) -> &Window {
        &self.window
    }

    pub(crate) fn stats(&self) -> CircuitStats {
        self.stats
    }

    /// Whether any owner data is held for sending or awaiting acknowledgement
    pub(crate) fn has_outstanding(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn timer_deadline(&self, timer: Timer) -> Option<Instant> {
        self.timers.get(timer)
    }
}

#[derive(Debug, Copy, Clone)]
struct Negotiable {
    window: Directional<u8>,
    packet: Directional<u16>,
}

fn clamp_window(x: u8, modulus: Modulus) -> u8 {
    x.clamp(1, modulus.get() - 1)
}

/// Events of interest to the owner of a circuit
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    /// The peer placed this call and it was accepted
    Incoming(CallSetup),
    /// Our call was accepted
    Connected {
        /// Call user data from the call accepted frame
        user_data: Bytes,
    },
    /// A complete message arrived
    Payload {
        /// Message contents
        data: Bytes,
        /// Whether the qualifier bit was set
        qualifier: bool,
    },
    /// Expedited data arrived
    Interrupt(Bytes),
    /// Flow control was resynchronised; data in flight in either direction may be lost
    Reset(Cause),
    /// A message could not be delivered
    DeliveryFailed(ReassemblyError),
    /// The circuit ended; no further events follow
    Closed(CloseReason),
}

/// Statistics about one circuit
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct CircuitStats {
    /// Frames queued for transmission
    pub frames_tx: u64,
    /// Frames received
    pub frames_rx: u64,
    /// Data payload octets sent
    pub bytes_tx: u64,
    /// Data payload octets accepted in sequence
    pub bytes_rx: u64,
    /// Data frames retransmitted after a reject
    pub retransmits: u64,
    /// Reset procedures, from either end
    pub resets: u64,
}

/// Errors that can arise when sending on a circuit
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The circuit is not in data transfer
    #[error("circuit not connected")]
    NotConnected,
    /// An interrupt we sent has not been confirmed yet
    #[error("interrupt already pending")]
    InterruptPending,
    /// Interrupt data must be between 1 and 32 octets
    #[error("invalid interrupt length")]
    InterruptSize,
    /// The handle does not refer to a live circuit
    #[error("unknown circuit")]
    UnknownCircuit,
}
