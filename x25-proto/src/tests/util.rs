use std::{
    cmp,
    collections::VecDeque,
    io::{self, Write},
    str,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::trace;
use tracing_subscriber::EnvFilter;

use super::*;

pub(super) const CALLER_ADDRESS: &str = "23400001";
pub(super) const CALLEE_ADDRESS: &str = "23400002";

/// Two neighbours wired back to back, with simulated time
pub(super) struct Pair {
    pub(super) caller: TestNeighbour,
    pub(super) callee: TestNeighbour,
    pub(super) time: Instant,
    /// One-way
    pub(super) latency: Duration,
}

impl Pair {
    pub(super) fn new(caller: NeighbourConfig, callee: NeighbourConfig) -> Self {
        Self {
            caller: TestNeighbour::new(caller, CALLER_ADDRESS),
            callee: TestNeighbour::new(callee, CALLEE_ADDRESS),
            time: Instant::now(),
            latency: Duration::ZERO,
        }
    }

    pub(super) fn with_circuit_config(config: CircuitConfig) -> Self {
        let mut neighbour = NeighbourConfig::default();
        neighbour.circuit_config(Arc::new(config));
        Self::new(neighbour.clone(), neighbour)
    }

    /// Returns whether anything is still in flight or armed
    pub(super) fn step(&mut self) -> bool {
        self.drive_caller();
        self.drive_callee();
        match min_opt(self.caller.next_wakeup(), self.callee.next_wakeup()) {
            Some(t) => {
                if t > self.time {
                    self.time = t;
                    trace!("advancing to {:?}", self.time);
                }
                true
            }
            None => false,
        }
    }

    /// Advance time until nothing is in flight and no timer is armed
    pub(super) fn drive(&mut self) {
        for _ in 0..10_000 {
            if !self.step() {
                return;
            }
        }
        panic!("pair never settled");
    }

    /// Deliver everything that is due without advancing time
    pub(super) fn exchange(&mut self) {
        loop {
            self.drive_caller();
            self.drive_callee();
            if !self.caller.has_due(self.time) && !self.callee.has_due(self.time) {
                return;
            }
        }
    }

    pub(super) fn drive_caller(&mut self) {
        trace!("caller running");
        self.caller.drive(self.time);
        deliver(&mut self.caller, &mut self.callee, self.time + self.latency);
    }

    pub(super) fn drive_callee(&mut self) {
        trace!("callee running");
        self.callee.drive(self.time);
        deliver(&mut self.callee, &mut self.caller, self.time + self.latency);
    }

    /// Bring the link up from both ends
    pub(super) fn link_up(&mut self) {
        self.caller.neighbour.link_up(self.time);
        self.callee.neighbour.link_up(self.time);
        self.drive();
        assert_eq!(self.caller.neighbour.link_state(), LinkState::Up);
        assert_eq!(self.callee.neighbour.link_state(), LinkState::Up);
        self.caller.sent.clear();
        self.callee.sent.clear();
    }

    /// Place a call from caller to callee and check both ends see it connect
    pub(super) fn connect(&mut self) -> (CircuitHandle, CircuitHandle) {
        let caller_ch = self
            .caller
            .neighbour
            .connect(
                self.time,
                CALLEE_ADDRESS.parse().unwrap(),
                Facilities::default(),
                Bytes::new(),
            )
            .unwrap();
        self.exchange();
        let (callee_ch, setup) = self.callee.assert_incoming();
        assert_eq!(setup.calling.to_string(), CALLER_ADDRESS);
        assert_eq!(setup.called.to_string(), CALLEE_ADDRESS);
        assert_matches!(
            &self.caller.events_for(caller_ch)[..],
            [Event::Connected { .. }]
        );
        self.caller.sent.clear();
        self.callee.sent.clear();
        (caller_ch, callee_ch)
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new(NeighbourConfig::default(), NeighbourConfig::default())
    }
}

fn deliver(from: &mut TestNeighbour, to: &mut TestNeighbour, at: Instant) {
    for x in from.outbound.drain(..) {
        from.sent.push(Packet::decode(x.contents.clone()));
        if from.blocked {
            trace!(lci = %x.lci, "frame lost");
            continue;
        }
        to.inbound.push_back((at, x.contents));
    }
}

pub(super) struct TestNeighbour {
    pub(super) neighbour: Neighbour,
    pub(super) inbound: VecDeque<(Instant, Bytes)>,
    pub(super) outbound: VecDeque<Transmit>,
    /// Every frame this side sent, in order
    pub(super) sent: Vec<Packet>,
    pub(super) events: VecDeque<(CircuitHandle, Event)>,
    /// Frames sent by this side are lost while set
    pub(super) blocked: bool,
}

impl TestNeighbour {
    fn new(mut config: NeighbourConfig, address: &str) -> Self {
        config.local_address(address.parse().unwrap());
        Self {
            neighbour: Neighbour::new(Arc::new(config)),
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            sent: Vec::new(),
            events: VecDeque::new(),
            blocked: false,
        }
    }

    pub(super) fn drive(&mut self, now: Instant) {
        while self.inbound.front().map_or(false, |&(t, _)| t <= now) {
            let (_, data) = self.inbound.pop_front().unwrap();
            self.neighbour.handle(now, data);
        }
        if self.neighbour.poll_timeout().map_or(false, |t| t <= now) {
            self.neighbour.handle_timeout(now);
        }
        while let Some(x) = self.neighbour.poll_transmit() {
            self.outbound.push_back(x);
        }
        while let Some(event) = self.neighbour.poll() {
            self.events.push_back(event);
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        min_opt(
            self.inbound.front().map(|&(t, _)| t),
            self.neighbour.poll_timeout(),
        )
    }

    fn has_due(&self, now: Instant) -> bool {
        self.inbound.front().map_or(false, |&(t, _)| t <= now)
    }

    pub(super) fn assert_incoming(&mut self) -> (CircuitHandle, CallSetup) {
        let pos = self
            .events
            .iter()
            .position(|(_, event)| matches!(event, Event::Incoming(_)))
            .expect("no incoming call");
        match self.events.remove(pos) {
            Some((ch, Event::Incoming(setup))) => (ch, setup),
            _ => unreachable!(),
        }
    }

    /// Frames sent since the last call, payload decoded
    pub(super) fn take_sent(&mut self) -> Vec<Frame> {
        self.sent.drain(..).map(|p| p.frame).collect()
    }

    /// Events of one circuit, leaving the others queued
    pub(super) fn events_for(&mut self, ch: CircuitHandle) -> Vec<Event> {
        let mut out = Vec::new();
        self.events.retain(|(x, event)| {
            if *x == ch {
                out.push(event.clone());
                false
            } else {
                true
            }
        });
        out
    }
}

fn min_opt<T: Ord>(x: Option<T>, y: Option<T>) -> Option<T> {
    match (x, y) {
        (Some(x), Some(y)) => Some(cmp::min(x, y)),
        (Some(x), _) => Some(x),
        (_, Some(y)) => Some(y),
        _ => None,
    }
}

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
