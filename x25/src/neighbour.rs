use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use proto::{
    Address, CallSetup, CircuitHandle, ConnectError, Event, Facilities, LinkState,
    NeighbourConfig, NeighbourStats,
};
use rustc_hash::FxHashMap;
use tokio::{
    sync::{mpsc, Notify},
    time::{sleep_until, Instant as TokioInstant, Sleep},
};
use tracing::{debug, debug_span, trace};

use crate::{
    circuit::{Circuit, Connecting},
    device::Device,
    mutex::Mutex,
    now,
};

/// One link to an adjacent node, and every circuit running over it
///
/// Frames received from the link are passed in with [`frame_received`](Self::frame_received);
/// frames to send leave through the [`Device`] the neighbour was created with. Timers are run
/// by a background task that lives until every handle is dropped and every circuit has closed.
///
/// May be cloned to obtain another handle to the same neighbour.
pub struct Neighbour(Arc<NeighbourInner>);

impl Neighbour {
    /// Create a neighbour whose link is down
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Arc<NeighbourConfig>, device: Device) -> Self {
        let inner = Arc::new(NeighbourInner {
            state: Mutex::new(State {
                inner: proto::Neighbour::new(config),
                driver: None,
                circuits: FxHashMap::default(),
                incoming: VecDeque::new(),
                timer: None,
                handles: 1,
                driver_lost: false,
            }),
            device,
            incoming: Notify::new(),
        });
        tokio::spawn(NeighbourDriver(inner.clone()));
        Self(inner)
    }

    /// The link below has been established; bring the packet layer up
    pub fn link_up(&self) {
        self.0.operate("link_up", |n| n.link_up(now()));
    }

    /// The link below failed; every circuit closes with [`CloseReason::LinkDown`]
    ///
    /// [`CloseReason::LinkDown`]: proto::CloseReason::LinkDown
    pub fn link_down(&self) {
        self.0.operate("link_down", |n| n.link_down());
    }

    /// Process a frame received from the link
    pub fn frame_received(&self, frame: Bytes) {
        self.0.operate("frame_received", |n| {
            n.handle(now(), frame);
        });
    }

    /// Place a call to `remote`
    ///
    /// The returned future resolves once the peer accepts or refuses. Dropping it clears the
    /// call.
    pub fn connect(
        &self,
        remote: Address,
        facilities: Facilities,
        user_data: Bytes,
    ) -> Result<Connecting, ConnectError> {
        let mut state = self.0.state.lock("connect");
        let ch = state.inner.connect(now(), remote, facilities, user_data)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.circuits.insert(ch, tx);
        self.0.process(&mut state);
        drop(state);
        debug!(%remote, %ch, "calling");
        Ok(Connecting::new(Circuit::new(self.0.clone(), ch, remote, rx)))
    }

    /// Wait for the next incoming call
    ///
    /// Returns `None` once the neighbour's background task has stopped.
    pub async fn accept(&self) -> Option<(Circuit, CallSetup)> {
        loop {
            {
                let mut state = self.0.state.lock("accept");
                if let Some(call) = state.incoming.pop_front() {
                    drop(state);
                    let remote = call.setup.calling;
                    let circuit = Circuit::new(self.0.clone(), call.handle, remote, call.events);
                    return Some((circuit, call.setup));
                }
                if state.driver_lost {
                    return None;
                }
            }
            self.0.incoming.notified().await;
        }
    }

    /// State of the restart procedure
    pub fn link_state(&self) -> LinkState {
        self.0.state.lock("link_state").inner.link_state()
    }

    /// Link-wide counters
    pub fn stats(&self) -> NeighbourStats {
        self.0.state.lock("stats").inner.stats()
    }

    /// Number of circuits that have not closed yet
    pub fn circuit_count(&self) -> usize {
        self.0.state.lock("circuit_count").inner.circuit_count()
    }

    /// The device frames are sent through
    pub fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Clone for Neighbour {
    fn clone(&self) -> Self {
        self.0.state.lock("clone").handles += 1;
        Self(self.0.clone())
    }
}

impl Drop for Neighbour {
    fn drop(&mut self) {
        let mut state = self.0.state.lock("drop");
        state.handles -= 1;
        if state.handles == 0 {
            // Let the driver notice it may be done
            state.wake();
        }
    }
}

impl fmt::Debug for Neighbour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Neighbour")
            .field("device", &self.0.device)
            .finish_non_exhaustive()
    }
}

pub(crate) struct NeighbourInner {
    pub(crate) state: Mutex<State>,
    device: Device,
    incoming: Notify,
}

impl NeighbourInner {
    /// Run `f` on the protocol state, then pass on whatever it produced
    pub(crate) fn operate<T>(
        &self,
        purpose: &'static str,
        f: impl FnOnce(&mut proto::Neighbour) -> T,
    ) -> T {
        let mut state = self.state.lock(purpose);
        let result = f(&mut state.inner);
        self.process(&mut state);
        result
    }

    /// Dispatch events to circuit owners and frames to the device
    fn process(&self, state: &mut State) {
        let mut woke_acceptor = false;
        while let Some((ch, event)) = state.inner.poll() {
            match event {
                Event::Incoming(setup) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    state.circuits.insert(ch, tx);
                    state.incoming.push_back(IncomingCall {
                        handle: ch,
                        setup,
                        events: rx,
                    });
                    woke_acceptor = true;
                }
                Event::Closed(reason) => {
                    trace!(%ch, %reason, "circuit closed");
                    if let Some(tx) = state.circuits.remove(&ch) {
                        let _ = tx.send(Event::Closed(reason));
                    }
                    // A call nobody accepted yet is simply forgotten
                    state.incoming.retain(|call| call.handle != ch);
                }
                event => {
                    if let Some(tx) = state.circuits.get(&ch) {
                        let _ = tx.send(event);
                    }
                }
            }
        }
        if woke_acceptor {
            self.incoming.notify_one();
        }
        let queued = self.device.flush(&mut state.inner);
        if queued > 0 {
            trace!(queued, device = %self.device.name(), "frames queued");
        }
        // Timers may have moved
        state.wake();
    }
}

pub(crate) struct State {
    pub(crate) inner: proto::Neighbour,
    driver: Option<Waker>,
    circuits: FxHashMap<CircuitHandle, mpsc::UnboundedSender<Event>>,
    incoming: VecDeque<IncomingCall>,
    timer: Option<Pin<Box<Sleep>>>,
    /// Number of live `Neighbour` handles
    handles: usize,
    driver_lost: bool,
}

impl State {
    fn wake(&mut self) {
        if let Some(x) = self.driver.take() {
            x.wake();
        }
    }

    /// Arm the timer for the next deadline; returns whether it has fired
    fn drive_timer(&mut self, cx: &mut Context) -> bool {
        let Some(deadline) = self.inner.poll_timeout().map(TokioInstant::from_std) else {
            self.timer = None;
            return false;
        };
        match &mut self.timer {
            Some(delay) if delay.deadline() == deadline => {}
            Some(delay) => delay.as_mut().reset(deadline),
            None => self.timer = Some(Box::pin(sleep_until(deadline))),
        }
        let Some(delay) = &mut self.timer else {
            return false;
        };
        delay.as_mut().poll(cx).is_ready()
    }

    fn is_finished(&self) -> bool {
        self.handles == 0 && self.inner.circuit_count() == 0
    }
}

struct IncomingCall {
    handle: CircuitHandle,
    setup: CallSetup,
    events: mpsc::UnboundedReceiver<Event>,
}

/// Runs a neighbour's timers
#[must_use = "neighbour drivers must be spawned for timers to run"]
struct NeighbourDriver(Arc<NeighbourInner>);

impl Future for NeighbourDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let inner = &*self.0;
        let mut state = inner.state.lock("poll");
        let _guard = debug_span!("drive", device = %inner.device.name()).entered();

        // Handling a timeout may arm another that is already due
        while state.drive_timer(cx) {
            state.inner.handle_timeout(now());
            inner.process(&mut state);
        }

        if state.is_finished() {
            trace!("neighbour finished");
            return Poll::Ready(());
        }
        state.driver = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for NeighbourDriver {
    fn drop(&mut self) {
        let mut state = self.0.state.lock("drop driver");
        state.driver_lost = true;
        // Wakes every circuit owner with a closed channel
        state.circuits.clear();
        state.incoming.clear();
        drop(state);
        self.0.incoming.notify_waiters();
        self.0.incoming.notify_one();
    }
}
