use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use proto::{
    qdisc::{Enqueue, Qdisc, QdiscStats, WouldBlock},
    Band, Egress, NetDevice, QueueConfig, QueueEntry,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, trace_span, Instrument};

use crate::{mutex::Mutex, now};

/// The transmit half of the link a [`Device`] drives
///
/// Implementations hand frames to whatever sits below the packet layer: a KISS TNC, an AX.25
/// socket, or a channel in tests. Returning [`WouldBlock`] marks the device busy until
/// [`Device::set_busy`] is called with `false`.
pub trait Link: Send {
    /// Send one encoded frame
    fn send_frame(&mut self, frame: &Bytes) -> Result<(), WouldBlock>;

    /// Output has been stalled for longer than the watchdog timeout
    fn tx_timeout(&mut self) {}
}

/// A network device with its egress queue
///
/// Cloning yields another handle to the same device. Frames from every [`Neighbour`] bound to
/// the device are scheduled by one queue discipline, so link control and interrupts overtake
/// circuit traffic queued behind them.
///
/// [`Neighbour`]: crate::Neighbour
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

struct DeviceInner {
    name: String,
    state: Mutex<DeviceState>,
}

struct DeviceState {
    egress: Egress,
    link: Box<dyn Link>,
    busy: bool,
}

impl DeviceState {
    fn port(&mut self) -> (&mut Egress, Port<'_>) {
        (
            &mut self.egress,
            Port {
                link: &mut *self.link,
                busy: &mut self.busy,
            },
        )
    }
}

/// Adapts a [`Link`] and the busy flag to the interface [`Egress`] drives
struct Port<'a> {
    link: &'a mut dyn Link,
    busy: &'a mut bool,
}

impl NetDevice for Port<'_> {
    fn transmit(&mut self, frame: &Bytes) -> Result<(), WouldBlock> {
        match self.link.send_frame(frame) {
            Ok(()) => {
                *self.busy = false;
                Ok(())
            }
            Err(WouldBlock) => {
                *self.busy = true;
                Err(WouldBlock)
            }
        }
    }

    fn is_busy(&self) -> bool {
        *self.busy
    }

    fn tx_timeout(&mut self) {
        self.link.tx_timeout();
    }
}

impl Device {
    /// Create a device transmitting through `link`, queueing with [`PfifoFast`]
    ///
    /// Spawns the transmit watchdog, so this must be called from within a tokio runtime. The
    /// watchdog stops once every handle to the device is gone.
    ///
    /// [`PfifoFast`]: proto::qdisc::PfifoFast
    pub fn new(name: impl Into<String>, link: Box<dyn Link>, config: QueueConfig) -> Self {
        let name = name.into();
        let period = config.get_watchdog_interval().max(MIN_WATCHDOG_INTERVAL);
        let inner = Arc::new(DeviceInner {
            state: Mutex::new(DeviceState {
                egress: Egress::new(config),
                link,
                busy: false,
            }),
            name,
        });
        let span = trace_span!("watchdog", device = %inner.name);
        tokio::spawn(watchdog(Arc::downgrade(&inner), period).instrument(span));
        Self(inner)
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Queue a frame that does not belong to any circuit, e.g. traffic of another protocol
    /// sharing the link
    pub fn enqueue(&self, band: Band, contents: Bytes) -> Enqueue {
        let mut state = self.0.state.lock("enqueue");
        let (egress, mut port) = state.port();
        egress.enqueue(now(), QueueEntry { band, contents }, &mut port)
    }

    /// Report whether the link can take frames
    ///
    /// Clearing the flag restarts the queue, sending as much as the link accepts.
    pub fn set_busy(&self, busy: bool) {
        let mut state = self.0.state.lock("set_busy");
        let was = std::mem::replace(&mut state.busy, busy);
        if was && !busy {
            let (egress, mut port) = state.port();
            let sent = egress.restart(now(), &mut port);
            trace!(device = %self.0.name, sent, "device ready");
        }
    }

    /// Whether the link last refused a frame or was marked busy
    pub fn is_busy(&self) -> bool {
        self.0.state.lock("is_busy").busy
    }

    /// Install a new queue discipline, returning the old one emptied
    ///
    /// Frames held by the old discipline are discarded.
    pub fn replace_qdisc(&self, qdisc: Box<dyn Qdisc>) -> Box<dyn Qdisc> {
        let mut state = self.0.state.lock("replace_qdisc");
        let now = now();
        let old = state.egress.graft(now, qdisc);
        debug!(device = %self.0.name, dropped = old.stats().dropped, "queue discipline replaced");
        let (egress, mut port) = state.port();
        egress.restart(now, &mut port);
        old
    }

    /// Counters of the active discipline
    pub fn stats(&self) -> QdiscStats {
        self.0.state.lock("stats").egress.stats()
    }

    /// Frames waiting in the active discipline
    pub fn queued(&self) -> usize {
        self.0.state.lock("queued").egress.len()
    }

    /// Move everything `neighbour` wants to send into the egress queue
    pub(crate) fn flush(&self, neighbour: &mut proto::Neighbour) -> usize {
        let mut state = self.0.state.lock("flush");
        let (egress, mut port) = state.port();
        neighbour.flush(now(), egress, &mut port)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.0.name)
            .finish_non_exhaustive()
    }
}

async fn watchdog(device: Weak<DeviceInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = device.upgrade() else {
            trace!("device gone");
            return;
        };
        let mut state = inner.state.lock("watchdog");
        let (egress, mut port) = state.port();
        egress.watchdog(now(), &mut port);
    }
}

const MIN_WATCHDOG_INTERVAL: Duration = Duration::from_millis(1);
