//! Egress queueing
//!
//! Frames from every circuit routed over a device meet in one [`Egress`], which holds them in
//! a replaceable [`Qdisc`] and drains them through the device's transmit function while the
//! device is not busy. Frames that the device refuses go to the head of a failure queue and
//! are retried first; nothing accepted by the discipline is dropped on that path.

use std::{collections::VecDeque, fmt, time::Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{config::QueueConfig, Transmit};

/// Priority band of the default discipline; lower bands always dequeue first
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Band {
    /// Link control and interrupts
    Control = 0,
    /// Circuit traffic, kept in order per channel
    Data = 1,
    /// Traffic that may wait behind everything else
    Bulk = 2,
}

impl Band {
    const VALUES: [Self; 3] = [Self::Control, Self::Data, Self::Bulk];
}

/// One outbound frame awaiting transmission
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueueEntry {
    /// Scheduling priority
    pub band: Band,
    /// Encoded frame
    pub contents: Bytes,
}

impl From<Transmit> for QueueEntry {
    fn from(x: Transmit) -> Self {
        Self {
            band: x.band,
            contents: x.contents,
        }
    }
}

/// Outcome of offering a frame to a discipline
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Enqueue {
    /// Held for transmission
    Queued,
    /// Handed to the device immediately
    Sent,
    /// Discarded; the band was full or the device could not take it
    Dropped,
}

/// Counters kept by a discipline
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct QdiscStats {
    /// Frames accepted
    pub enqueued: u64,
    /// Frames discarded at enqueue
    pub dropped: u64,
    /// Frames returned after a failed transmit
    pub requeued: u64,
}

/// An egress scheduling policy
pub trait Qdisc: Send + fmt::Debug {
    /// Offer a frame
    fn enqueue(&mut self, entry: QueueEntry) -> Enqueue;
    /// Next frame to transmit; previously failed frames come first
    fn dequeue(&mut self) -> Option<QueueEntry>;
    /// Return a frame the device refused; it becomes the next to dequeue
    fn requeue(&mut self, entry: QueueEntry);
    /// Discard everything held
    fn reset(&mut self);
    /// Frames held
    fn len(&self) -> usize;
    /// Whether nothing is held
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Counters
    fn stats(&self) -> QdiscStats;
    /// Whether frames should bypass queueing and go straight to the device
    fn is_bypass(&self) -> bool {
        false
    }
}

/// Three-band priority FIFO with per-band tail drop
#[derive(Debug)]
pub struct PfifoFast {
    bands: [VecDeque<QueueEntry>; 3],
    /// Frames refused by the device, retried before anything else
    failed: VecDeque<QueueEntry>,
    limit: usize,
    stats: QdiscStats,
}

impl PfifoFast {
    /// Construct with `limit` frames per band
    pub fn new(limit: usize) -> Self {
        Self {
            bands: Default::default(),
            failed: VecDeque::new(),
            limit,
            stats: QdiscStats::default(),
        }
    }
}

impl Qdisc for PfifoFast {
    fn enqueue(&mut self, entry: QueueEntry) -> Enqueue {
        let band = &mut self.bands[entry.band as usize];
        if band.len() >= self.limit {
            self.stats.dropped += 1;
            trace!(band = ?entry.band, "band full, dropping");
            return Enqueue::Dropped;
        }
        band.push_back(entry);
        self.stats.enqueued += 1;
        Enqueue::Queued
    }

    fn dequeue(&mut self) -> Option<QueueEntry> {
        if let Some(entry) = self.failed.pop_front() {
            return Some(entry);
        }
        Band::VALUES
            .into_iter()
            .find_map(|band| self.bands[band as usize].pop_front())
    }

    fn requeue(&mut self, entry: QueueEntry) {
        self.stats.requeued += 1;
        self.failed.push_front(entry);
    }

    fn reset(&mut self) {
        for band in &mut self.bands {
            band.clear();
        }
        self.failed.clear();
    }

    fn len(&self) -> usize {
        self.failed.len() + self.bands.iter().map(VecDeque::len).sum::<usize>()
    }

    fn stats(&self) -> QdiscStats {
        self.stats
    }
}

/// Bypass discipline for devices that never back-pressure
///
/// Frames go straight to the device; a frame the device refuses is dropped unless it was
/// already accepted, in which case it is kept for the next restart.
#[derive(Debug, Default)]
pub struct NoQueue {
    failed: VecDeque<QueueEntry>,
    stats: QdiscStats,
}

impl Qdisc for NoQueue {
    fn enqueue(&mut self, _: QueueEntry) -> Enqueue {
        self.stats.dropped += 1;
        Enqueue::Dropped
    }

    fn dequeue(&mut self) -> Option<QueueEntry> {
        self.failed.pop_front()
    }

    fn requeue(&mut self, entry: QueueEntry) {
        self.stats.requeued += 1;
        self.failed.push_front(entry);
    }

    fn reset(&mut self) {
        self.failed.clear();
    }

    fn len(&self) -> usize {
        self.failed.len()
    }

    fn stats(&self) -> QdiscStats {
        self.stats
    }

    fn is_bypass(&self) -> bool {
        true
    }
}

/// The device cannot accept a frame right now
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("device would block")]
pub struct WouldBlock;

/// A transmit path below the packet layer
pub trait NetDevice {
    /// Hand one frame to the link
    fn transmit(&mut self, frame: &Bytes) -> Result<(), WouldBlock>;
    /// Whether the link currently refuses output
    fn is_busy(&self) -> bool;
    /// Called by the watchdog when output has been stalled past the timeout
    fn tx_timeout(&mut self) {}
}

/// Whether an [`Egress`] may transmit
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EgressState {
    /// Normal operation
    Running,
    /// Stopped, e.g. while the discipline is being replaced
    Deactivated,
}

/// A device's egress path: its discipline and transmit bookkeeping
#[derive(Debug)]
pub struct Egress {
    qdisc: Box<dyn Qdisc>,
    state: EgressState,
    /// Last successful transmit, or activation if nothing was sent since
    last_tx: Option<Instant>,
    config: QueueConfig,
}

impl Egress {
    /// An active egress using [`PfifoFast`]
    pub fn new(config: QueueConfig) -> Self {
        let qdisc = Box::new(PfifoFast::new(config.band_limit));
        Self::with_qdisc(config, qdisc)
    }

    /// An active egress using the given discipline
    pub fn with_qdisc(config: QueueConfig, qdisc: Box<dyn Qdisc>) -> Self {
        Self {
            qdisc,
            state: EgressState::Running,
            last_tx: None,
            config,
        }
    }

    /// Offer a frame and try to send what is queued
    pub fn enqueue(
        &mut self,
        now: Instant,
        entry: QueueEntry,
        dev: &mut dyn NetDevice,
    ) -> Enqueue {
        if self.qdisc.is_bypass() {
            if self.state == EgressState::Running
                && !dev.is_busy()
                && dev.transmit(&entry.contents).is_ok()
            {
                self.last_tx = Some(now);
                return Enqueue::Sent;
            }
            debug!("bypass device busy, dropping");
            return self.qdisc.enqueue(entry);
        }
        let result = self.qdisc.enqueue(entry);
        self.restart(now, dev);
        result
    }

    /// Drain the discipline through `dev` while it is not busy
    ///
    /// Returns the number of frames transmitted.
    pub fn restart(&mut self, now: Instant, dev: &mut dyn NetDevice) -> usize {
        self.run(now, dev, false)
    }

    /// Kick a device that has been busy with queued output for longer than the timeout
    ///
    /// The device's [`NetDevice::tx_timeout`] hook runs first, then one transmit is attempted
    /// regardless of the busy flag, in case a "ready" notification was lost. Returns whether
    /// the device was kicked.
    pub fn watchdog(&mut self, now: Instant, dev: &mut dyn NetDevice) -> bool {
        if self.state != EgressState::Running || self.qdisc.is_empty() || !dev.is_busy() {
            return false;
        }
        let last = *self.last_tx.get_or_insert(now);
        if now.saturating_duration_since(last) < self.config.watchdog_timeout {
            return false;
        }
        warn!(queued = self.qdisc.len(), "transmit timed out, kicking device");
        dev.tx_timeout();
        // Restart the stall clock whether or not the kick helps
        self.last_tx = Some(now);
        self.run(now, dev, true);
        true
    }

    fn run(&mut self, now: Instant, dev: &mut dyn NetDevice, mut force: bool) -> usize {
        if self.state != EgressState::Running {
            return 0;
        }
        let mut sent = 0;
        loop {
            if !force && dev.is_busy() {
                break;
            }
            force = false;
            let Some(entry) = self.qdisc.dequeue() else {
                break;
            };
            match dev.transmit(&entry.contents) {
                Ok(()) => {
                    self.last_tx = Some(now);
                    sent += 1;
                }
                Err(WouldBlock) => {
                    trace!("device refused frame, requeueing");
                    self.qdisc.requeue(entry);
                    break;
                }
            }
        }
        sent
    }

    /// Stop transmitting
    pub fn deactivate(&mut self) {
        self.state = EgressState::Deactivated;
    }

    /// Resume transmitting
    ///
    /// The stall clock starts afresh; call [`restart`](Self::restart) to drain the queue.
    pub fn activate(&mut self, now: Instant) {
        self.state = EgressState::Running;
        self.last_tx = Some(now);
    }

    /// Replace the discipline, returning the old one emptied
    ///
    /// The egress is deactivated for the swap and reactivated afterwards if it was running,
    /// so no restart ever sees a half-replaced discipline.
    pub fn graft(&mut self, now: Instant, new: Box<dyn Qdisc>) -> Box<dyn Qdisc> {
        let was_running = self.state == EgressState::Running;
        self.deactivate();
        let mut old = std::mem::replace(&mut self.qdisc, new);
        old.reset();
        if was_running {
            self.activate(now);
        }
        debug!(running = was_running, "queue discipline replaced");
        old
    }

    /// Current state
    pub fn state(&self) -> EgressState {
        self.state
    }

    /// Frames held by the active discipline
    pub fn len(&self) -> usize {
        self.qdisc.len()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.qdisc.is_empty()
    }

    /// Counters of the active discipline
    pub fn stats(&self) -> QdiscStats {
        self.qdisc.stats()
    }

    /// Time of the last successful transmit
    pub fn last_tx(&self) -> Option<Instant> {
        self.last_tx
    }
}
