use std::collections::VecDeque;

use bytes::Bytes;

/// Buffer of outgoing data segments
///
/// Segments move from the write queue to the ack queue when sent, and leave the ack queue when
/// the peer acknowledges them. A reject moves them back to the front of the write queue.
#[derive(Default, Debug)]
pub struct SendBuffer {
    /// Written by the owner but not yet sent
    unsent: VecDeque<Segment>,
    /// Sent but not yet acknowledged, oldest first
    unacked: VecDeque<Segment>,
    /// Total payload bytes across both queues
    bytes: usize,
}

/// One data frame's worth of owner data
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Segment {
    pub(crate) payload: Bytes,
    /// More segments of the same message follow
    pub(crate) more: bool,
    /// Qualified data
    pub(crate) qualifier: bool,
}

impl Segment {
    pub(crate) fn new(payload: Bytes, more: bool) -> Self {
        Self {
            payload,
            more,
            qualifier: false,
        }
    }
}

impl SendBuffer {
    /// Queue a segment for transmission
    pub fn push(&mut self, segment: Segment) {
        self.bytes += segment.payload.len();
        self.unsent.push_back(segment);
    }

    /// Take the next segment to transmit, retaining it until acknowledged
    pub fn pop_send(&mut self) -> Option<Segment> {
        let segment = self.unsent.pop_front()?;
        self.unacked.push_back(segment.clone());
        Some(segment)
    }

    /// Discard the `n` oldest unacknowledged segments
    pub fn acknowledge(&mut self, n: usize) {
        for segment in self.unacked.drain(..n.min(self.unacked.len())) {
            self.bytes -= segment.payload.len();
        }
    }

    /// Move every unacknowledged segment back in front of the write queue, in order
    pub fn requeue_unacked(&mut self) {
        while let Some(segment) = self.unacked.pop_back() {
            self.unsent.push_front(segment);
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.unsent.clear();
        self.unacked.clear();
        self.bytes = 0;
    }

    /// Whether there is anything left to send
    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    /// Number of segments awaiting acknowledgement
    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    /// Whether both queues are empty
    pub fn is_empty(&self) -> bool {
        self.unsent.is_empty() && self.unacked.is_empty()
    }

    /// Payload bytes held
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}
