use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

/// Helper to join data frames carrying the more-data bit into complete messages
///
/// Fragments are concatenated strictly in arrival order.
#[derive(Debug)]
pub(crate) struct Reassembler {
    fragments: Vec<Bytes>,
    /// Total length of `fragments`
    len: usize,
    /// Largest message we are willing to assemble
    max: usize,
    /// Dropping the rest of a message that already failed
    discarding: bool,
}

/// Result of feeding one data frame to a [`Reassembler`]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reassembly {
    /// More fragments are needed
    Pending,
    /// A whole message
    Complete(Bytes),
}

/// Reasons a message could not be delivered
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ReassemblyError {
    /// The message grew beyond the configured maximum
    #[error("message exceeds {max} bytes")]
    TooLarge {
        /// Configured maximum
        max: usize,
    },
    /// No memory for the joined message
    #[error("allocation failed while reassembling")]
    Alloc,
}

impl Reassembler {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            fragments: Vec::new(),
            len: 0,
            max,
            discarding: false,
        }
    }

    /// Feed the payload of one in-sequence data frame
    ///
    /// On error the fragment state is cleared; if `more` was set the remaining fragments of
    /// the failed message are discarded silently up to and including its final frame.
    pub(crate) fn on_frame(
        &mut self,
        payload: Bytes,
        more: bool,
    ) -> Result<Reassembly, ReassemblyError> {
        if self.discarding {
            if !more {
                self.discarding = false;
            }
            trace!(len = payload.len(), "discarding fragment of failed message");
            return Ok(Reassembly::Pending);
        }

        if self.fragments.is_empty() && !more {
            if payload.len() > self.max {
                return Err(ReassemblyError::TooLarge { max: self.max });
            }
            return Ok(Reassembly::Complete(payload));
        }

        let len = self.len + payload.len();
        if len > self.max {
            self.fail(more);
            return Err(ReassemblyError::TooLarge { max: self.max });
        }
        self.len = len;
        self.fragments.push(payload);
        if more {
            return Ok(Reassembly::Pending);
        }

        let mut joined: Vec<u8> = Vec::new();
        if joined.try_reserve_exact(self.len).is_err() {
            self.fail(false);
            return Err(ReassemblyError::Alloc);
        }
        for fragment in self.fragments.drain(..) {
            joined.extend_from_slice(&fragment);
        }
        self.len = 0;
        Ok(Reassembly::Complete(Bytes::from(joined)))
    }

    /// Drop any partial message
    pub(crate) fn clear(&mut self) {
        self.fragments.clear();
        self.len = 0;
        self.discarding = false;
    }

    /// Whether no partial message is held
    pub(crate) fn is_empty(&self) -> bool {
        self.fragments.is_empty() && !self.discarding
    }

    fn fail(&mut self, more: bool) {
        self.fragments.clear();
        self.len = 0;
        self.discarding = more;
    }
}
