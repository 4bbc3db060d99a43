use std::time::Instant;

/// Kinds of timeouts needed to run a circuit
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// When to send a held-back acknowledgement (T2)
    AckDelay = 0,
    /// When to give up on an outgoing call (T21)
    Call = 1,
    /// When to retransmit an unconfirmed reset request (T22)
    Reset = 2,
    /// When to retransmit an unconfirmed clear request (T23)
    Clear = 3,
    /// When to clear a circuit that carried no data
    Idle = 4,
}

impl Timer {
    pub(crate) const VALUES: [Self; 5] = [
        Self::AckDelay,
        Self::Call,
        Self::Reset,
        Self::Clear,
        Self::Idle,
    ];

    /// Timers driving the call, reset and clear procedures, of which at most one runs
    fn is_protocol(self) -> bool {
        self != Self::Idle
    }
}

/// Keeps track of the deadline for each `Timer`
///
/// Arming a protocol timer stops any other protocol timer, so a circuit waits on at most one
/// procedure at a time. The idle timer runs independently.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; Timer::VALUES.len()],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        if timer.is_protocol() {
            self.stop_protocol();
        }
        self.data[timer as usize] = Some(time);
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    pub(crate) fn stop_protocol(&mut self) {
        for timer in Timer::VALUES {
            if timer.is_protocol() {
                self.stop(timer);
            }
        }
    }

    pub(crate) fn stop_all(&mut self) {
        self.data = Default::default();
    }

    pub(crate) fn is_set(&self, timer: Timer) -> bool {
        self.data[timer as usize].is_some()
    }

    /// Earliest armed deadline
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Remove the next timer up until `now`, including it
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        let timer = Timer::VALUES
            .into_iter()
            .filter(|&timer| self.data[timer as usize].is_some_and(|time| time <= now))
            .min_by_key(|&timer| self.data[timer as usize])?;
        self.data[timer as usize] = None;
        Some(timer)
    }
}
