use std::{fmt, ops::RangeInclusive, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{address::Address, shared::Lci};

/// Parameters governing the per-circuit state machine
///
/// Defaults follow the X.25 standard values: a window of two frames, 128-octet packets and the
/// T2x timer durations. Window sizes above 7 only take effect on links using extended
/// sequencing; on basic links they are clamped.
#[derive(Clone)]
pub struct CircuitConfig {
    pub(crate) window_in: u8,
    pub(crate) window_out: u8,
    pub(crate) packet_size_in: u16,
    pub(crate) packet_size_out: u16,
    pub(crate) ack_delay: Duration,
    pub(crate) call_timeout: Duration,
    pub(crate) reset_timeout: Duration,
    pub(crate) clear_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_retries: u8,
    pub(crate) out_of_sequence: OutOfSequencePolicy,
    pub(crate) urgent_inline: bool,
    pub(crate) max_message_size: usize,
    pub(crate) max_delivery_failures: u8,
}

impl CircuitConfig {
    /// Number of unacknowledged frames we accept from the peer
    pub fn window_in(&mut self, value: u8) -> Result<&mut Self, ConfigError> {
        self.window_in = check_window(value)?;
        Ok(self)
    }

    /// Number of unacknowledged frames we are prepared to have outstanding
    pub fn window_out(&mut self, value: u8) -> Result<&mut Self, ConfigError> {
        self.window_out = check_window(value)?;
        Ok(self)
    }

    /// Largest data field we accept, a power of two between 16 and 4096
    pub fn packet_size_in(&mut self, value: u16) -> Result<&mut Self, ConfigError> {
        self.packet_size_in = check_packet_size(value)?;
        Ok(self)
    }

    /// Largest data field we send, a power of two between 16 and 4096
    ///
    /// Outgoing messages are split into frames of at most this many octets, chained with the
    /// more-data bit.
    pub fn packet_size_out(&mut self, value: u16) -> Result<&mut Self, ConfigError> {
        self.packet_size_out = check_packet_size(value)?;
        Ok(self)
    }

    /// How long to hold back an acknowledgement hoping to piggyback it on data (T2)
    pub fn ack_delay(&mut self, value: Duration) -> &mut Self {
        self.ack_delay = value;
        self
    }

    /// How long to wait for a call to be accepted (T21)
    pub fn call_timeout(&mut self, value: Duration) -> &mut Self {
        self.call_timeout = value;
        self
    }

    /// How long to wait for a reset to be confirmed before retrying (T22)
    pub fn reset_timeout(&mut self, value: Duration) -> &mut Self {
        self.reset_timeout = value;
        self
    }

    /// How long to wait for a clear to be confirmed before retrying (T23)
    pub fn clear_timeout(&mut self, value: Duration) -> &mut Self {
        self.clear_timeout = value;
        self
    }

    /// Clear connected circuits that carry no data for this long
    ///
    /// `None` disables the idle timeout.
    pub fn idle_timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Retransmissions of reset and clear requests before giving up
    pub fn max_retries(&mut self, value: u8) -> &mut Self {
        self.max_retries = value;
        self
    }

    /// What to do with data frames that don't carry the expected sequence number
    pub fn out_of_sequence(&mut self, value: OutOfSequencePolicy) -> &mut Self {
        self.out_of_sequence = value;
        self
    }

    /// Deliver interrupts as ordinary payload rather than as a separate event
    pub fn urgent_inline(&mut self, value: bool) -> &mut Self {
        self.urgent_inline = value;
        self
    }

    /// Largest message the reassembler will join from chained frames
    pub fn max_message_size(&mut self, value: usize) -> &mut Self {
        self.max_message_size = value;
        self
    }

    /// Consecutive delivery failures tolerated before the circuit is cleared
    pub fn max_delivery_failures(&mut self, value: u8) -> &mut Self {
        self.max_delivery_failures = value;
        self
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_in: DEFAULT_WINDOW,
            window_out: DEFAULT_WINDOW,
            packet_size_in: DEFAULT_PACKET_SIZE,
            packet_size_out: DEFAULT_PACKET_SIZE,
            ack_delay: Duration::from_secs(3),
            call_timeout: Duration::from_secs(200),
            reset_timeout: Duration::from_secs(180),
            clear_timeout: Duration::from_secs(180),
            idle_timeout: None,
            max_retries: 3,
            out_of_sequence: OutOfSequencePolicy::Drop,
            urgent_inline: false,
            max_message_size: 64 * 1024,
            max_delivery_failures: 3,
        }
    }
}

impl fmt::Debug for CircuitConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CircuitConfig")
            .field("window_in", &self.window_in)
            .field("window_out", &self.window_out)
            .field("packet_size_in", &self.packet_size_in)
            .field("packet_size_out", &self.packet_size_out)
            .field("ack_delay", &self.ack_delay)
            .field("call_timeout", &self.call_timeout)
            .field("reset_timeout", &self.reset_timeout)
            .field("clear_timeout", &self.clear_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_retries", &self.max_retries)
            .field("out_of_sequence", &self.out_of_sequence)
            .field("urgent_inline", &self.urgent_inline)
            .field("max_message_size", &self.max_message_size)
            .field("max_delivery_failures", &self.max_delivery_failures)
            .finish()
    }
}

/// Treatment of data frames whose send sequence number is not the one expected
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum OutOfSequencePolicy {
    /// Log and drop; the peer recovers through its own timers or a reset
    #[default]
    Drop,
    /// Send one reject per gap, and re-acknowledge duplicates
    Reject,
}

/// Link-wide configuration of a neighbour
#[derive(Debug, Clone)]
pub struct NeighbourConfig {
    pub(crate) extended: bool,
    pub(crate) restart_timeout: Duration,
    pub(crate) accept_incoming: bool,
    pub(crate) max_circuits: usize,
    pub(crate) lci_range: RangeInclusive<u16>,
    pub(crate) local_address: Address,
    pub(crate) circuit: Arc<CircuitConfig>,
    pub(crate) rng_seed: Option<[u8; 32]>,
}

impl NeighbourConfig {
    /// Use modulo 128 sequence numbers on this link
    ///
    /// Fixed for the lifetime of the neighbour.
    pub fn extended(&mut self, value: bool) -> &mut Self {
        self.extended = value;
        self
    }

    /// How long to wait for a restart to be confirmed (T20)
    pub fn restart_timeout(&mut self, value: Duration) -> &mut Self {
        self.restart_timeout = value;
        self
    }

    /// Whether to accept incoming calls at all
    pub fn accept_incoming(&mut self, value: bool) -> &mut Self {
        self.accept_incoming = value;
        self
    }

    /// Maximum number of simultaneous circuits on the link
    pub fn max_circuits(&mut self, value: usize) -> &mut Self {
        self.max_circuits = value;
        self
    }

    /// Channels available for circuits
    pub fn lci_range(&mut self, value: RangeInclusive<u16>) -> Result<&mut Self, ConfigError> {
        if *value.start() == 0 || *value.end() > Lci::MAX.get() || value.is_empty() {
            return Err(ConfigError::OutOfBounds);
        }
        self.lci_range = value;
        Ok(self)
    }

    /// Our own network address, placed in outgoing call requests
    pub fn local_address(&mut self, value: Address) -> &mut Self {
        self.local_address = value;
        self
    }

    /// Configuration applied to every circuit on this link
    pub fn circuit_config(&mut self, value: Arc<CircuitConfig>) -> &mut Self {
        self.circuit = value;
        self
    }

    /// Seed for the random call token, making outgoing call requests reproducible
    pub fn rng_seed(&mut self, value: Option<[u8; 32]>) -> &mut Self {
        self.rng_seed = value;
        self
    }
}

impl Default for NeighbourConfig {
    fn default() -> Self {
        Self {
            extended: false,
            restart_timeout: Duration::from_secs(180),
            accept_incoming: true,
            max_circuits: Lci::MAX.get() as usize,
            lci_range: 1..=Lci::MAX.get(),
            local_address: Address::EMPTY,
            circuit: Arc::new(CircuitConfig::default()),
            rng_seed: None,
        }
    }
}

/// Parameters of an egress queue and its watchdog
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub(crate) band_limit: usize,
    pub(crate) watchdog_interval: Duration,
    pub(crate) watchdog_timeout: Duration,
}

impl QueueConfig {
    /// Frames held per priority band before new ones are dropped
    pub fn band_limit(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.band_limit = value;
        Ok(self)
    }

    /// How often the watchdog looks for stalled devices
    pub fn watchdog_interval(&mut self, value: Duration) -> &mut Self {
        self.watchdog_interval = value;
        self
    }

    /// How long a device may stay busy without transmitting before it is kicked
    pub fn watchdog_timeout(&mut self, value: Duration) -> &mut Self {
        self.watchdog_timeout = value;
        self
    }

    /// Configured per-band limit
    pub fn get_band_limit(&self) -> usize {
        self.band_limit
    }

    /// Configured watchdog period
    pub fn get_watchdog_interval(&self) -> Duration {
        self.watchdog_interval
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            band_limit: 100,
            watchdog_interval: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors in the parameters being used to create a neighbour, circuit or queue
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}

/// Standard window size
pub(crate) const DEFAULT_WINDOW: u8 = 2;
/// Standard data field size
pub(crate) const DEFAULT_PACKET_SIZE: u16 = 128;

fn check_window(value: u8) -> Result<u8, ConfigError> {
    match value {
        1..=127 => Ok(value),
        _ => Err(ConfigError::OutOfBounds),
    }
}

fn check_packet_size(value: u16) -> Result<u16, ConfigError> {
    match value.is_power_of_two() && (16..=4096).contains(&value) {
        true => Ok(value),
        false => Err(ConfigError::OutOfBounds),
    }
}
