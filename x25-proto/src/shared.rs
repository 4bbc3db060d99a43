use std::fmt;

/// Logical channel identifier of a circuit on a link
///
/// Twelve bits on the wire. Channel 0 is reserved for link-level restart and diagnostic
/// traffic and is never assigned to a circuit.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Lci(pub(crate) u16);

impl Lci {
    /// The link-level channel
    pub const LINK: Self = Self(0);
    /// Largest representable channel
    pub const MAX: Self = Self(0x0fff);

    /// Construct from a raw value, if it fits in twelve bits
    pub const fn new(x: u16) -> Option<Self> {
        if x <= Self::MAX.0 {
            Some(Self(x))
        } else {
            None
        }
    }

    /// The raw channel number
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Whether this is the link-level channel
    pub fn is_link(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Lci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lci({})", self.0)
    }
}

impl fmt::Display for Lci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sequence numbering in use on a link
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum Modulus {
    /// Three-bit sequence numbers
    #[default]
    Basic,
    /// Seven-bit sequence numbers
    Extended,
}

impl Modulus {
    /// The wraparound bound `M`
    pub const fn get(self) -> u8 {
        match self {
            Self::Basic => 8,
            Self::Extended => 128,
        }
    }

    /// `(a + b) mod M`
    pub(crate) fn add(self, a: u8, b: u8) -> u8 {
        ((a as u16 + b as u16) % self.get() as u16) as u8
    }

    /// Forward distance from `from` to `to`, modulo `M`
    pub(crate) fn distance(self, from: u8, to: u8) -> u8 {
        let m = self.get() as u16;
        ((to as u16 + m - from as u16 % m) % m) as u8
    }

    /// Modulo bits of the general format identifier
    pub(crate) fn gfi_bits(self) -> u8 {
        match self {
            Self::Basic => 0x1,
            Self::Extended => 0x2,
        }
    }

    pub(crate) fn from_gfi_bits(bits: u8) -> Option<Self> {
        match bits & 0x3 {
            0x1 => Some(Self::Basic),
            0x2 => Some(Self::Extended),
            _ => None,
        }
    }
}

impl fmt::Display for Modulus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "modulo {}", self.get())
    }
}
