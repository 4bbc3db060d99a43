use std::{fmt, str::FromStr};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, UnexpectedEnd};

/// Maximum number of digits in an X.121 address
pub const MAX_ADDRESS_DIGITS: usize = 15;

/// An X.121 network address: up to 15 decimal digits
///
/// The empty address is valid and is what a call accepted frame usually carries.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address {
    len: u8,
    digits: [u8; MAX_ADDRESS_DIGITS],
}

impl Address {
    /// The empty address
    pub const EMPTY: Self = Self {
        len: 0,
        digits: [0; MAX_ADDRESS_DIGITS],
    };

    /// Build an address from individual digit values (0..=9)
    pub fn from_digits(digits: &[u8]) -> Result<Self, AddressError> {
        if digits.len() > MAX_ADDRESS_DIGITS {
            return Err(AddressError::TooLong);
        }
        if digits.iter().any(|&d| d > 9) {
            return Err(AddressError::InvalidDigit);
        }
        let mut res = Self::EMPTY;
        res.len = digits.len() as u8;
        res.digits[..digits.len()].copy_from_slice(digits);
        Ok(res)
    }

    /// Number of digits
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether this is the empty address
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Digit values, most significant first
    pub fn digits(&self) -> &[u8] {
        &self.digits[..self.len as usize]
    }

    /// Decode `count` BCD digits
    pub(crate) fn decode_bcd<B: Buf>(buf: &mut B, count: usize) -> coding::Result<Self> {
        if count > MAX_ADDRESS_DIGITS {
            return Err(UnexpectedEnd);
        }
        let digits = coding::get_bcd(buf, count)?;
        Self::from_digits(&digits).map_err(|_| UnexpectedEnd)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in self.digits() {
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .bytes()
            .map(|b| match b {
                b'0'..=b'9' => Ok(b - b'0'),
                _ => Err(AddressError::InvalidDigit),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_digits(&digits)
    }
}

/// Errors arising from malformed addresses or callsigns
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum AddressError {
    /// More digits or characters than the encoding holds
    #[error("address too long")]
    TooLong,
    /// A character outside the permitted set
    #[error("invalid address character")]
    InvalidDigit,
    /// SSID outside 0..=15
    #[error("invalid SSID")]
    InvalidSsid,
}

/// An AX.25-style station identifier used for digipeater sub-addressing
///
/// Up to six upper-case alphanumeric characters plus a 4-bit SSID, written `N0CALL-7`.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Callsign {
    chars: [u8; 6],
    ssid: u8,
}

impl Callsign {
    /// Encoded size in octets
    pub const SIZE: usize = 7;

    /// Build a callsign from its text and SSID
    pub fn new(call: &str, ssid: u8) -> Result<Self, AddressError> {
        if call.is_empty() || call.len() > 6 {
            return Err(AddressError::TooLong);
        }
        if ssid > 15 {
            return Err(AddressError::InvalidSsid);
        }
        let mut chars = [b' '; 6];
        for (slot, c) in chars.iter_mut().zip(call.bytes()) {
            if !c.is_ascii_alphanumeric() {
                return Err(AddressError::InvalidDigit);
            }
            *slot = c.to_ascii_uppercase();
        }
        Ok(Self { chars, ssid })
    }

    /// The station part without padding
    pub fn call(&self) -> &str {
        let end = self
            .chars
            .iter()
            .position(|&c| c == b' ')
            .unwrap_or(self.chars.len());
        // Constructed from ASCII only
        std::str::from_utf8(&self.chars[..end]).unwrap_or_default()
    }

    /// Secondary station identifier
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        for c in self.chars {
            buf.put_u8(c << 1);
        }
        buf.put_u8(0x60 | (self.ssid << 1));
    }

    pub(crate) fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(UnexpectedEnd);
        }
        let mut chars = [0; 6];
        for slot in chars.iter_mut() {
            let c = buf.get_u8() >> 1;
            if !(c.is_ascii_alphanumeric() || c == b' ') {
                return Err(UnexpectedEnd);
            }
            *slot = c;
        }
        let ssid = (buf.get_u8() >> 1) & 0x0f;
        Ok(Self { chars, ssid })
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ssid {
            0 => f.write_str(self.call()),
            ssid => write!(f, "{}-{}", self.call(), ssid),
        }
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callsign({self})")
    }
}

impl FromStr for Callsign {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((call, ssid)) => {
                let ssid = ssid.parse().map_err(|_| AddressError::InvalidSsid)?;
                Self::new(call, ssid)
            }
            None => Self::new(s, 0),
        }
    }
}
