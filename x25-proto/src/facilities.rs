//! Call setup facilities
//!
//! The facilities block that follows the address block of call request and call accepted
//! frames is a length-prefixed sequence of families, each `[tag][len][payload]`. Families we
//! don't understand are skipped by their declared length. Inside a family, each facility code
//! announces its parameter length in its top two bits (one, two or three octets, or an
//! explicit length octet), so unknown codes can be skipped without failing the whole block.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::{
    address::{Address, AddressError, Callsign, MAX_ADDRESS_DIGITS},
    coding::{self, BufExt, UnexpectedEnd},
};

/// Family carrying the random call token and digipeater sub-addresses
const FAMILY_NATIONAL: u8 = 0x00;
/// Family carrying the standard negotiable parameters and NSAP-style addresses
const FAMILY_GENERIC: u8 = 0x0f;

const NATIONAL_RANDOM: u8 = 0x7f;
const NATIONAL_DEST_DIGIS: u8 = 0xe9;
const NATIONAL_SRC_DIGIS: u8 = 0xeb;

const GENERIC_PACKET_SIZE: u8 = 0x42;
const GENERIC_WINDOW_SIZE: u8 = 0x43;
const GENERIC_DEST_NSAP: u8 = 0xc9;
const GENERIC_SRC_NSAP: u8 = 0xcb;

/// Maximum digipeaters carried in either direction
pub const MAX_DIGIS: usize = 6;
/// Maximum length of an NSAP identifier
pub const MAX_IDENT_LEN: usize = 9;

/// Negotiable options carried in call setup frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facilities {
    /// Random token identifying the call across the network
    pub random: Option<u16>,
    /// Digipeaters on the path towards the called station
    pub dest_digis: Vec<Callsign>,
    /// Digipeaters on the path back to the calling station
    pub source_digis: Vec<Callsign>,
    /// Maximum data field sizes
    pub packet_size: Option<Directional<u16>>,
    /// Flow control window sizes
    pub window_size: Option<Directional<u8>>,
    /// Called station identification
    pub destination: Option<Nsap>,
    /// Calling station identification
    pub source: Option<Nsap>,
}

/// A parameter negotiated separately for each direction of data transfer
///
/// Directions are named the way they travel on the wire, relative to the call: data sent by
/// the called station, then data sent by the calling station.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Directional<T> {
    /// Applies to data sent by the called station
    pub from_called: T,
    /// Applies to data sent by the calling station
    pub from_calling: T,
}

impl<T: Copy + Ord> Directional<T> {
    /// Both directions set to `x`
    pub fn both(x: T) -> Self {
        Self {
            from_called: x,
            from_calling: x,
        }
    }

    /// Per-direction minimum of two proposals
    pub fn min(self, other: Self) -> Self {
        Self {
            from_called: self.from_called.min(other.from_called),
            from_calling: self.from_calling.min(other.from_calling),
        }
    }
}

/// Address plus short textual identifier of a station
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nsap {
    address: Address,
    ident: String,
}

impl Nsap {
    /// Construct an entry, validating the identifier
    pub fn new(address: Address, ident: &str) -> Result<Self, AddressError> {
        if ident.len() > MAX_IDENT_LEN {
            return Err(AddressError::TooLong);
        }
        if !ident.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(AddressError::InvalidDigit);
        }
        Ok(Self {
            address,
            ident: ident.to_owned(),
        })
    }

    /// Network address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Station identifier, at most nine printable ASCII characters
    pub fn ident(&self) -> &str {
        &self.ident
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.address.len() as u8);
        coding::put_bcd(buf, self.address.digits().iter().copied());
        buf.put_slice(self.ident.as_bytes());
    }

    fn decode(mut buf: Bytes) -> coding::Result<Self> {
        let count = buf.get::<u8>()? as usize;
        if count > MAX_ADDRESS_DIGITS {
            return Err(UnexpectedEnd);
        }
        let address = Address::decode_bcd(&mut buf, count)?;
        let ident = std::str::from_utf8(&buf).map_err(|_| UnexpectedEnd)?;
        Self::new(address, ident).map_err(|_| UnexpectedEnd)
    }
}

impl Facilities {
    /// Whether no facility is present
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Append the length-prefixed block
    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut block = BytesMut::new();

        let mut national = BytesMut::new();
        if let Some(random) = self.random {
            national.put_u8(NATIONAL_RANDOM);
            national.put_u16(random);
        }
        put_digis(&mut national, NATIONAL_DEST_DIGIS, &self.dest_digis);
        put_digis(&mut national, NATIONAL_SRC_DIGIS, &self.source_digis);
        put_family(&mut block, FAMILY_NATIONAL, &national);

        let mut generic = BytesMut::new();
        if let Some(size) = self.packet_size {
            generic.put_u8(GENERIC_PACKET_SIZE);
            generic.put_u8(log2_size(size.from_called));
            generic.put_u8(log2_size(size.from_calling));
        }
        if let Some(window) = self.window_size {
            generic.put_u8(GENERIC_WINDOW_SIZE);
            generic.put_u8(window.from_called);
            generic.put_u8(window.from_calling);
        }
        for (code, nsap) in [
            (GENERIC_DEST_NSAP, &self.destination),
            (GENERIC_SRC_NSAP, &self.source),
        ] {
            if let Some(nsap) = nsap {
                let mut entry = BytesMut::new();
                nsap.encode(&mut entry);
                generic.put_u8(code);
                generic.put_u8(entry.len() as u8);
                generic.put_slice(&entry);
            }
        }
        put_family(&mut block, FAMILY_GENERIC, &generic);

        // digipeater lists are capped and NSAP entries are validated on construction, so even
        // a block with every facility present stays well under 255 octets
        debug_assert!(block.len() <= u8::MAX as usize);
        buf.put_u8(block.len() as u8);
        buf.put_slice(&block);
    }

    /// Read a length-prefixed block
    ///
    /// Fails only on truncation; unknown families and codes are skipped.
    pub(crate) fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let len = buf.get::<u8>()? as usize;
        let mut block = buf.take_exact(len)?;
        let mut facilities = Self::default();
        while block.has_remaining() {
            let tag = block.get::<u8>()?;
            let len = block.get::<u8>()? as usize;
            let payload = block.take_exact(len)?;
            match tag {
                FAMILY_NATIONAL => facilities.decode_national(payload)?,
                FAMILY_GENERIC => facilities.decode_generic(payload)?,
                _ => trace!(tag, len, "skipping unknown facility family"),
            }
        }
        Ok(facilities)
    }

    fn decode_national(&mut self, mut buf: Bytes) -> coding::Result<()> {
        while buf.has_remaining() {
            let (code, param) = next_facility(&mut buf)?;
            match code {
                NATIONAL_RANDOM => self.random = Some(u16::from_be_bytes([param[0], param[1]])),
                NATIONAL_DEST_DIGIS => self.dest_digis = get_digis(param),
                NATIONAL_SRC_DIGIS => self.source_digis = get_digis(param),
                _ => trace!(code, "skipping unknown national facility"),
            }
        }
        Ok(())
    }

    fn decode_generic(&mut self, mut buf: Bytes) -> coding::Result<()> {
        while buf.has_remaining() {
            let (code, param) = next_facility(&mut buf)?;
            match code {
                GENERIC_PACKET_SIZE => {
                    match (size_from_log2(param[0]), size_from_log2(param[1])) {
                        (Some(from_called), Some(from_calling)) => {
                            self.packet_size = Some(Directional {
                                from_called,
                                from_calling,
                            })
                        }
                        _ => debug!("ignoring out of range packet size facility"),
                    }
                }
                GENERIC_WINDOW_SIZE => {
                    if param[0] == 0 || param[1] == 0 || param[0] > 127 || param[1] > 127 {
                        debug!("ignoring out of range window size facility");
                    } else {
                        self.window_size = Some(Directional {
                            from_called: param[0],
                            from_calling: param[1],
                        });
                    }
                }
                GENERIC_DEST_NSAP | GENERIC_SRC_NSAP => match Nsap::decode(param) {
                    Ok(nsap) if code == GENERIC_DEST_NSAP => self.destination = Some(nsap),
                    Ok(nsap) => self.source = Some(nsap),
                    Err(_) => debug!(code, "ignoring malformed NSAP facility"),
                },
                _ => trace!(code, "skipping unknown generic facility"),
            }
        }
        Ok(())
    }
}

/// Split the next facility code and its parameter field off `buf`
fn next_facility(buf: &mut Bytes) -> coding::Result<(u8, Bytes)> {
    let code = buf.get::<u8>()?;
    let len = match code & 0xc0 {
        0x00 => 1,
        0x40 => 2,
        0x80 => 3,
        _ => buf.get::<u8>()? as usize,
    };
    Ok((code, buf.take_exact(len)?))
}

fn put_family(block: &mut BytesMut, tag: u8, payload: &[u8]) {
    if payload.is_empty() {
        return;
    }
    block.put_u8(tag);
    block.put_u8(payload.len() as u8);
    block.put_slice(payload);
}

fn put_digis(buf: &mut BytesMut, code: u8, digis: &[Callsign]) {
    if digis.is_empty() {
        return;
    }
    let digis = &digis[..digis.len().min(MAX_DIGIS)];
    buf.put_u8(code);
    buf.put_u8((digis.len() * Callsign::SIZE) as u8);
    for digi in digis {
        digi.encode(buf);
    }
}

fn get_digis(mut param: Bytes) -> Vec<Callsign> {
    let mut digis = Vec::new();
    while param.remaining() >= Callsign::SIZE && digis.len() < MAX_DIGIS {
        match Callsign::decode(&mut param) {
            Ok(call) => digis.push(call),
            Err(_) => {
                debug!("ignoring malformed digipeater");
                break;
            }
        }
    }
    digis
}

/// Packet sizes travel as their base-two logarithm
fn log2_size(size: u16) -> u8 {
    size.max(1).ilog2() as u8
}

fn size_from_log2(x: u8) -> Option<u16> {
    match x {
        4..=12 => Some(1 << x),
        _ => None,
    }
}
