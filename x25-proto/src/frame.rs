use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    address::{Address, MAX_ADDRESS_DIGITS},
    coding::{self, BufExt, UnexpectedEnd},
    facilities::Facilities,
    shared::{Lci, Modulus},
};

/// Largest call user data field the codec accepts
pub const MAX_CALL_USER_DATA: usize = 128;
/// Largest interrupt user data field
pub const MAX_INTERRUPT_DATA: usize = 32;
/// Size of the fixed packet header
pub const HEADER_SIZE: usize = 3;

const GFI_Q: u8 = 0x8;
const GFI_D: u8 = 0x4;

/// A packet-layer frame type
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u8);

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    DATA = 0x00,
    RR = 0x01,
    RNR = 0x05,
    REJ = 0x09,
    CALL_REQUEST = 0x0b,
    CALL_ACCEPTED = 0x0f,
    CLEAR_REQUEST = 0x13,
    CLEAR_CONFIRMATION = 0x17,
    RESET_REQUEST = 0x1b,
    RESET_CONFIRMATION = 0x1f,
    INTERRUPT = 0x23,
    INTERRUPT_CONFIRMATION = 0x27,
    DIAGNOSTIC = 0xf1,
    REGISTRATION_REQUEST = 0xf3,
    REGISTRATION_CONFIRMATION = 0xf7,
    RESTART_REQUEST = 0xfb,
    RESTART_CONFIRMATION = 0xff,
}

/// Fixed three-octet header common to every frame
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Header {
    /// Channel the frame belongs to
    pub lci: Lci,
    /// Numbering announced by the general format identifier
    pub modulus: Modulus,
    /// Qualifier bit (data frames)
    pub q: bool,
    /// Delivery confirmation bit
    pub d: bool,
}

impl Header {
    /// Header for a frame on `lci` with no Q or D bit
    pub fn new(lci: Lci, modulus: Modulus) -> Self {
        Self {
            lci,
            modulus,
            q: false,
            d: false,
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        let hi = buf.get_u8();
        let lo = buf.get_u8();
        let gfi = hi >> 4;
        Some(Self {
            lci: Lci(u16::from(hi & 0x0f) << 8 | u16::from(lo)),
            modulus: Modulus::from_gfi_bits(gfi)?,
            q: gfi & GFI_Q != 0,
            d: gfi & GFI_D != 0,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut gfi = self.modulus.gfi_bits();
        if self.q {
            gfi |= GFI_Q;
        }
        if self.d {
            gfi |= GFI_D;
        }
        buf.put_u8(gfi << 4 | (self.lci.0 >> 8) as u8);
        buf.put_u8(self.lci.0 as u8);
    }
}

/// A decoded frame with its header
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    /// Only meaningful when the header was readable; see [`Packet::decode`]
    pub header: Header,
    /// Type-specific contents
    pub frame: Frame,
}

/// Type-specific frame contents
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    /// Open a circuit
    CallRequest(CallSetup),
    /// Accept an incoming call
    CallAccepted(CallSetup),
    /// Hang up a circuit or refuse a call
    ClearRequest(Cause),
    /// Acknowledge a clear request
    ClearConfirmation,
    /// Resynchronise a circuit's flow control
    ResetRequest(Cause),
    /// Acknowledge a reset request
    ResetConfirmation,
    /// Reinitialise every circuit on the link
    RestartRequest(Cause),
    /// Acknowledge a restart request
    RestartConfirmation,
    /// Sequenced user data
    Data(Data),
    /// Receiver ready, acknowledging up to `nr`
    ReceiveReady {
        /// Next sequence number the sender expects
        nr: u8,
    },
    /// Receiver not ready, acknowledging up to `nr`
    ReceiveNotReady {
        /// Next sequence number the sender expects
        nr: u8,
    },
    /// Request retransmission from `nr`
    Reject {
        /// First sequence number to retransmit
        nr: u8,
    },
    /// Expedited user data outside flow control
    Interrupt(Bytes),
    /// Acknowledge an interrupt
    InterruptConfirmation,
    /// Network diagnostic report
    Diagnostic {
        /// Diagnostic code
        code: u8,
        /// Leading octets of the offending frame
        explanation: Bytes,
    },
    /// Request to change facilities, carried opaquely
    RegistrationRequest(Bytes),
    /// Answer to a registration request, carried opaquely
    RegistrationConfirmation(Bytes),
    /// Truncated or unrecognised input
    Illegal,
}

/// Body of call request and call accepted frames
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CallSetup {
    /// Address of the station being called
    pub called: Address,
    /// Address of the station placing the call
    pub calling: Address,
    /// Negotiated options
    pub facilities: Facilities,
    /// Opaque user data, at most [`MAX_CALL_USER_DATA`] octets
    pub user_data: Bytes,
}

/// Cause and diagnostic carried by clear, reset and restart requests
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Cause {
    /// Why the request was sent
    pub cause: u8,
    /// Additional detail
    pub diagnostic: u8,
}

impl Cause {
    /// Originated by the remote station itself, no diagnostic
    pub const DTE_ORIGINATED: Self = Self {
        cause: 0x00,
        diagnostic: 0x00,
    };
    /// Called station busy, no free resources
    pub const NUMBER_BUSY: Self = Self {
        cause: 0x01,
        diagnostic: 0x00,
    };
    /// Local procedure error
    pub const LOCAL_PROCEDURE_ERROR: Self = Self {
        cause: 0x05,
        diagnostic: 0x00,
    };
    /// Network congestion
    pub const NETWORK_CONGESTION: Self = Self {
        cause: 0x07,
        diagnostic: 0x00,
    };

    /// Same cause with a different diagnostic
    pub const fn with_diagnostic(self, diagnostic: u8) -> Self {
        Self {
            cause: self.cause,
            diagnostic,
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let cause = buf.get::<u8>()?;
        // Diagnostic is optional on the wire
        let diagnostic = buf.get::<u8>().unwrap_or(0);
        Ok(Self { cause, diagnostic })
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cause {:#04x} diagnostic {:#04x}", self.cause, self.diagnostic)
    }
}

/// Body of a data frame
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Data {
    /// Send sequence number
    pub ns: u8,
    /// Piggybacked acknowledgement
    pub nr: u8,
    /// More data follows in the next frame
    pub more: bool,
    /// User data
    pub payload: Bytes,
}

impl Frame {
    /// The frame's type, or `None` for [`Frame::Illegal`]
    pub fn ty(&self) -> Option<FrameType> {
        Some(match self {
            Self::CallRequest(_) => FrameType::CALL_REQUEST,
            Self::CallAccepted(_) => FrameType::CALL_ACCEPTED,
            Self::ClearRequest(_) => FrameType::CLEAR_REQUEST,
            Self::ClearConfirmation => FrameType::CLEAR_CONFIRMATION,
            Self::ResetRequest(_) => FrameType::RESET_REQUEST,
            Self::ResetConfirmation => FrameType::RESET_CONFIRMATION,
            Self::RestartRequest(_) => FrameType::RESTART_REQUEST,
            Self::RestartConfirmation => FrameType::RESTART_CONFIRMATION,
            Self::Data(_) => FrameType::DATA,
            Self::ReceiveReady { .. } => FrameType::RR,
            Self::ReceiveNotReady { .. } => FrameType::RNR,
            Self::Reject { .. } => FrameType::REJ,
            Self::Interrupt(_) => FrameType::INTERRUPT,
            Self::InterruptConfirmation => FrameType::INTERRUPT_CONFIRMATION,
            Self::Diagnostic { .. } => FrameType::DIAGNOSTIC,
            Self::RegistrationRequest(_) => FrameType::REGISTRATION_REQUEST,
            Self::RegistrationConfirmation(_) => FrameType::REGISTRATION_CONFIRMATION,
            Self::Illegal => return None,
        })
    }

    /// Receive sequence number carried by data and supervisory frames
    pub fn nr(&self) -> Option<u8> {
        match *self {
            Self::Data(ref data) => Some(data.nr),
            Self::ReceiveReady { nr } | Self::ReceiveNotReady { nr } | Self::Reject { nr } => {
                Some(nr)
            }
            _ => None,
        }
    }

    /// Send sequence number of a data frame
    pub fn ns(&self) -> Option<u8> {
        match self {
            Self::Data(data) => Some(data.ns),
            _ => None,
        }
    }

    /// Whether this is a data frame with the more-data bit set
    pub fn more(&self) -> bool {
        matches!(self, Self::Data(data) if data.more)
    }
}

impl Packet {
    /// Build a packet with a plain header
    pub fn new(lci: Lci, modulus: Modulus, frame: Frame) -> Self {
        Self {
            header: Header::new(lci, modulus),
            frame,
        }
    }

    /// Decode one frame
    ///
    /// Never fails: anything truncated or unrecognised yields [`Frame::Illegal`]. If the
    /// header itself could not be read, `header` is the default.
    pub fn decode(mut data: Bytes) -> Self {
        let header = match Header::decode(&mut data) {
            Some(header) => header,
            None => {
                return Self {
                    header: Header::default(),
                    frame: Frame::Illegal,
                }
            }
        };
        let frame = Frame::decode(&mut data, header.modulus).unwrap_or(Frame::Illegal);
        Self { header, frame }
    }

    /// Type of the carried frame, `None` if it was illegal
    pub fn frame_type(&self) -> Option<FrameType> {
        self.frame.ty()
    }

    /// Append the wire encoding
    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        self.frame.encode(self.header.modulus, buf);
    }

    /// Wire encoding as a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.frame.size_hint());
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl Frame {
    fn decode(buf: &mut Bytes, modulus: Modulus) -> coding::Result<Self> {
        let ty = buf.get::<u8>()?;
        let frame = match FrameType(ty) {
            FrameType::CALL_REQUEST => Self::CallRequest(CallSetup::decode(buf)?),
            FrameType::CALL_ACCEPTED => Self::CallAccepted(CallSetup::decode(buf)?),
            FrameType::CLEAR_REQUEST => Self::ClearRequest(Cause::decode(buf)?),
            FrameType::CLEAR_CONFIRMATION => Self::ClearConfirmation,
            FrameType::RESET_REQUEST => Self::ResetRequest(Cause::decode(buf)?),
            FrameType::RESET_CONFIRMATION => Self::ResetConfirmation,
            FrameType::RESTART_REQUEST => Self::RestartRequest(Cause::decode(buf)?),
            FrameType::RESTART_CONFIRMATION => Self::RestartConfirmation,
            FrameType::INTERRUPT => {
                if buf.is_empty() || buf.len() > MAX_INTERRUPT_DATA {
                    return Err(UnexpectedEnd);
                }
                Self::Interrupt(buf.split_off(0))
            }
            FrameType::INTERRUPT_CONFIRMATION => Self::InterruptConfirmation,
            FrameType::DIAGNOSTIC => Self::Diagnostic {
                code: buf.get()?,
                explanation: buf.split_off(0),
            },
            FrameType::REGISTRATION_REQUEST => Self::RegistrationRequest(buf.split_off(0)),
            FrameType::REGISTRATION_CONFIRMATION => {
                Self::RegistrationConfirmation(buf.split_off(0))
            }
            _ => return Self::decode_sequenced(ty, buf, modulus),
        };
        Ok(frame)
    }

    fn decode_sequenced(ty: u8, buf: &mut Bytes, modulus: Modulus) -> coding::Result<Self> {
        match modulus {
            Modulus::Basic => {
                let nr = ty >> 5;
                match FrameType(ty & 0x1f) {
                    FrameType::RR => return Ok(Self::ReceiveReady { nr }),
                    FrameType::RNR => return Ok(Self::ReceiveNotReady { nr }),
                    FrameType::REJ => return Ok(Self::Reject { nr }),
                    _ => {}
                }
                if ty & 0x01 != 0 {
                    return Err(UnexpectedEnd);
                }
                Ok(Self::Data(Data {
                    ns: (ty >> 1) & 0x07,
                    nr,
                    more: ty & 0x10 != 0,
                    payload: buf.split_off(0),
                }))
            }
            Modulus::Extended => {
                let second = buf.get::<u8>()?;
                let nr = second >> 1;
                match FrameType(ty) {
                    FrameType::RR => return Ok(Self::ReceiveReady { nr }),
                    FrameType::RNR => return Ok(Self::ReceiveNotReady { nr }),
                    FrameType::REJ => return Ok(Self::Reject { nr }),
                    _ => {}
                }
                if ty & 0x01 != 0 {
                    return Err(UnexpectedEnd);
                }
                Ok(Self::Data(Data {
                    ns: ty >> 1,
                    nr,
                    more: second & 0x01 != 0,
                    payload: buf.split_off(0),
                }))
            }
        }
    }

    fn encode(&self, modulus: Modulus, buf: &mut BytesMut) {
        match self {
            Self::CallRequest(setup) => {
                buf.put_u8(FrameType::CALL_REQUEST.0);
                setup.encode(buf);
            }
            Self::CallAccepted(setup) => {
                buf.put_u8(FrameType::CALL_ACCEPTED.0);
                setup.encode(buf);
            }
            Self::ClearRequest(cause) => put_cause(buf, FrameType::CLEAR_REQUEST, cause),
            Self::ClearConfirmation => buf.put_u8(FrameType::CLEAR_CONFIRMATION.0),
            Self::ResetRequest(cause) => put_cause(buf, FrameType::RESET_REQUEST, cause),
            Self::ResetConfirmation => buf.put_u8(FrameType::RESET_CONFIRMATION.0),
            Self::RestartRequest(cause) => put_cause(buf, FrameType::RESTART_REQUEST, cause),
            Self::RestartConfirmation => buf.put_u8(FrameType::RESTART_CONFIRMATION.0),
            Self::Data(data) => {
                match modulus {
                    Modulus::Basic => {
                        buf.put_u8(
                            (data.nr & 0x07) << 5 | u8::from(data.more) << 4 | (data.ns & 0x07) << 1,
                        );
                    }
                    Modulus::Extended => {
                        buf.put_u8((data.ns & 0x7f) << 1);
                        buf.put_u8((data.nr & 0x7f) << 1 | u8::from(data.more));
                    }
                }
                buf.put_slice(&data.payload);
            }
            Self::ReceiveReady { nr } => put_supervisory(buf, modulus, FrameType::RR, *nr),
            Self::ReceiveNotReady { nr } => put_supervisory(buf, modulus, FrameType::RNR, *nr),
            Self::Reject { nr } => put_supervisory(buf, modulus, FrameType::REJ, *nr),
            Self::Interrupt(data) => {
                buf.put_u8(FrameType::INTERRUPT.0);
                buf.put_slice(data);
            }
            Self::InterruptConfirmation => buf.put_u8(FrameType::INTERRUPT_CONFIRMATION.0),
            Self::Diagnostic { code, explanation } => {
                buf.put_u8(FrameType::DIAGNOSTIC.0);
                buf.put_u8(*code);
                buf.put_slice(explanation);
            }
            Self::RegistrationRequest(body) => {
                buf.put_u8(FrameType::REGISTRATION_REQUEST.0);
                buf.put_slice(body);
            }
            Self::RegistrationConfirmation(body) => {
                buf.put_u8(FrameType::REGISTRATION_CONFIRMATION.0);
                buf.put_slice(body);
            }
            // Never sent; encoding it produces a frame the peer will also discard
            Self::Illegal => buf.put_u8(0x03),
        }
    }

    fn size_hint(&self) -> usize {
        match self {
            Self::CallRequest(_) | Self::CallAccepted(_) => 64,
            Self::Data(data) => 2 + data.payload.len(),
            Self::Interrupt(data) => 1 + data.len(),
            _ => 3,
        }
    }
}

fn put_cause(buf: &mut BytesMut, ty: FrameType, cause: &Cause) {
    buf.put_u8(ty.0);
    buf.put_u8(cause.cause);
    buf.put_u8(cause.diagnostic);
}

fn put_supervisory(buf: &mut BytesMut, modulus: Modulus, ty: FrameType, nr: u8) {
    match modulus {
        Modulus::Basic => buf.put_u8((nr & 0x07) << 5 | ty.0),
        Modulus::Extended => {
            buf.put_u8(ty.0);
            buf.put_u8((nr & 0x7f) << 1);
        }
    }
}

impl CallSetup {
    fn decode(buf: &mut Bytes) -> coding::Result<Self> {
        let lens = buf.get::<u8>()?;
        let calling_len = (lens >> 4) as usize;
        let called_len = (lens & 0x0f) as usize;
        if calling_len > MAX_ADDRESS_DIGITS || called_len > MAX_ADDRESS_DIGITS {
            return Err(UnexpectedEnd);
        }
        let digits = coding::get_bcd(buf, called_len + calling_len)?;
        let (called, calling) = digits.split_at(called_len);
        let called = Address::from_digits(called).map_err(|_| UnexpectedEnd)?;
        let calling = Address::from_digits(calling).map_err(|_| UnexpectedEnd)?;
        // A bare call accepted frame may stop after the address block
        let facilities = match buf.has_remaining() {
            true => Facilities::decode(buf)?,
            false => Facilities::default(),
        };
        if buf.len() > MAX_CALL_USER_DATA {
            return Err(UnexpectedEnd);
        }
        Ok(Self {
            called,
            calling,
            facilities,
            user_data: buf.split_off(0),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((self.calling.len() as u8) << 4 | self.called.len() as u8);
        coding::put_bcd(
            buf,
            self.called
                .digits()
                .iter()
                .chain(self.calling.digits())
                .copied(),
        );
        self.facilities.encode(buf);
        buf.put_slice(&self.user_data);
    }
}
