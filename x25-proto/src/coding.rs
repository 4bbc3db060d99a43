//! Coding related traits.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Error indicating that the provided buffer was too small
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Coding result type
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Infallible encoding and decoding of packet-layer primitives
pub trait Codec: Sized {
    /// Decode a `Self` from the provided buffer, if the buffer is large enough
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Append the encoding of `self` to the provided buffer
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

/// Extension trait for reading from buffers
pub trait BufExt {
    /// Read and decode a value from the buffer
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Split off the next `len` bytes, failing if fewer remain
    fn take_exact(&mut self, len: usize) -> Result<bytes::Bytes>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn take_exact(&mut self, len: usize) -> Result<bytes::Bytes> {
        if self.remaining() < len {
            return Err(UnexpectedEnd);
        }
        Ok(self.copy_to_bytes(len))
    }
}

/// Pack decimal digits two to an octet, high nibble first, padding an odd tail with zero
pub(crate) fn put_bcd<B: BufMut>(buf: &mut B, digits: impl IntoIterator<Item = u8>) {
    let mut pending = None;
    for digit in digits {
        match pending.take() {
            None => pending = Some(digit),
            Some(high) => buf.put_u8(high << 4 | digit),
        }
    }
    if let Some(high) = pending {
        buf.put_u8(high << 4);
    }
}

/// Unpack `count` BCD digits; non-decimal nibbles are rejected
pub(crate) fn get_bcd<B: Buf>(buf: &mut B, count: usize) -> Result<Vec<u8>> {
    let octets = (count + 1) / 2;
    if buf.remaining() < octets {
        return Err(UnexpectedEnd);
    }
    let mut digits = Vec::with_capacity(count);
    for _ in 0..octets {
        let byte = buf.get_u8();
        for nibble in [byte >> 4, byte & 0x0f] {
            if digits.len() == count {
                break;
            }
            if nibble > 9 {
                return Err(UnexpectedEnd);
            }
            digits.push(nibble);
        }
    }
    Ok(digits)
}
