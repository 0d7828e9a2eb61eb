//! Unsigned LEB128 varints.
//!
//! Seven payload bits per byte, high bit set on every byte but the last.
//! A `u64` needs at most ten bytes and the tenth may only carry one bit.

use crate::WireError;
use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Accumulates varint bytes one at a time.
#[derive(Debug, Default)]
struct Accumulator {
    value: u64,
    shift: u32,
    len: usize,
}

impl Accumulator {
    /// Feed one byte; returns the value once the final byte arrives.
    fn push(&mut self, byte: u8) -> Result<Option<u64>, WireError> {
        if byte < 0x80 {
            if self.len == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(WireError::MalformedVarint);
            }
            return Ok(Some(self.value | (u64::from(byte) << self.shift)));
        }
        self.value |= u64::from(byte & 0x7f) << self.shift;
        self.shift += 7;
        self.len += 1;
        if self.len == MAX_VARINT_LEN {
            return Err(WireError::MalformedVarint);
        }
        Ok(None)
    }
}

/// Number of bytes `v` occupies on the wire
pub fn uvarint_len(v: u64) -> usize {
    let bits = 64 - (v | 1).leading_zeros() as usize;
    (bits + 6) / 7
}

/// Append the encoding of `v` to `buf`
pub fn encode_uvarint<B: BufMut>(mut v: u64, buf: &mut B) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Decode one varint from the front of `buf`.
///
/// Running out of bytes is reported as `MalformedVarint`, same as overflow.
pub fn decode_uvarint<B: Buf>(buf: &mut B) -> Result<u64, WireError> {
    let mut acc = Accumulator::default();
    while buf.has_remaining() {
        if let Some(v) = acc.push(buf.get_u8())? {
            return Ok(v);
        }
    }
    Err(WireError::MalformedVarint)
}

/// Read one varint from a stream.
///
/// A stream that ends before the first byte yields `Io(UnexpectedEof)`;
/// one that ends after it yields `MalformedVarint`.
pub async fn read_uvarint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, WireError> {
    let mut acc = Accumulator::default();
    let mut first = true;
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && !first => {
                return Err(WireError::MalformedVarint);
            }
            Err(e) => return Err(e.into()),
        };
        first = false;
        if let Some(v) = acc.push(byte)? {
            return Ok(v);
        }
    }
}

/// Write one varint to a stream (no flush)
pub async fn write_uvarint<W: AsyncWrite + Unpin>(writer: &mut W, v: u64) -> Result<(), WireError> {
    let mut scratch = [0u8; MAX_VARINT_LEN];
    let mut buf = &mut scratch[..];
    encode_uvarint(v, &mut buf);
    let len = MAX_VARINT_LEN - buf.len();
    writer.write_all(&scratch[..len]).await?;
    Ok(())
}
