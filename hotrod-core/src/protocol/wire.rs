//! Wire primitives: variable-length integers, arrays and strings.
//!
//! All fixed-width integers are big-endian. Variable-length integers use
//! 7-bit groups with the most significant bit as a continuation flag, low
//! group first, and are never zig-zag encoded.
//!
//! Reads run against a borrowed slice and fail with
//! [`HotRodError::Incomplete`] when the slice ends early, so a decoder can
//! be restarted from the frame start once more bytes arrive.

use bytes::{BufMut, Bytes};

use super::constants::{MAX_VINT_BYTES, MAX_VLONG_BYTES};
use crate::error::{HotRodError, Result};

/// A cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns true when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the bytes not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(HotRodError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads one unsigned byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads one byte as a boolean (any non-zero value is true).
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads an unsigned 16-bit integer.
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a signed 32-bit integer.
    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a signed 64-bit integer.
    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    fn read_varint(&mut self, max_bytes: usize) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..max_bytes {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(HotRodError::MalformedVarint { max_bytes })
    }

    /// Reads a variable-length 32-bit integer.
    pub fn read_vint(&mut self) -> Result<u32> {
        self.read_varint(MAX_VINT_BYTES).map(|v| v as u32)
    }

    /// Reads a variable-length 64-bit integer.
    pub fn read_vlong(&mut self) -> Result<u64> {
        self.read_varint(MAX_VLONG_BYTES)
    }

    /// Reads a signed variable-length integer (sign in the low bit).
    pub fn read_signed_vint(&mut self) -> Result<i32> {
        let raw = self.read_vint()?;
        if raw & 1 == 1 {
            Ok(!((raw >> 1) as i32))
        } else {
            Ok((raw >> 1) as i32)
        }
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Reads a vint length followed by that many bytes.
    pub fn read_array(&mut self) -> Result<&'a [u8]> {
        let len = self.read_vint()? as usize;
        self.take(len)
    }

    /// Reads a length-prefixed array into an owned buffer.
    pub fn read_bytes_owned(&mut self) -> Result<Bytes> {
        self.read_array().map(Bytes::copy_from_slice)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_array()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| HotRodError::InvalidResponse(format!("invalid UTF-8 string: {}", e)))
    }

    /// Reads an array whose length is a signed vint, where a negative
    /// length means absent.
    pub fn read_optional_array(&mut self) -> Result<Option<&'a [u8]>> {
        let len = self.read_signed_vint()?;
        if len < 0 {
            return Ok(None);
        }
        self.take(len as usize).map(Some)
    }
}

/// Writes a variable-length 32-bit integer.
pub fn write_vint(buf: &mut impl BufMut, value: u32) {
    write_vlong(buf, u64::from(value));
}

/// Writes a variable-length 64-bit integer.
pub fn write_vlong(buf: &mut impl BufMut, mut value: u64) {
    while value & !0x7F != 0 {
        buf.put_u8(((value & 0x7F) as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Writes a signed vint: non-negative `n` as `n << 1`, negative `n` as
/// `(!n << 1) | 1`.
pub fn write_signed_vint(buf: &mut impl BufMut, value: i32) {
    let raw = if value < 0 {
        ((!value as u32) << 1) | 1
    } else {
        (value as u32) << 1
    };
    write_vint(buf, raw);
}

/// Writes a vint length followed by the bytes.
pub fn write_array(buf: &mut impl BufMut, bytes: &[u8]) {
    write_vint(buf, bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut impl BufMut, value: &str) {
    write_array(buf, value.as_bytes());
}

/// Writes an array with a signed vint length, `-1` when absent.
pub fn write_optional_array(buf: &mut impl BufMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            write_signed_vint(buf, bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => write_signed_vint(buf, -1),
    }
}

/// Writes a string with a signed vint length, `-1` when absent.
pub fn write_optional_string(buf: &mut impl BufMut, value: Option<&str>) {
    write_optional_array(buf, value.map(str::as_bytes));
}

/// Returns the encoded size of a vint.
pub fn vint_size(value: u32) -> usize {
    vlong_size(u64::from(value))
}

/// Returns the encoded size of a vlong.
pub fn vlong_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Returns the encoded size of a length-prefixed array.
pub fn array_size(len: usize) -> usize {
    vint_size(len as u32) + len
}

/// Formats at most `limit` bytes of `buf` as hex for diagnostics.
pub fn limited_hex_dump(buf: &[u8], limit: usize) -> String {
    let shown = &buf[..buf.len().min(limit)];
    let mut out: String = shown.iter().map(|b| format!("{:02x}", b)).collect();
    if buf.len() > limit {
        out.push_str("...");
    }
    out
}
