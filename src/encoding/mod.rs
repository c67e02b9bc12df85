//! Byte-level codec primitives shared by every wire format.
//!
//! Integers are written as variable-length quantities: seven payload bits
//! per byte, high bit set while more bytes follow. Signed integers reserve
//! the second-highest bit of the first byte for the sign, which makes a
//! "negative zero" representable; the run-length encoders in [`rle`] use
//! that to flag a following repeat count.
//!
//! Fixed-width numbers are big-endian.

pub mod codec;
pub mod rle;

use crate::error::{Error, Result};

/// Extension methods for writing primitives into a byte buffer.
pub trait Write {
    /// Append a single byte.
    fn write_u8(&mut self, value: u8);

    /// Append raw bytes with no length prefix.
    fn write_all(&mut self, buf: &[u8]);

    /// Append an unsigned variable-length integer.
    fn write_var(&mut self, mut value: u64) {
        while value > 0x7f {
            self.write_u8(0x80 | (value & 0x7f) as u8);
            value >>= 7;
        }
        self.write_u8(value as u8);
    }

    /// Append a signed variable-length integer given as sign and magnitude.
    ///
    /// Keeping the sign separate allows writing `-0`.
    fn write_var_signed(&mut self, magnitude: u64, negative: bool) {
        let mut value = magnitude;
        let first = (if value > 0x3f { 0x80 } else { 0 })
            | (if negative { 0x40 } else { 0 })
            | (value & 0x3f) as u8;
        self.write_u8(first);
        value >>= 6;
        while value > 0 {
            let next = (if value > 0x7f { 0x80 } else { 0 }) | (value & 0x7f) as u8;
            self.write_u8(next);
            value >>= 7;
        }
    }

    /// Append a signed variable-length integer.
    fn write_var_i64(&mut self, value: i64) {
        self.write_var_signed(value.unsigned_abs(), value < 0);
    }

    /// Append a length-prefixed byte buffer.
    fn write_buf(&mut self, buf: &[u8]) {
        self.write_var(buf.len() as u64);
        self.write_all(buf);
    }

    /// Append a length-prefixed UTF-8 string.
    fn write_string(&mut self, value: &str) {
        self.write_buf(value.as_bytes());
    }

    fn write_f32(&mut self, value: f32) {
        self.write_all(&value.to_be_bytes());
    }

    fn write_f64(&mut self, value: f64) {
        self.write_all(&value.to_be_bytes());
    }

    fn write_i64(&mut self, value: i64) {
        self.write_all(&value.to_be_bytes());
    }
}

impl Write for Vec<u8> {
    #[inline]
    fn write_u8(&mut self, value: u8) {
        self.push(value);
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) {
        self.extend_from_slice(buf);
    }
}

/// A signed integer decoded together with its sign bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signed {
    pub magnitude: u64,
    pub negative: bool,
}

impl Signed {
    /// The value as a regular integer (`-0` collapses to `0`).
    pub fn value(&self) -> i64 {
        let magnitude = self.magnitude as i64;
        if self.negative {
            return -magnitude;
        }
        return magnitude;
    }
}

/// A read position over a borrowed byte buffer.
#[derive(Clone, Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    next: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        return Cursor { buf, next: 0 };
    }

    /// Check if unread bytes remain.
    #[inline]
    pub fn has_content(&self) -> bool {
        return self.next < self.buf.len();
    }

    /// The unread suffix of the buffer.
    pub fn remaining(&self) -> &'a [u8] {
        return &self.buf[self.next..];
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let value = *self.buf.get(self.next).ok_or(Error::EndOfBuffer)?;
        self.next += 1;
        return Ok(value);
    }

    /// Read `len` raw bytes.
    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.next.checked_add(len).ok_or(Error::EndOfBuffer)?;
        if end > self.buf.len() {
            return Err(Error::EndOfBuffer);
        }
        let slice = &self.buf[self.next..end];
        self.next = end;
        return Ok(slice);
    }

    pub fn read_var(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(Error::VarIntOverflow);
            }
            value |= ((byte & 0x7f) as u64) << shift;
            if byte < 0x80 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read an unsigned integer that must fit into 32 bits.
    pub fn read_var_u32(&mut self) -> Result<u32> {
        let value = self.read_var()?;
        return u32::try_from(value).map_err(|_| Error::VarIntOverflow);
    }

    pub fn read_var_signed(&mut self) -> Result<Signed> {
        let first = self.read_u8()?;
        let negative = first & 0x40 != 0;
        let mut magnitude = (first & 0x3f) as u64;
        if first & 0x80 == 0 {
            return Ok(Signed { magnitude, negative });
        }
        let mut shift = 6u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(Error::VarIntOverflow);
            }
            magnitude |= ((byte & 0x7f) as u64) << shift;
            if byte < 0x80 {
                return Ok(Signed { magnitude, negative });
            }
            shift += 7;
        }
    }

    /// Read a length-prefixed byte buffer.
    pub fn read_buf(&mut self) -> Result<&'a [u8]> {
        let len = self.read_var()? as usize;
        return self.read_exact(len);
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str> {
        let bytes = self.read_buf()?;
        return std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8);
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let bytes = self.read_exact(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        return Ok(f32::from_be_bytes(raw));
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.read_exact(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        return Ok(f64::from_be_bytes(raw));
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.read_exact(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        return Ok(i64::from_be_bytes(raw));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_uint_layout() {
        let mut buf = Vec::new();
        buf.write_var(127);
        buf.write_var(128);
        buf.write_var(300);
        assert_eq!(buf, vec![0x7f, 0x80, 0x01, 0xac, 0x02]);

        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.read_var().unwrap(), 127);
        assert_eq!(cursor.read_var().unwrap(), 128);
        assert_eq!(cursor.read_var().unwrap(), 300);
        assert!(!cursor.has_content());
    }

    #[test]
    fn var_int_keeps_negative_zero() {
        let mut buf = Vec::new();
        buf.write_var_signed(0, true);
        buf.write_var_i64(-100);
        buf.write_var_i64(63);
        buf.write_var_i64(64);

        let mut cursor = Cursor::new(&buf);
        let zero = cursor.read_var_signed().unwrap();
        assert!(zero.negative);
        assert_eq!(zero.value(), 0);
        assert_eq!(cursor.read_var_signed().unwrap().value(), -100);
        assert_eq!(cursor.read_var_signed().unwrap().value(), 63);
        assert_eq!(cursor.read_var_signed().unwrap().value(), 64);
    }

    #[test]
    fn overlong_var_int_is_rejected() {
        let buf = [0xffu8; 11];
        let mut cursor = Cursor::new(&buf);
        assert!(matches!(cursor.read_var(), Err(Error::VarIntOverflow)));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let mut buf = Vec::new();
        buf.write_string("hello");
        buf.truncate(3);
        let mut cursor = Cursor::new(&buf);
        assert!(matches!(cursor.read_string(), Err(Error::EndOfBuffer)));
    }

    #[test]
    fn u32_overflow_is_rejected() {
        let mut buf = Vec::new();
        buf.write_var(u32::MAX as u64 + 1);
        let mut cursor = Cursor::new(&buf);
        assert!(matches!(cursor.read_var_u32(), Err(Error::VarIntOverflow)));
    }
}
