//! Column encoders used by the compressed (v2) update format.
//!
//! Every column is encoded independently and most of them are dominated by
//! runs: the same client id many times in a row, clocks that grow by one,
//! the same info byte for every character of a text. Each encoder here
//! compresses one of those patterns.

use crate::encoding::{Cursor, Write};
use crate::error::{Error, Result};

// =============================================================================
// Plain run-length encoding of bytes
// =============================================================================

/// Run-length encoder for single bytes: `value, count - 1, value, ...`.
///
/// The count of the final run is omitted; the decoder repeats the last
/// value forever once its input is exhausted.
#[derive(Debug, Default)]
pub struct RleEncoder {
    buf: Vec<u8>,
    last: Option<u8>,
    count: u64,
}

impl RleEncoder {
    pub fn new() -> RleEncoder {
        return RleEncoder::default();
    }

    pub fn write(&mut self, value: u8) {
        if self.last == Some(value) {
            self.count += 1;
            return;
        }
        if self.count > 0 {
            self.buf.write_var(self.count - 1);
        }
        self.count = 1;
        self.buf.write_u8(value);
        self.last = Some(value);
    }

    pub fn finish(self) -> Vec<u8> {
        return self.buf;
    }
}

#[derive(Debug)]
pub struct RleDecoder<'a> {
    cursor: Cursor<'a>,
    last: u8,
    /// Remaining repeats of `last`; `None` means unbounded.
    count: Option<u64>,
}

impl<'a> RleDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> RleDecoder<'a> {
        return RleDecoder {
            cursor: Cursor::new(buf),
            last: 0,
            count: Some(0),
        };
    }

    pub fn read(&mut self) -> Result<u8> {
        if self.count == Some(0) {
            self.last = self.cursor.read_u8()?;
            self.count = if self.cursor.has_content() {
                Some(self.cursor.read_var()? + 1)
            } else {
                None
            };
        }
        if let Some(count) = self.count.as_mut() {
            *count -= 1;
        }
        return Ok(self.last);
    }
}

// =============================================================================
// Unsigned integers with optional run length
// =============================================================================

/// Encodes unsigned integers. A run of length one is written as the plain
/// value; longer runs flip the sign bit (so `-0` is meaningful) and append
/// `count - 2`.
#[derive(Debug, Default)]
pub struct UintOptRleEncoder {
    buf: Vec<u8>,
    last: u64,
    count: u64,
}

impl UintOptRleEncoder {
    pub fn new() -> UintOptRleEncoder {
        return UintOptRleEncoder::default();
    }

    pub fn write(&mut self, value: u64) {
        if self.count > 0 && self.last == value {
            self.count += 1;
            return;
        }
        self.flush();
        self.count = 1;
        self.last = value;
    }

    fn flush(&mut self) {
        if self.count == 0 {
            return;
        }
        self.buf.write_var_signed(self.last, self.count > 1);
        if self.count > 1 {
            self.buf.write_var(self.count - 2);
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.flush();
        return self.buf;
    }
}

#[derive(Debug)]
pub struct UintOptRleDecoder<'a> {
    cursor: Cursor<'a>,
    last: u64,
    count: u64,
}

impl<'a> UintOptRleDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> UintOptRleDecoder<'a> {
        return UintOptRleDecoder {
            cursor: Cursor::new(buf),
            last: 0,
            count: 0,
        };
    }

    pub fn read(&mut self) -> Result<u64> {
        if self.count == 0 {
            let signed = self.cursor.read_var_signed()?;
            self.last = signed.magnitude;
            self.count = 1;
            if signed.negative {
                self.count = self.cursor.read_var()? + 2;
            }
        }
        self.count -= 1;
        return Ok(self.last);
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.read()?;
        return u32::try_from(value).map_err(|_| Error::VarIntOverflow);
    }
}

// =============================================================================
// Integer differences with optional run length
// =============================================================================

/// Encodes a sequence by the difference to its predecessor. Runs of the same
/// difference (clocks growing by one) collapse into a single entry. The
/// lowest bit of the written difference flags a following run length.
#[derive(Debug, Default)]
pub struct IntDiffOptRleEncoder {
    buf: Vec<u8>,
    last: i64,
    diff: i64,
    count: u64,
}

impl IntDiffOptRleEncoder {
    pub fn new() -> IntDiffOptRleEncoder {
        return IntDiffOptRleEncoder::default();
    }

    pub fn write(&mut self, value: u32) {
        let value = value as i64;
        if self.count > 0 && self.diff == value - self.last {
            self.last = value;
            self.count += 1;
            return;
        }
        self.flush();
        self.count = 1;
        self.diff = value - self.last;
        self.last = value;
    }

    fn flush(&mut self) {
        if self.count == 0 {
            return;
        }
        let encoded = self.diff * 2 + if self.count == 1 { 0 } else { 1 };
        self.buf.write_var_i64(encoded);
        if self.count > 1 {
            self.buf.write_var(self.count - 2);
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.flush();
        return self.buf;
    }
}

#[derive(Debug)]
pub struct IntDiffOptRleDecoder<'a> {
    cursor: Cursor<'a>,
    last: i64,
    diff: i64,
    count: u64,
}

impl<'a> IntDiffOptRleDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> IntDiffOptRleDecoder<'a> {
        return IntDiffOptRleDecoder {
            cursor: Cursor::new(buf),
            last: 0,
            diff: 0,
            count: 0,
        };
    }

    pub fn read(&mut self) -> Result<u32> {
        if self.count == 0 {
            let encoded = self.cursor.read_var_signed()?.value();
            self.diff = encoded >> 1;
            self.count = 1;
            if encoded & 1 != 0 {
                self.count = self.cursor.read_var()? + 2;
            }
        }
        self.last += self.diff;
        self.count -= 1;
        return u32::try_from(self.last).map_err(|_| Error::VarIntOverflow);
    }
}

// =============================================================================
// Strings
// =============================================================================

/// Concatenates all strings into one and stores their lengths (in UTF-16
/// code units) in a separate run-length column.
#[derive(Debug, Default)]
pub struct StringEncoder {
    text: String,
    lens: UintOptRleEncoder,
}

impl StringEncoder {
    pub fn new() -> StringEncoder {
        return StringEncoder::default();
    }

    pub fn write(&mut self, value: &str) {
        self.text.push_str(value);
        self.lens.write(value.encode_utf16().count() as u64);
    }

    pub fn finish(self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_string(&self.text);
        buf.write_all(&self.lens.finish());
        return buf;
    }
}

#[derive(Debug)]
pub struct StringDecoder<'a> {
    text: &'a str,
    /// Byte offset of the next unread string in `text`.
    pos: usize,
    lens: UintOptRleDecoder<'a>,
}

impl<'a> StringDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<StringDecoder<'a>> {
        let mut cursor = Cursor::new(buf);
        let text = cursor.read_string()?;
        return Ok(StringDecoder {
            text,
            pos: 0,
            lens: UintOptRleDecoder::new(cursor.remaining()),
        });
    }

    pub fn read(&mut self) -> Result<&'a str> {
        let mut remaining = self.lens.read()? as usize;
        let rest = &self.text[self.pos..];
        let mut end = 0;
        for c in rest.chars() {
            if remaining == 0 {
                break;
            }
            remaining = remaining.saturating_sub(c.len_utf16());
            end += c.len_utf8();
        }
        if remaining > 0 {
            return Err(Error::EndOfBuffer);
        }
        let value = &rest[..end];
        self.pos += end;
        return Ok(value);
    }
}
