//! Field-level encoders for the two update wire formats.
//!
//! Blocks, delete sets and state vectors are written through the
//! [`Encoder`] trait so the same serialization code produces either format:
//!
//! - [`EncoderV1`] writes every field inline with var-ints and strings.
//! - [`EncoderV2`] routes the repetitive fields (clients, clocks, info
//!   bytes, lengths, strings) into separate compressed columns and keeps
//!   everything else in a trailing "rest" buffer.

use std::sync::Arc;

use crate::any::Any;
use crate::encoding::rle::{
    IntDiffOptRleDecoder, IntDiffOptRleEncoder, RleDecoder, RleEncoder, StringDecoder,
    StringEncoder, UintOptRleDecoder, UintOptRleEncoder,
};
use crate::encoding::{Cursor, Write};
use crate::error::{Error, Result};
use crate::id::{ClientId, Clock, Id};

/// Which wire format an update uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Version {
    V1,
    V2,
}

// =============================================================================
// Encoders
// =============================================================================

pub trait Encoder {
    /// Reset the running clock of the delete-set encoder (once per client).
    fn reset_ds_cur_val(&mut self);
    fn write_ds_clock(&mut self, clock: Clock);
    fn write_ds_len(&mut self, len: Clock);

    fn write_left_id(&mut self, id: &Id);
    fn write_right_id(&mut self, id: &Id);
    fn write_client(&mut self, client: ClientId);
    fn write_info(&mut self, info: u8);
    fn write_parent_info(&mut self, is_root_key: bool);
    fn write_type_ref(&mut self, type_ref: u8);
    fn write_len(&mut self, len: u32);
    fn write_string(&mut self, value: &str);
    fn write_key(&mut self, key: &str);
    fn write_any(&mut self, value: &Any);
    fn write_buf(&mut self, buf: &[u8]);
    fn write_json(&mut self, value: &Any);

    /// Write a var-int into the unstructured rest buffer.
    fn write_var(&mut self, value: u64);
    /// Append raw bytes to the rest buffer.
    fn write_raw(&mut self, buf: &[u8]);
    /// Detach the rest buffer written so far, leaving an empty one behind.
    fn take_rest(&mut self) -> Vec<u8>;

    fn finish(self) -> Vec<u8>;
}

#[derive(Debug, Default)]
pub struct EncoderV1 {
    buf: Vec<u8>,
}

impl EncoderV1 {
    pub fn new() -> EncoderV1 {
        return EncoderV1::default();
    }
}

impl Encoder for EncoderV1 {
    fn reset_ds_cur_val(&mut self) {}

    fn write_ds_clock(&mut self, clock: Clock) {
        self.buf.write_var(clock as u64);
    }

    fn write_ds_len(&mut self, len: Clock) {
        self.buf.write_var(len as u64);
    }

    fn write_left_id(&mut self, id: &Id) {
        self.buf.write_var(id.client);
        self.buf.write_var(id.clock as u64);
    }

    fn write_right_id(&mut self, id: &Id) {
        self.buf.write_var(id.client);
        self.buf.write_var(id.clock as u64);
    }

    fn write_client(&mut self, client: ClientId) {
        self.buf.write_var(client);
    }

    fn write_info(&mut self, info: u8) {
        self.buf.write_u8(info);
    }

    fn write_parent_info(&mut self, is_root_key: bool) {
        self.buf.write_var(if is_root_key { 1 } else { 0 });
    }

    fn write_type_ref(&mut self, type_ref: u8) {
        self.buf.write_var(type_ref as u64);
    }

    fn write_len(&mut self, len: u32) {
        self.buf.write_var(len as u64);
    }

    fn write_string(&mut self, value: &str) {
        self.buf.write_string(value);
    }

    fn write_key(&mut self, key: &str) {
        self.buf.write_string(key);
    }

    fn write_any(&mut self, value: &Any) {
        value.encode(&mut self.buf);
    }

    fn write_buf(&mut self, buf: &[u8]) {
        self.buf.write_buf(buf);
    }

    fn write_json(&mut self, value: &Any) {
        let json = match value {
            Any::Undefined => String::from("undefined"),
            other => other.to_json_string(),
        };
        self.buf.write_string(&json);
    }

    fn write_var(&mut self, value: u64) {
        self.buf.write_var(value);
    }

    fn write_raw(&mut self, buf: &[u8]) {
        self.buf.write_all(buf);
    }

    fn take_rest(&mut self) -> Vec<u8> {
        return std::mem::take(&mut self.buf);
    }

    fn finish(self) -> Vec<u8> {
        return self.buf;
    }
}

#[derive(Debug, Default)]
pub struct EncoderV2 {
    rest: Vec<u8>,
    ds_cur_val: Clock,
    key_clock: IntDiffOptRleEncoder,
    next_key_clock: u32,
    client: UintOptRleEncoder,
    left_clock: IntDiffOptRleEncoder,
    right_clock: IntDiffOptRleEncoder,
    info: RleEncoder,
    string: StringEncoder,
    parent_info: RleEncoder,
    type_ref: UintOptRleEncoder,
    len: UintOptRleEncoder,
}

impl EncoderV2 {
    pub fn new() -> EncoderV2 {
        return EncoderV2::default();
    }
}

impl Encoder for EncoderV2 {
    fn reset_ds_cur_val(&mut self) {
        self.ds_cur_val = 0;
    }

    fn write_ds_clock(&mut self, clock: Clock) {
        let diff = clock - self.ds_cur_val;
        self.ds_cur_val = clock;
        self.rest.write_var(diff as u64);
    }

    fn write_ds_len(&mut self, len: Clock) {
        assert!(len > 0, "delete set range of length zero");
        self.rest.write_var((len - 1) as u64);
        self.ds_cur_val += len;
    }

    fn write_left_id(&mut self, id: &Id) {
        self.client.write(id.client);
        self.left_clock.write(id.clock);
    }

    fn write_right_id(&mut self, id: &Id) {
        self.client.write(id.client);
        self.right_clock.write(id.clock);
    }

    fn write_client(&mut self, client: ClientId) {
        self.client.write(client);
    }

    fn write_info(&mut self, info: u8) {
        self.info.write(info);
    }

    fn write_parent_info(&mut self, is_root_key: bool) {
        self.parent_info.write(if is_root_key { 1 } else { 0 });
    }

    fn write_type_ref(&mut self, type_ref: u8) {
        self.type_ref.write(type_ref as u64);
    }

    fn write_len(&mut self, len: u32) {
        self.len.write(len as u64);
    }

    fn write_string(&mut self, value: &str) {
        self.string.write(value);
    }

    fn write_key(&mut self, key: &str) {
        // Keys are never interned on write: older readers expect every key
        // in the string column. The decoder still resolves interned keys.
        self.key_clock.write(self.next_key_clock);
        self.next_key_clock += 1;
        self.string.write(key);
    }

    fn write_any(&mut self, value: &Any) {
        value.encode(&mut self.rest);
    }

    fn write_buf(&mut self, buf: &[u8]) {
        self.rest.write_buf(buf);
    }

    fn write_json(&mut self, value: &Any) {
        value.encode(&mut self.rest);
    }

    fn write_var(&mut self, value: u64) {
        self.rest.write_var(value);
    }

    fn write_raw(&mut self, buf: &[u8]) {
        self.rest.write_all(buf);
    }

    fn take_rest(&mut self) -> Vec<u8> {
        return std::mem::take(&mut self.rest);
    }

    fn finish(self) -> Vec<u8> {
        let mut buf = Vec::new();
        // feature flag, reserved
        buf.write_var(0);
        buf.write_buf(&self.key_clock.finish());
        buf.write_buf(&self.client.finish());
        buf.write_buf(&self.left_clock.finish());
        buf.write_buf(&self.right_clock.finish());
        buf.write_buf(&self.info.finish());
        buf.write_buf(&self.string.finish());
        buf.write_buf(&self.parent_info.finish());
        buf.write_buf(&self.type_ref.finish());
        buf.write_buf(&self.len.finish());
        buf.write_all(&self.rest);
        return buf;
    }
}

// =============================================================================
// Decoders
// =============================================================================

pub trait Decoder<'a> {
    fn reset_ds_cur_val(&mut self);
    fn read_ds_clock(&mut self) -> Result<Clock>;
    fn read_ds_len(&mut self) -> Result<Clock>;

    fn read_left_id(&mut self) -> Result<Id>;
    fn read_right_id(&mut self) -> Result<Id>;
    fn read_client(&mut self) -> Result<ClientId>;
    fn read_info(&mut self) -> Result<u8>;
    fn read_parent_info(&mut self) -> Result<bool>;
    fn read_type_ref(&mut self) -> Result<u8>;
    fn read_len(&mut self) -> Result<u32>;
    fn read_string(&mut self) -> Result<Arc<str>>;
    fn read_key(&mut self) -> Result<Arc<str>>;
    fn read_any(&mut self) -> Result<Any>;
    fn read_buf(&mut self) -> Result<&'a [u8]>;
    fn read_json(&mut self) -> Result<Any>;

    /// Read a var-int from the rest buffer.
    fn read_var(&mut self) -> Result<u64>;
    fn read_var_u32(&mut self) -> Result<u32> {
        let value = self.read_var()?;
        return u32::try_from(value).map_err(|_| Error::VarIntOverflow);
    }
    /// Check if the rest buffer has unread bytes.
    fn has_content(&self) -> bool;
}

#[derive(Debug)]
pub struct DecoderV1<'a> {
    cursor: Cursor<'a>,
}

impl<'a> DecoderV1<'a> {
    pub fn new(buf: &'a [u8]) -> DecoderV1<'a> {
        return DecoderV1 {
            cursor: Cursor::new(buf),
        };
    }

    fn read_id(&mut self) -> Result<Id> {
        let client = self.cursor.read_var()?;
        let clock = self.cursor.read_var_u32()?;
        return Ok(Id::new(client, clock));
    }
}

impl<'a> Decoder<'a> for DecoderV1<'a> {
    fn reset_ds_cur_val(&mut self) {}

    fn read_ds_clock(&mut self) -> Result<Clock> {
        return self.cursor.read_var_u32();
    }

    fn read_ds_len(&mut self) -> Result<Clock> {
        return self.cursor.read_var_u32();
    }

    fn read_left_id(&mut self) -> Result<Id> {
        return self.read_id();
    }

    fn read_right_id(&mut self) -> Result<Id> {
        return self.read_id();
    }

    fn read_client(&mut self) -> Result<ClientId> {
        return self.cursor.read_var();
    }

    fn read_info(&mut self) -> Result<u8> {
        return self.cursor.read_u8();
    }

    fn read_parent_info(&mut self) -> Result<bool> {
        return Ok(self.cursor.read_var()? == 1);
    }

    fn read_type_ref(&mut self) -> Result<u8> {
        let value = self.cursor.read_var()?;
        return u8::try_from(value).map_err(|_| Error::UnknownTypeRef(u8::MAX));
    }

    fn read_len(&mut self) -> Result<u32> {
        return self.cursor.read_var_u32();
    }

    fn read_string(&mut self) -> Result<Arc<str>> {
        return Ok(Arc::from(self.cursor.read_string()?));
    }

    fn read_key(&mut self) -> Result<Arc<str>> {
        return self.read_string();
    }

    fn read_any(&mut self) -> Result<Any> {
        return Any::decode(&mut self.cursor);
    }

    fn read_buf(&mut self) -> Result<&'a [u8]> {
        return self.cursor.read_buf();
    }

    fn read_json(&mut self) -> Result<Any> {
        let src = self.cursor.read_string()?;
        return Any::from_json_str(src);
    }

    fn read_var(&mut self) -> Result<u64> {
        return self.cursor.read_var();
    }

    fn has_content(&self) -> bool {
        return self.cursor.has_content();
    }
}

#[derive(Debug)]
pub struct DecoderV2<'a> {
    rest: Cursor<'a>,
    ds_cur_val: Clock,
    keys: Vec<Arc<str>>,
    key_clock: IntDiffOptRleDecoder<'a>,
    client: UintOptRleDecoder<'a>,
    left_clock: IntDiffOptRleDecoder<'a>,
    right_clock: IntDiffOptRleDecoder<'a>,
    info: RleDecoder<'a>,
    string: StringDecoder<'a>,
    parent_info: RleDecoder<'a>,
    type_ref: UintOptRleDecoder<'a>,
    len: UintOptRleDecoder<'a>,
}

impl<'a> DecoderV2<'a> {
    pub fn new(buf: &'a [u8]) -> Result<DecoderV2<'a>> {
        let mut cursor = Cursor::new(buf);
        let feature = cursor.read_var()?;
        if feature != 0 {
            return Err(Error::UnsupportedFeature(feature));
        }
        let key_clock = IntDiffOptRleDecoder::new(cursor.read_buf()?);
        let client = UintOptRleDecoder::new(cursor.read_buf()?);
        let left_clock = IntDiffOptRleDecoder::new(cursor.read_buf()?);
        let right_clock = IntDiffOptRleDecoder::new(cursor.read_buf()?);
        let info = RleDecoder::new(cursor.read_buf()?);
        let string = StringDecoder::new(cursor.read_buf()?)?;
        let parent_info = RleDecoder::new(cursor.read_buf()?);
        let type_ref = UintOptRleDecoder::new(cursor.read_buf()?);
        let len = UintOptRleDecoder::new(cursor.read_buf()?);
        return Ok(DecoderV2 {
            rest: cursor,
            ds_cur_val: 0,
            keys: Vec::new(),
            key_clock,
            client,
            left_clock,
            right_clock,
            info,
            string,
            parent_info,
            type_ref,
            len,
        });
    }
}

impl<'a> Decoder<'a> for DecoderV2<'a> {
    fn reset_ds_cur_val(&mut self) {
        self.ds_cur_val = 0;
    }

    fn read_ds_clock(&mut self) -> Result<Clock> {
        let diff = self.rest.read_var_u32()?;
        self.ds_cur_val = self
            .ds_cur_val
            .checked_add(diff)
            .ok_or(Error::VarIntOverflow)?;
        return Ok(self.ds_cur_val);
    }

    fn read_ds_len(&mut self) -> Result<Clock> {
        let len = self
            .rest
            .read_var_u32()?
            .checked_add(1)
            .ok_or(Error::VarIntOverflow)?;
        self.ds_cur_val = self
            .ds_cur_val
            .checked_add(len)
            .ok_or(Error::VarIntOverflow)?;
        return Ok(len);
    }

    fn read_left_id(&mut self) -> Result<Id> {
        let client = self.client.read()?;
        let clock = self.left_clock.read()?;
        return Ok(Id::new(client, clock));
    }

    fn read_right_id(&mut self) -> Result<Id> {
        let client = self.client.read()?;
        let clock = self.right_clock.read()?;
        return Ok(Id::new(client, clock));
    }

    fn read_client(&mut self) -> Result<ClientId> {
        return self.client.read();
    }

    fn read_info(&mut self) -> Result<u8> {
        return self.info.read();
    }

    fn read_parent_info(&mut self) -> Result<bool> {
        return Ok(self.parent_info.read()? == 1);
    }

    fn read_type_ref(&mut self) -> Result<u8> {
        let value = self.type_ref.read()?;
        return u8::try_from(value).map_err(|_| Error::UnknownTypeRef(u8::MAX));
    }

    fn read_len(&mut self) -> Result<u32> {
        return self.len.read_u32();
    }

    fn read_string(&mut self) -> Result<Arc<str>> {
        return Ok(Arc::from(self.string.read()?));
    }

    fn read_key(&mut self) -> Result<Arc<str>> {
        let key_clock = self.key_clock.read()? as usize;
        if let Some(key) = self.keys.get(key_clock) {
            return Ok(key.clone());
        }
        let key: Arc<str> = Arc::from(self.string.read()?);
        self.keys.push(key.clone());
        return Ok(key);
    }

    fn read_any(&mut self) -> Result<Any> {
        return Any::decode(&mut self.rest);
    }

    fn read_buf(&mut self) -> Result<&'a [u8]> {
        return self.rest.read_buf();
    }

    fn read_json(&mut self) -> Result<Any> {
        return Any::decode(&mut self.rest);
    }

    fn read_var(&mut self) -> Result<u64> {
        return self.rest.read_var();
    }

    fn has_content(&self) -> bool {
        return self.rest.has_content();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fields<E: Encoder>(encoder: &mut E) {
        encoder.write_info(0x84);
        encoder.write_left_id(&Id::new(3, 10));
        encoder.write_right_id(&Id::new(3, 12));
        encoder.write_parent_info(true);
        encoder.write_string("root");
        encoder.write_key("bold");
        encoder.write_json(&Any::Bool(true));
        encoder.write_len(4);
        encoder.write_var(99);
    }

    fn read_fields<'a, D: Decoder<'a>>(decoder: &mut D) {
        assert_eq!(decoder.read_info().unwrap(), 0x84);
        assert_eq!(decoder.read_left_id().unwrap(), Id::new(3, 10));
        assert_eq!(decoder.read_right_id().unwrap(), Id::new(3, 12));
        assert!(decoder.read_parent_info().unwrap());
        assert_eq!(&*decoder.read_string().unwrap(), "root");
        assert_eq!(&*decoder.read_key().unwrap(), "bold");
        assert_eq!(decoder.read_json().unwrap(), Any::Bool(true));
        assert_eq!(decoder.read_len().unwrap(), 4);
        assert_eq!(decoder.read_var().unwrap(), 99);
    }

    #[test]
    fn v1_fields() {
        let mut encoder = EncoderV1::new();
        write_fields(&mut encoder);
        let buf = encoder.finish();
        read_fields(&mut DecoderV1::new(&buf));
    }

    #[test]
    fn v2_fields() {
        let mut encoder = EncoderV2::new();
        write_fields(&mut encoder);
        let buf = encoder.finish();
        read_fields(&mut DecoderV2::new(&buf).unwrap());
    }

    #[test]
    fn v2_delete_set_clocks_are_relative() {
        let mut encoder = EncoderV2::new();
        encoder.reset_ds_cur_val();
        encoder.write_ds_clock(5);
        encoder.write_ds_len(3);
        encoder.write_ds_clock(10);
        encoder.write_ds_len(1);
        let buf = encoder.finish();

        let mut decoder = DecoderV2::new(&buf).unwrap();
        decoder.reset_ds_cur_val();
        assert_eq!(decoder.read_ds_clock().unwrap(), 5);
        assert_eq!(decoder.read_ds_len().unwrap(), 3);
        assert_eq!(decoder.read_ds_clock().unwrap(), 10);
        assert_eq!(decoder.read_ds_len().unwrap(), 1);
    }

    #[test]
    fn v2_rejects_unknown_feature_flag() {
        let buf = [1u8];
        assert!(matches!(
            DecoderV2::new(&buf),
            Err(Error::UnsupportedFeature(1))
        ));
    }
}
