//! Payloads carried by items.
//!
//! The closed [`ItemContent`] enum replaces an open hierarchy of content
//! classes. Every variant knows its length, whether it counts towards the
//! length of its parent, how to split at an offset, how to absorb an
//! adjacent payload of the same kind, and its wire form.

use std::sync::Arc;

use crate::any::Any;
use crate::branch::{BranchId, TypeRef};
use crate::encoding::codec::{Decoder, Encoder};
use crate::error::{Error, Result};

/// Content reference numbers stored in the low five bits of the info byte.
pub const REF_GC: u8 = 0;
pub const REF_DELETED: u8 = 1;
pub const REF_JSON: u8 = 2;
pub const REF_BINARY: u8 = 3;
pub const REF_STRING: u8 = 4;
pub const REF_EMBED: u8 = 5;
pub const REF_FORMAT: u8 = 6;
pub const REF_TYPE: u8 = 7;
pub const REF_ANY: u8 = 8;
pub const REF_DOC: u8 = 9;
pub const REF_SKIP: u8 = 10;

#[derive(Clone, Debug, PartialEq)]
pub enum ItemContent {
    /// One or more plain values (array elements or a single map value).
    Any(Vec<Any>),
    /// An opaque byte blob.
    Binary(Arc<[u8]>),
    /// Placeholder left behind after the payload was garbage-collected.
    Deleted(u32),
    /// A reference to a nested document.
    Doc(SubdocRef),
    /// Legacy JSON values, kept for decoding older updates.
    Json(Vec<Any>),
    /// A single embedded object inside text.
    Embed(Any),
    /// A formatting boundary inside text. Not countable.
    Format(Arc<str>, Any),
    /// Text, measured in UTF-16 code units.
    String(SplittableString),
    /// A nested shared type.
    Type(TypeContent),
}

impl ItemContent {
    pub fn get_ref(&self) -> u8 {
        match self {
            ItemContent::Any(_) => REF_ANY,
            ItemContent::Binary(_) => REF_BINARY,
            ItemContent::Deleted(_) => REF_DELETED,
            ItemContent::Doc(_) => REF_DOC,
            ItemContent::Json(_) => REF_JSON,
            ItemContent::Embed(_) => REF_EMBED,
            ItemContent::Format(_, _) => REF_FORMAT,
            ItemContent::String(_) => REF_STRING,
            ItemContent::Type(_) => REF_TYPE,
        }
    }

    /// Number of clock units this content occupies.
    pub fn len(&self) -> u32 {
        match self {
            ItemContent::Any(values) | ItemContent::Json(values) => values.len() as u32,
            ItemContent::Deleted(len) => *len,
            ItemContent::String(s) => s.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Whether this content contributes to the length of its parent.
    pub fn is_countable(&self) -> bool {
        return !matches!(self, ItemContent::Deleted(_) | ItemContent::Format(_, _));
    }

    /// Split at `offset`, keeping the left part in `self` and returning
    /// the right part.
    ///
    /// # Panics
    ///
    /// For contents with a fixed length of one, which cannot be split.
    pub fn splice(&mut self, offset: u32) -> ItemContent {
        let at = offset as usize;
        match self {
            ItemContent::Any(values) => ItemContent::Any(values.split_off(at)),
            ItemContent::Json(values) => ItemContent::Json(values.split_off(at)),
            ItemContent::Deleted(len) => {
                let right = *len - offset;
                *len = offset;
                ItemContent::Deleted(right)
            }
            ItemContent::String(s) => ItemContent::String(s.split_off(offset)),
            other => panic!("content {} cannot be split", other.get_ref()),
        }
    }

    /// Append `other` to `self` if both are of a mergeable kind.
    pub fn try_squash(&mut self, other: &ItemContent) -> bool {
        match (self, other) {
            (ItemContent::Any(a), ItemContent::Any(b)) => a.extend(b.iter().cloned()),
            (ItemContent::Json(a), ItemContent::Json(b)) => a.extend(b.iter().cloned()),
            (ItemContent::Deleted(a), ItemContent::Deleted(b)) => *a += *b,
            (ItemContent::String(a), ItemContent::String(b)) => a.push_str(b.as_str()),
            _ => return false,
        }
        return true;
    }

    /// A copy suitable for shipping in an update: nested types lose their
    /// local branch.
    pub fn detached(&self) -> ItemContent {
        match self {
            ItemContent::Type(t) => ItemContent::Type(TypeContent::new(t.type_ref.clone())),
            other => other.clone(),
        }
    }

    /// Write the content, skipping the first `offset` units.
    pub fn encode<E: Encoder>(&self, encoder: &mut E, offset: u32) {
        let skip = offset as usize;
        match self {
            ItemContent::Deleted(len) => encoder.write_len(*len - offset),
            ItemContent::Binary(buf) => encoder.write_buf(buf),
            ItemContent::String(s) => {
                if offset == 0 {
                    encoder.write_string(s.as_str());
                } else {
                    let mut copy = s.clone();
                    let right = copy.split_off(offset);
                    encoder.write_string(right.as_str());
                }
            }
            ItemContent::Embed(value) => encoder.write_json(value),
            ItemContent::Format(key, value) => {
                encoder.write_key(key);
                encoder.write_json(value);
            }
            ItemContent::Type(t) => t.type_ref.encode(encoder),
            ItemContent::Any(values) => {
                encoder.write_len((values.len() - skip) as u32);
                for value in &values[skip..] {
                    encoder.write_any(value);
                }
            }
            ItemContent::Json(values) => {
                encoder.write_len((values.len() - skip) as u32);
                for value in &values[skip..] {
                    match value {
                        Any::Undefined => encoder.write_string("undefined"),
                        other => encoder.write_string(&other.to_json_string()),
                    }
                }
            }
            ItemContent::Doc(doc) => {
                encoder.write_string(&doc.guid);
                encoder.write_any(&doc.opts);
            }
        }
    }

    pub fn decode<'a, D: Decoder<'a>>(decoder: &mut D, content_ref: u8) -> Result<ItemContent> {
        let content = match content_ref {
            REF_DELETED => ItemContent::Deleted(decoder.read_len()?),
            REF_JSON => {
                let len = decoder.read_len()? as usize;
                let mut values = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let src = decoder.read_string()?;
                    values.push(Any::from_json_str(&src)?);
                }
                ItemContent::Json(values)
            }
            REF_BINARY => ItemContent::Binary(Arc::from(decoder.read_buf()?)),
            REF_STRING => ItemContent::String(SplittableString::from(&*decoder.read_string()?)),
            REF_EMBED => ItemContent::Embed(decoder.read_json()?),
            REF_FORMAT => {
                let key = decoder.read_key()?;
                let value = decoder.read_json()?;
                ItemContent::Format(key, value)
            }
            REF_TYPE => ItemContent::Type(TypeContent::new(TypeRef::decode(decoder)?)),
            REF_ANY => {
                let len = decoder.read_len()? as usize;
                let mut values = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    values.push(decoder.read_any()?);
                }
                ItemContent::Any(values)
            }
            REF_DOC => {
                let guid = decoder.read_string()?;
                let opts = decoder.read_any()?;
                ItemContent::Doc(SubdocRef { guid, opts })
            }
            other => return Err(Error::UnknownContent(other)),
        };
        return Ok(content);
    }
}

// =============================================================================
// Nested types and documents
// =============================================================================

/// Content of an item that anchors a nested shared type.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeContent {
    pub type_ref: TypeRef,
    /// The branch created when the item was integrated into a store.
    pub branch: Option<BranchId>,
}

impl TypeContent {
    pub fn new(type_ref: TypeRef) -> TypeContent {
        return TypeContent {
            type_ref,
            branch: None,
        };
    }
}

/// Reference to a nested document: its guid plus the options it was
/// created with.
#[derive(Clone, Debug, PartialEq)]
pub struct SubdocRef {
    pub guid: Arc<str>,
    pub opts: Any,
}

impl SubdocRef {
    pub fn new(guid: impl Into<Arc<str>>) -> SubdocRef {
        return SubdocRef {
            guid: guid.into(),
            opts: Any::Map(Default::default()),
        };
    }

    fn flag(&self, name: &str) -> bool {
        match &self.opts {
            Any::Map(map) => matches!(map.get(name), Some(Any::Bool(true))),
            _ => false,
        }
    }

    /// Whether the nested document is loaded as soon as it is known.
    pub fn should_load(&self) -> bool {
        return self.flag("shouldLoad") || self.flag("autoLoad");
    }
}

// =============================================================================
// Text measured in UTF-16 code units
// =============================================================================

/// A string whose length and split offsets count UTF-16 code units, the
/// unit every peer agrees on.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SplittableString {
    text: String,
    utf16_len: u32,
}

impl SplittableString {
    pub fn as_str(&self) -> &str {
        return &self.text;
    }

    pub fn len(&self) -> u32 {
        return self.utf16_len;
    }

    pub fn is_empty(&self) -> bool {
        return self.utf16_len == 0;
    }

    pub fn push_str(&mut self, value: &str) {
        self.text.push_str(value);
        self.utf16_len += utf16_len(value);
    }

    /// Split at a UTF-16 offset. A surrogate pair cut in half becomes a
    /// replacement character on each side, so both halves stay valid and
    /// keep their lengths.
    pub fn split_off(&mut self, offset: u32) -> SplittableString {
        let mut units = 0u32;
        let mut cut = None;
        for (idx, c) in self.text.char_indices() {
            if units == offset {
                cut = Some((idx, idx, false));
                break;
            }
            let width = c.len_utf16() as u32;
            if units + width > offset {
                cut = Some((idx, idx + c.len_utf8(), true));
                break;
            }
            units += width;
        }
        let Some((left_end, right_start, broken)) = cut else {
            return SplittableString::default();
        };
        let mut right = String::new();
        if broken {
            right.push('\u{FFFD}');
        }
        right.push_str(&self.text[right_start..]);
        self.text.truncate(left_end);
        if broken {
            self.text.push('\u{FFFD}');
        }
        self.utf16_len = offset;
        return SplittableString::from(right.as_str());
    }
}

impl From<&str> for SplittableString {
    fn from(value: &str) -> SplittableString {
        return SplittableString {
            text: value.to_owned(),
            utf16_len: utf16_len(value),
        };
    }
}

/// Length of `value` in UTF-16 code units.
pub fn utf16_len(value: &str) -> u32 {
    return value.chars().map(|c| c.len_utf16() as u32).sum();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::codec::{DecoderV1, EncoderV1};

    #[test]
    fn string_length_counts_utf16_units() {
        let s = SplittableString::from("a😀b");
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn split_inside_surrogate_pair_keeps_lengths() {
        let mut left = SplittableString::from("a😀b");
        let right = left.split_off(2);
        assert_eq!(left.as_str(), "a\u{FFFD}");
        assert_eq!(right.as_str(), "\u{FFFD}b");
        assert_eq!(left.len() + right.len(), 4);
    }

    #[test]
    fn splice_and_squash_any() {
        let mut content = ItemContent::Any(vec![Any::from(1), Any::from(2), Any::from(3)]);
        let right = content.splice(1);
        assert_eq!(content.len(), 1);
        assert_eq!(right.len(), 2);
        assert!(content.try_squash(&right));
        assert_eq!(content.len(), 3);
        assert!(!content.try_squash(&ItemContent::Deleted(1)));
    }

    #[test]
    fn format_is_not_countable() {
        assert!(!ItemContent::Format(Arc::from("bold"), Any::Bool(true)).is_countable());
        assert!(!ItemContent::Deleted(3).is_countable());
        assert!(ItemContent::Embed(Any::Null).is_countable());
    }

    #[test]
    fn encode_with_offset() {
        let content = ItemContent::String(SplittableString::from("hello"));
        let mut encoder = EncoderV1::new();
        content.encode(&mut encoder, 2);
        let bytes = encoder.finish();
        let mut decoder = DecoderV1::new(&bytes);
        let decoded = ItemContent::decode(&mut decoder, REF_STRING).unwrap();
        assert_eq!(decoded, ItemContent::String(SplittableString::from("llo")));
    }

    #[test]
    fn subdoc_load_flags() {
        let mut opts = std::collections::BTreeMap::new();
        opts.insert(String::from("autoLoad"), Any::Bool(true));
        let doc = SubdocRef {
            guid: Arc::from("g"),
            opts: Any::from(opts),
        };
        assert!(doc.should_load());
        assert!(!SubdocRef::new("h").should_load());
    }
}
