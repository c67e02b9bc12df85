//! Branches: the per-type state behind every shared type.
//!
//! Each shared type (root or nested) owns one [`Branch`] in the store's
//! branch arena. A branch is the head of a doubly-linked chain of items for
//! sequence content, and a key map for map-like content. Handles such as
//! `TextRef` are plain [`BranchId`]s into that arena.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::encoding::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::markers::SearchMarkers;

/// Index of a branch in the store's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub u32);

/// The kind of a shared type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Array,
    Map,
    Text,
    XmlElement(Arc<str>),
    XmlFragment,
    XmlHook(Arc<str>),
    XmlText,
    /// A root known only from a remote update; the first typed lookup
    /// decides what it is.
    Undefined,
}

const TYPE_ARRAY: u8 = 0;
const TYPE_MAP: u8 = 1;
const TYPE_TEXT: u8 = 2;
const TYPE_XML_ELEMENT: u8 = 3;
const TYPE_XML_FRAGMENT: u8 = 4;
const TYPE_XML_HOOK: u8 = 5;
const TYPE_XML_TEXT: u8 = 6;
const TYPE_UNDEFINED: u8 = 15;

impl TypeRef {
    pub fn tag(&self) -> u8 {
        match self {
            TypeRef::Array => TYPE_ARRAY,
            TypeRef::Map => TYPE_MAP,
            TypeRef::Text => TYPE_TEXT,
            TypeRef::XmlElement(_) => TYPE_XML_ELEMENT,
            TypeRef::XmlFragment => TYPE_XML_FRAGMENT,
            TypeRef::XmlHook(_) => TYPE_XML_HOOK,
            TypeRef::XmlText => TYPE_XML_TEXT,
            TypeRef::Undefined => TYPE_UNDEFINED,
        }
    }

    /// Whether this is one of the xml node kinds.
    pub fn is_xml(&self) -> bool {
        return matches!(
            self,
            TypeRef::XmlElement(_) | TypeRef::XmlFragment | TypeRef::XmlHook(_) | TypeRef::XmlText
        );
    }

    pub fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_type_ref(self.tag());
        match self {
            TypeRef::XmlElement(name) | TypeRef::XmlHook(name) => encoder.write_key(name),
            _ => {}
        }
    }

    pub fn decode<'a, D: Decoder<'a>>(decoder: &mut D) -> Result<TypeRef> {
        let type_ref = match decoder.read_type_ref()? {
            TYPE_ARRAY => TypeRef::Array,
            TYPE_MAP => TypeRef::Map,
            TYPE_TEXT => TypeRef::Text,
            TYPE_XML_ELEMENT => TypeRef::XmlElement(decoder.read_key()?),
            TYPE_XML_FRAGMENT => TypeRef::XmlFragment,
            TYPE_XML_HOOK => TypeRef::XmlHook(decoder.read_key()?),
            TYPE_XML_TEXT => TypeRef::XmlText,
            TYPE_UNDEFINED => TypeRef::Undefined,
            other => return Err(Error::UnknownTypeRef(other)),
        };
        return Ok(type_ref);
    }
}

/// Where an item belongs.
///
/// Decoded items name their parent either by the root's name or by the id
/// of the item anchoring a nested type; integration resolves both to a
/// branch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypePtr {
    /// Inferred from the neighbours during integration, or unreachable
    /// (the item then integrates as garbage).
    Unknown,
    Branch(BranchId),
    Named(Arc<str>),
    Id(Id),
}

/// State of one shared type.
#[derive(Debug)]
pub struct Branch {
    pub type_ref: TypeRef,
    /// Start id of the first item in the sequence chain.
    pub start: Option<Id>,
    /// Map slots: key to the last id of the current (rightmost) item.
    pub map: FxHashMap<Arc<str>, Id>,
    /// The item anchoring this type inside its parent, `None` for roots.
    pub item: Option<Id>,
    /// Name in the root registry, `None` for nested types.
    pub name: Option<Arc<str>>,
    /// Countable, non-deleted length of the sequence.
    pub content_len: u32,
    pub markers: Option<SearchMarkers>,
}

impl Branch {
    pub fn new(type_ref: TypeRef) -> Branch {
        let markers = match type_ref {
            TypeRef::Map | TypeRef::XmlHook(_) | TypeRef::Undefined => None,
            _ => Some(SearchMarkers::default()),
        };
        return Branch {
            type_ref,
            start: None,
            map: FxHashMap::default(),
            item: None,
            name: None,
            content_len: 0,
            markers,
        };
    }

    /// Give a typeless root its definitive type.
    pub(crate) fn upgrade(&mut self, type_ref: TypeRef) {
        let sequential = !matches!(
            type_ref,
            TypeRef::Map | TypeRef::XmlHook(_) | TypeRef::Undefined
        );
        if self.markers.is_none() && sequential {
            self.markers = Some(SearchMarkers::default());
        }
        self.type_ref = type_ref;
    }

    pub fn len(&self) -> u32 {
        return self.content_len;
    }

    pub fn is_empty(&self) -> bool {
        return self.content_len == 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::codec::{DecoderV2, EncoderV2};

    #[test]
    fn xml_type_refs_carry_names() {
        let refs = [
            TypeRef::Array,
            TypeRef::XmlElement(Arc::from("p")),
            TypeRef::XmlHook(Arc::from("hook")),
            TypeRef::XmlText,
        ];
        let mut encoder = EncoderV2::new();
        for r in &refs {
            r.encode(&mut encoder);
        }
        let bytes = encoder.finish();
        let mut decoder = DecoderV2::new(&bytes).unwrap();
        for r in &refs {
            assert_eq!(&TypeRef::decode(&mut decoder).unwrap(), r);
        }
    }

    #[test]
    fn maps_have_no_markers() {
        assert!(Branch::new(TypeRef::Map).markers.is_none());
        assert!(Branch::new(TypeRef::Text).markers.is_some());
    }
}
