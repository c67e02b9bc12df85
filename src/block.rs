//! Blocks: the units stored in the per-client logs.
//!
//! - [`Item`] carries content and its position in a parent type.
//! - `Gc` is a deleted range whose content was discarded.
//! - `Skip` stands for a range known to exist but not received yet. It only
//!   ever appears in updates, never in a store.
//!
//! Neighbour links are ids, not pointers: `left` holds the *last* id of the
//! left neighbour and `right` the *first* id of the right neighbour. Both
//! survive splitting and merging of the neighbour without fix-ups.

use std::sync::Arc;

use crate::branch::TypePtr;
use crate::content::{ItemContent, REF_GC, REF_SKIP};
use crate::encoding::codec::{Decoder, Encoder};
use crate::error::Result;
use crate::id::{Clock, Id};

const HAS_ORIGIN: u8 = 0x80;
const HAS_RIGHT_ORIGIN: u8 = 0x40;
const HAS_PARENT_SUB: u8 = 0x20;
const CONTENT_REF_MASK: u8 = 0x1f;

/// Item flag bits.
const KEEP: u8 = 0b0001;
const COUNTABLE: u8 = 0b0010;
const DELETED: u8 = 0b0100;
const MARKER: u8 = 0b1000;

#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub id: Id,
    pub len: u32,
    /// Last id of the current left neighbour.
    pub left: Option<Id>,
    /// First id of the current right neighbour.
    pub right: Option<Id>,
    /// Last id of the left neighbour at creation time.
    pub origin: Option<Id>,
    /// First id of the right neighbour at creation time.
    pub right_origin: Option<Id>,
    pub parent: TypePtr,
    /// Map key for map slots, `None` for sequence elements.
    pub parent_sub: Option<Arc<str>>,
    pub content: ItemContent,
    /// The item that replaced this one when it was redone.
    pub redone: Option<Id>,
    info: u8,
}

impl Item {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Id,
        left: Option<Id>,
        origin: Option<Id>,
        right: Option<Id>,
        right_origin: Option<Id>,
        parent: TypePtr,
        parent_sub: Option<Arc<str>>,
        content: ItemContent,
    ) -> Item {
        let info = if content.is_countable() { COUNTABLE } else { 0 };
        return Item {
            id,
            len: content.len(),
            left,
            right,
            origin,
            right_origin,
            parent,
            parent_sub,
            content,
            redone: None,
            info,
        };
    }

    #[inline]
    pub fn last_id(&self) -> Id {
        return self.id.offset(self.len - 1);
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        return self.info & DELETED != 0;
    }

    #[inline]
    pub fn is_countable(&self) -> bool {
        return self.info & COUNTABLE != 0;
    }

    #[inline]
    pub fn is_keep(&self) -> bool {
        return self.info & KEEP != 0;
    }

    #[inline]
    pub fn is_marker(&self) -> bool {
        return self.info & MARKER != 0;
    }

    pub fn mark_deleted(&mut self) {
        self.info |= DELETED;
    }

    pub fn set_keep(&mut self, keep: bool) {
        self.set_flag(KEEP, keep);
    }

    pub fn set_marker(&mut self, marker: bool) {
        self.set_flag(MARKER, marker);
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.info |= flag;
        } else {
            self.info &= !flag;
        }
    }

    /// Length this item contributes to its parent sequence.
    #[inline]
    pub fn content_len(&self) -> u32 {
        if self.is_countable() && !self.is_deleted() {
            return self.len;
        }
        return 0;
    }

    /// Check if the unit `id` lies within this item.
    pub fn contains(&self, id: &Id) -> bool {
        return self.id.client == id.client
            && id.clock >= self.id.clock
            && id.clock < self.id.clock + self.len;
    }

    /// Split at `offset`. `self` keeps the left part, the right part is
    /// returned already linked behind it.
    pub fn split(&mut self, offset: u32) -> Item {
        let split_left = self.id.offset(offset - 1);
        let content = self.content.splice(offset);
        let right = Item {
            id: self.id.offset(offset),
            len: self.len - offset,
            left: Some(split_left),
            right: self.right,
            origin: Some(split_left),
            right_origin: self.right_origin,
            parent: self.parent.clone(),
            parent_sub: self.parent_sub.clone(),
            content,
            redone: self.redone.map(|id| id.offset(offset)),
            info: self.info & !MARKER,
        };
        self.right = Some(right.id);
        self.len = offset;
        return right;
    }

    /// Keep only the first `len` units, dropping the rest of the content.
    pub fn truncate(&mut self, len: u32) {
        if len >= self.len {
            return;
        }
        drop(self.content.splice(len));
        self.len = len;
    }

    /// Absorb `right` if it directly continues this item: same client,
    /// consecutive clocks, created right after it, same deletion state and
    /// a mergeable content kind.
    pub fn try_merge(&mut self, right: &Item) -> bool {
        let mergeable = right.origin == Some(self.last_id())
            && self.right == Some(right.id)
            && self.right_origin == right.right_origin
            && self.id.client == right.id.client
            && self.id.clock + self.len == right.id.clock
            && self.is_deleted() == right.is_deleted()
            && self.redone.is_none()
            && right.redone.is_none()
            && self.content.get_ref() == right.content.get_ref();
        if !mergeable || !self.content.try_squash(&right.content) {
            return false;
        }
        if right.is_keep() {
            self.set_keep(true);
        }
        self.right = right.right;
        self.len += right.len;
        return true;
    }

    /// Write the item as seen from `offset` units into it.
    pub fn encode<E: Encoder>(&self, encoder: &mut E, offset: u32) {
        let origin = if offset > 0 {
            Some(self.id.offset(offset - 1))
        } else {
            self.origin
        };
        let mut info = self.content.get_ref() & CONTENT_REF_MASK;
        if origin.is_some() {
            info |= HAS_ORIGIN;
        }
        if self.right_origin.is_some() {
            info |= HAS_RIGHT_ORIGIN;
        }
        if self.parent_sub.is_some() {
            info |= HAS_PARENT_SUB;
        }
        encoder.write_info(info);
        if let Some(origin) = origin.as_ref() {
            encoder.write_left_id(origin);
        }
        if let Some(right_origin) = self.right_origin.as_ref() {
            encoder.write_right_id(right_origin);
        }
        if origin.is_none() && self.right_origin.is_none() {
            match &self.parent {
                TypePtr::Named(name) => {
                    encoder.write_parent_info(true);
                    encoder.write_string(name);
                }
                TypePtr::Id(id) => {
                    encoder.write_parent_info(false);
                    encoder.write_left_id(id);
                }
                other => panic!("item {} has unresolvable parent {:?}", self.id, other),
            }
            if let Some(sub) = self.parent_sub.as_ref() {
                encoder.write_string(sub);
            }
        }
        self.content.encode(encoder, offset);
    }
}

// =============================================================================
// Blocks
// =============================================================================

/// Id and length of a content-less block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRange {
    pub id: Id,
    pub len: u32,
}

impl BlockRange {
    pub fn new(id: Id, len: u32) -> BlockRange {
        return BlockRange { id, len };
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Item(Box<Item>),
    Gc(BlockRange),
    Skip(BlockRange),
}

impl Block {
    #[inline]
    pub fn id(&self) -> Id {
        match self {
            Block::Item(item) => item.id,
            Block::Gc(r) | Block::Skip(r) => r.id,
        }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        match self {
            Block::Item(item) => item.len,
            Block::Gc(r) | Block::Skip(r) => r.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Clock right after the last unit of this block.
    #[inline]
    pub fn end(&self) -> Clock {
        return self.id().clock + self.len();
    }

    pub fn last_id(&self) -> Id {
        return self.id().offset(self.len() - 1);
    }

    /// GC blocks count as deleted.
    pub fn is_deleted(&self) -> bool {
        match self {
            Block::Item(item) => item.is_deleted(),
            Block::Gc(_) => true,
            Block::Skip(_) => false,
        }
    }

    pub fn is_gc(&self) -> bool {
        return matches!(self, Block::Gc(_));
    }

    pub fn is_skip(&self) -> bool {
        return matches!(self, Block::Skip(_));
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Block::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Block::Item(item) => Some(item),
            _ => None,
        }
    }

    /// Split off everything from `offset` on. Sliced items get an origin
    /// pointing at the unit just before the cut.
    pub fn split(&mut self, offset: u32) -> Block {
        match self {
            Block::Item(item) => Block::Item(Box::new(item.split(offset))),
            Block::Gc(r) => {
                let right = BlockRange::new(r.id.offset(offset), r.len - offset);
                r.len = offset;
                Block::Gc(right)
            }
            Block::Skip(r) => {
                let right = BlockRange::new(r.id.offset(offset), r.len - offset);
                r.len = offset;
                Block::Skip(right)
            }
        }
    }

    /// Shorten the block to `len` units.
    pub fn truncate(&mut self, len: u32) {
        match self {
            Block::Item(item) => item.truncate(len),
            Block::Gc(r) | Block::Skip(r) => r.len = r.len.min(len),
        }
    }

    /// Try to absorb the directly following block.
    pub fn try_merge(&mut self, right: &Block) -> bool {
        match (self, right) {
            (Block::Item(a), Block::Item(b)) => a.try_merge(b),
            (Block::Gc(a), Block::Gc(b)) | (Block::Skip(a), Block::Skip(b)) => {
                if a.id.client != b.id.client || a.id.clock + a.len != b.id.clock {
                    return false;
                }
                a.len += b.len;
                true
            }
            _ => false,
        }
    }

    /// A copy fit for an update: nested types lose their local branch and
    /// resolved parents are turned back into names or ids.
    pub fn detached(&self, parent: TypePtr) -> Block {
        match self {
            Block::Item(item) => {
                let mut copy = Item::new(
                    item.id,
                    None,
                    item.origin,
                    None,
                    item.right_origin,
                    parent,
                    item.parent_sub.clone(),
                    item.content.detached(),
                );
                copy.info = item.info & (DELETED | COUNTABLE);
                Block::Item(Box::new(copy))
            }
            other => other.clone(),
        }
    }

    pub fn encode<E: Encoder>(&self, encoder: &mut E, offset: u32) {
        match self {
            Block::Item(item) => item.encode(encoder, offset),
            Block::Gc(r) => {
                encoder.write_info(REF_GC);
                encoder.write_len(r.len - offset);
            }
            Block::Skip(r) => {
                encoder.write_info(REF_SKIP);
                encoder.write_var((r.len - offset) as u64);
            }
        }
    }

    /// Read one block whose first unit is `id`.
    pub fn decode<'a, D: Decoder<'a>>(decoder: &mut D, id: Id) -> Result<Block> {
        let info = decoder.read_info()?;
        match info & CONTENT_REF_MASK {
            REF_GC => {
                let len = decoder.read_len()?;
                return Ok(Block::Gc(BlockRange::new(id, len)));
            }
            REF_SKIP => {
                let len = decoder.read_var_u32()?;
                return Ok(Block::Skip(BlockRange::new(id, len)));
            }
            content_ref => {
                let origin = if info & HAS_ORIGIN != 0 {
                    Some(decoder.read_left_id()?)
                } else {
                    None
                };
                let right_origin = if info & HAS_RIGHT_ORIGIN != 0 {
                    Some(decoder.read_right_id()?)
                } else {
                    None
                };
                let needs_parent = info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0;
                let parent = if !needs_parent {
                    TypePtr::Unknown
                } else if decoder.read_parent_info()? {
                    TypePtr::Named(decoder.read_string()?)
                } else {
                    TypePtr::Id(decoder.read_left_id()?)
                };
                let parent_sub = if needs_parent && info & HAS_PARENT_SUB != 0 {
                    Some(decoder.read_string()?)
                } else {
                    None
                };
                let content = ItemContent::decode(decoder, content_ref)?;
                let item = Item::new(id, None, origin, None, right_origin, parent, parent_sub, content);
                return Ok(Block::Item(Box::new(item)));
            }
        }
    }
}
