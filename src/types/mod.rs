//! Shared types: handles and the sequence/map primitives they share.
//!
//! A handle ([`TextRef`], [`ArrayRef`], [`MapRef`], [`XmlRef`]) is a copyable
//! [`BranchId`]. Reads take anything implementing [`ReadTxn`]; writes take
//! the [`Transaction`] they belong to.

pub mod array;
pub mod map;
pub mod text;
pub mod xml;

use std::mem;
use std::sync::Arc;

pub use array::ArrayRef;
pub use map::MapRef;
pub use text::TextRef;
pub use xml::XmlRef;

use crate::any::Any;
use crate::block::Item;
use crate::branch::{BranchId, TypePtr, TypeRef};
use crate::content::{ItemContent, TypeContent};
use crate::doc::Doc;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::id::Id;
use crate::integrate::right_of;
use crate::observer::SubscriptionId;
use crate::store::Store;
use crate::transaction::{ReadTxn, Transaction};
use crate::value::{In, Value};

/// Behaviour common to every shared type handle.
pub trait SharedRef: Copy {
    fn branch_id(&self) -> BranchId;

    /// Call `f` with the event of every committed transaction that
    /// changed this type.
    fn observe<F>(&self, doc: &mut Doc, f: F) -> SubscriptionId
    where
        F: FnMut(&mut Transaction<'_>, &Event) + 'static,
    {
        let id = doc.observers.next_id();
        doc.observers
            .types
            .entry(self.branch_id())
            .or_default()
            .push(id, Box::new(f));
        return id;
    }

    /// Call `f` with the events of this type and all types nested in it,
    /// once per transaction.
    fn observe_deep<F>(&self, doc: &mut Doc, f: F) -> SubscriptionId
    where
        F: FnMut(&mut Transaction<'_>, &[Event]) + 'static,
    {
        let id = doc.observers.next_id();
        doc.observers
            .deep
            .entry(self.branch_id())
            .or_default()
            .push(id, Box::new(f));
        return id;
    }

    /// Whether the type still exists: it is a root, or its anchoring item
    /// is not deleted.
    fn is_alive<T: ReadTxn>(&self, txn: &T) -> bool {
        let store = txn.store();
        match store.branch(self.branch_id()).item {
            None => true,
            Some(anchor) => store.item(&anchor).is_some_and(|item| !item.is_deleted()),
        }
    }
}

pub(crate) fn out_of_bounds(index: u32, len: u32) -> Error {
    return Error::IndexOutOfBounds { index, len };
}

// =============================================================================
// Writing items
// =============================================================================

/// Create and integrate one local item between `left` and `right`.
/// Returns the new item's last id.
pub(crate) fn insert_content(
    txn: &mut Transaction<'_>,
    parent: BranchId,
    left: Option<Id>,
    right: Option<Id>,
    parent_sub: Option<Arc<str>>,
    content: ItemContent,
) -> Id {
    let id = txn.next_id();
    let item = Item::new(id, left, left, right, right, TypePtr::Branch(parent), parent_sub, content);
    let last = item.last_id();
    txn.integrate(item, 0);
    return last;
}

/// Integrate a single value. Nested values create their type first and
/// are filled right after.
pub(crate) fn insert_value(
    txn: &mut Transaction<'_>,
    parent: BranchId,
    left: Option<Id>,
    right: Option<Id>,
    parent_sub: Option<Arc<str>>,
    value: In,
) -> Id {
    let (content, prelim) = match value {
        In::Any(Any::Buffer(buf)) => (ItemContent::Binary(buf), None),
        In::Any(any) => (ItemContent::Any(vec![any]), None),
        In::Doc(doc) => (ItemContent::Doc(doc), None),
        nested => {
            let type_ref = nested.type_ref().unwrap_or(TypeRef::Undefined);
            (ItemContent::Type(TypeContent::new(type_ref)), Some(nested))
        }
    };
    let last = insert_content(txn, parent, left, right, parent_sub, content);
    if let Some(prelim) = prelim {
        if let Some(branch) = txn.doc.store.branch_of_item(&last) {
            fill_prelim(txn, branch, prelim);
        }
    }
    return last;
}

/// Populate a freshly integrated nested type.
fn fill_prelim(txn: &mut Transaction<'_>, branch: BranchId, value: In) {
    match value {
        In::Text(s) | In::XmlText(s) => text::insert_str(txn, branch, 0, &s, None),
        In::Array(values) => {
            insert_values(txn, branch, None, values);
        }
        In::Map(entries) => {
            for (key, value) in entries {
                map_insert(txn, branch, &key, value);
            }
        }
        In::XmlElement(_) | In::Any(_) | In::Doc(_) => {}
    }
}

/// Insert `values` right of `left`, packing consecutive plain values into
/// one item. Returns the last id written.
pub(crate) fn insert_values(
    txn: &mut Transaction<'_>,
    parent: BranchId,
    left: Option<Id>,
    values: Vec<In>,
) -> Option<Id> {
    let right = right_of(&txn.doc.store, parent, left);
    let mut left = left;
    let mut packed: Vec<Any> = Vec::new();
    for value in values {
        match value {
            In::Any(Any::Buffer(_)) | In::Text(_) | In::Array(_) | In::Map(_) | In::XmlElement(_)
            | In::XmlText(_) | In::Doc(_) => {
                if !packed.is_empty() {
                    let content = ItemContent::Any(mem::take(&mut packed));
                    left = Some(insert_content(txn, parent, left, right, None, content));
                }
                left = Some(insert_value(txn, parent, left, right, None, value));
            }
            In::Any(any) => packed.push(any),
        }
    }
    if !packed.is_empty() {
        left = Some(insert_content(txn, parent, left, right, None, ItemContent::Any(packed)));
    }
    return left;
}

// =============================================================================
// Sequences
// =============================================================================

/// Resolve `index` to the last id of the item new content goes after,
/// splitting the item the index falls into.
pub(crate) fn find_left(txn: &mut Transaction<'_>, parent: BranchId, index: u32) -> Option<Id> {
    if index == 0 {
        return None;
    }
    let mut remaining = index;
    let mut next = txn.doc.store.branch(parent).start;
    if let Some((marker, marker_index)) = txn.doc.store.find_marker(parent, index) {
        next = Some(marker);
        remaining -= marker_index;
        if remaining == 0 {
            return txn.doc.store.item(&marker).and_then(|item| item.left);
        }
    }
    let mut last_seen = None;
    while let Some(id) = next {
        let Some(item) = txn.doc.store.item(&id) else { break };
        if !item.is_deleted() && item.is_countable() {
            if remaining <= item.len {
                let left = Id::new(id.client, id.clock + remaining - 1);
                if remaining < item.len {
                    txn.clean_end(&left);
                }
                return Some(left);
            }
            remaining -= item.len;
        }
        last_seen = Some(item.last_id());
        next = item.right;
    }
    return last_seen;
}

/// Insert `values` at `index` of a sequence type.
pub(crate) fn list_insert(
    txn: &mut Transaction<'_>,
    parent: BranchId,
    index: u32,
    values: Vec<In>,
) -> Result<()> {
    let len = txn.doc.store.branch(parent).len();
    if index > len {
        return Err(out_of_bounds(index, len));
    }
    if values.is_empty() {
        return Ok(());
    }
    let count = values.len() as i64;
    let left = find_left(txn, parent, index);
    txn.doc.store.update_marker_changes(parent, index, count);
    insert_values(txn, parent, left, values);
    return Ok(());
}

/// Delete `len` countable units starting at `index`.
pub(crate) fn list_remove(txn: &mut Transaction<'_>, parent: BranchId, index: u32, len: u32) -> Result<()> {
    let total = txn.doc.store.branch(parent).len();
    match index.checked_add(len) {
        Some(end) if end <= total => {}
        _ => return Err(out_of_bounds(index.saturating_add(len), total)),
    }
    if len == 0 {
        return Ok(());
    }
    let mut skip = index;
    let mut next = txn.doc.store.branch(parent).start;
    if let Some((marker, marker_index)) = txn.doc.store.find_marker(parent, index) {
        next = Some(marker);
        skip -= marker_index;
    }
    while skip > 0 {
        let Some(id) = next else { break };
        let Some(item) = txn.doc.store.item(&id) else { break };
        let (item_len, right) = (item.len, item.right);
        if !item.is_deleted() && item.is_countable() {
            if skip < item_len {
                let split = Id::new(id.client, id.clock + skip);
                txn.clean_start(&split);
                next = Some(split);
                break;
            }
            skip -= item_len;
        }
        next = right;
    }

    let mut remaining = len;
    while remaining > 0 {
        let Some(id) = next else { break };
        let Some(item) = txn.doc.store.item(&id) else { break };
        if !item.is_deleted() && item.is_countable() {
            if remaining < item.len {
                txn.clean_start(&Id::new(id.client, id.clock + remaining));
            }
            let Some(item) = txn.doc.store.item(&id) else { break };
            let item_len = item.len;
            txn.delete_item(&id);
            remaining -= item_len;
        }
        next = txn.doc.store.item(&id).and_then(|item| item.right);
    }
    txn.doc.store.update_marker_changes(parent, index, -(len as i64));
    return Ok(());
}

/// The value at `index` of a sequence type.
pub(crate) fn list_get(store: &Store, parent: BranchId, index: u32) -> Option<Value> {
    let mut remaining = index;
    for item in store.iter_items(parent) {
        if item.is_deleted() || !item.is_countable() {
            continue;
        }
        if remaining < item.len {
            return Value::content_at(store, &item.content, remaining);
        }
        remaining -= item.len;
    }
    return None;
}

/// All values of a sequence type.
pub(crate) fn list_values(store: &Store, parent: BranchId) -> Vec<Value> {
    return store
        .iter_items(parent)
        .filter(|item| !item.is_deleted() && item.is_countable())
        .flat_map(|item| Value::from_content(store, &item.content))
        .collect();
}

// =============================================================================
// Maps
// =============================================================================

/// Write `value` under `key`, shadowing whatever was there.
pub(crate) fn map_insert(txn: &mut Transaction<'_>, parent: BranchId, key: &str, value: In) -> Id {
    let left = txn.doc.store.branch(parent).map.get(key).copied();
    return insert_value(txn, parent, left, None, Some(Arc::from(key)), value);
}

/// Delete the entry under `key`. Returns the removed value.
pub(crate) fn map_remove(txn: &mut Transaction<'_>, parent: BranchId, key: &str) -> Option<Value> {
    let old = map_get(&txn.doc.store, parent, key)?;
    let last = txn.doc.store.branch(parent).map.get(key).copied()?;
    txn.delete_item(&last);
    return Some(old);
}

/// Current value under `key`, `None` if absent or deleted.
pub(crate) fn map_get(store: &Store, parent: BranchId, key: &str) -> Option<Value> {
    let item = store.branch(parent).map.get(key).and_then(|id| store.item(id))?;
    if item.is_deleted() {
        return None;
    }
    return Value::from_content(store, &item.content).pop();
}

/// Live entries ordered by key.
pub(crate) fn map_entries(store: &Store, parent: BranchId) -> Vec<(Arc<str>, Value)> {
    let mut entries: Vec<(Arc<str>, Value)> = store
        .branch(parent)
        .map
        .keys()
        .filter_map(|key| Some((key.clone(), map_get(store, parent, key)?)))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    return entries;
}
