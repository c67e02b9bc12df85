//! Rich text.
//!
//! Characters live in string items; formatting is expressed by
//! non-countable format items threaded into the same chain. A format item
//! `(key, value)` switches the attribute on for everything right of it
//! until another format item for the same key (a `null` value ends it).
//! Inserting or formatting a range therefore writes a format item at the
//! start and the negated attribute at the end.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::any::Any;
use crate::block::Item;
use crate::branch::BranchId;
use crate::content::{ItemContent, SplittableString};
use crate::error::Result;
use crate::event::{Attrs, Delta};
use crate::id::Id;
use crate::snapshot::Snapshot;
use crate::store::Store;
use crate::transaction::{ReadTxn, Transaction};
use crate::types::{insert_content, out_of_bounds, SharedRef};
use crate::value::Value;

/// A replicated, formattable string. Lengths and indices count UTF-16
/// code units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextRef(pub(crate) BranchId);

/// One run of the formatted content.
#[derive(Clone, Debug, PartialEq)]
pub struct Diff {
    pub insert: Value,
    pub attributes: Option<Box<Attrs>>,
}

impl SharedRef for TextRef {
    fn branch_id(&self) -> BranchId {
        return self.0;
    }
}

impl TextRef {
    pub fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        return txn.store().branch(self.0).len();
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        return self.len(txn) == 0;
    }

    /// The plain text, without formatting or embeds.
    pub fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        let mut out = String::new();
        for item in txn.store().iter_items(self.0) {
            if let (false, ItemContent::String(s)) = (item.is_deleted(), &item.content) {
                out.push_str(s.as_str());
            }
        }
        return out;
    }

    /// Insert `chunk` at `index`. The new text takes the formatting in
    /// effect at the insertion point.
    pub fn insert(&self, txn: &mut Transaction<'_>, index: u32, chunk: &str) -> Result<()> {
        self.check_index(txn, index)?;
        if !chunk.is_empty() {
            insert_str(txn, self.0, index, chunk, None);
        }
        return Ok(());
    }

    /// Insert `chunk` with exactly `attributes`. Attributes in effect at
    /// the insertion point but missing from `attributes` are switched off
    /// for the new text.
    pub fn insert_with_attributes(
        &self,
        txn: &mut Transaction<'_>,
        index: u32,
        chunk: &str,
        attributes: Attrs,
    ) -> Result<()> {
        self.check_index(txn, index)?;
        if !chunk.is_empty() {
            insert_str(txn, self.0, index, chunk, Some(attributes));
        }
        return Ok(());
    }

    /// Insert a single embedded value, which counts as one unit.
    pub fn insert_embed(
        &self,
        txn: &mut Transaction<'_>,
        index: u32,
        embed: Any,
        attributes: Option<Attrs>,
    ) -> Result<()> {
        self.check_index(txn, index)?;
        let mut pos = match attributes {
            Some(_) => Position::find(txn, self.0, index),
            None => Position::seek(txn, self.0, index),
        };
        let attributes = attributes.unwrap_or_else(|| pos.attrs.clone());
        pos.insert_content(txn, ItemContent::Embed(embed), attributes);
        return Ok(());
    }

    pub fn remove_range(&self, txn: &mut Transaction<'_>, index: u32, len: u32) -> Result<()> {
        let total = self.len(&*txn);
        match index.checked_add(len) {
            Some(end) if end <= total => {}
            _ => return Err(out_of_bounds(index.saturating_add(len), total)),
        }
        if len == 0 {
            return Ok(());
        }
        let mut pos = Position::seek(txn, self.0, index);
        pos.delete(txn, len);
        return Ok(());
    }

    /// Apply `attributes` to `len` units starting at `index`. A `null`
    /// value removes the attribute.
    pub fn format(&self, txn: &mut Transaction<'_>, index: u32, len: u32, attributes: Attrs) -> Result<()> {
        let total = self.len(&*txn);
        match index.checked_add(len) {
            Some(end) if end <= total => {}
            _ => return Err(out_of_bounds(index.saturating_add(len), total)),
        }
        if len == 0 || attributes.is_empty() {
            return Ok(());
        }
        let mut pos = Position::find(txn, self.0, index);
        pos.format(txn, len, &attributes);
        return Ok(());
    }

    /// The content as runs of equally formatted text and embeds.
    pub fn diff<T: ReadTxn>(&self, txn: &T) -> Vec<Diff> {
        return runs(txn.store(), self.0, |item, i| i < item.len && !item.is_deleted());
    }

    /// Like [`TextRef::diff`], as of `snapshot`. Needs a document without
    /// garbage collection.
    pub fn diff_at<T: ReadTxn>(&self, txn: &T, snapshot: &Snapshot) -> Vec<Diff> {
        return runs(txn.store(), self.0, |item, i| snapshot.is_visible(&item.id.offset(i)));
    }

    /// Replay a delta: retain moves (and formats), insert writes text or
    /// embeds, delete removes. Values other than plain data are skipped.
    pub fn apply_delta<I>(&self, txn: &mut Transaction<'_>, delta: I) -> Result<()>
    where
        I: IntoIterator<Item = Delta>,
    {
        let mut pos = Position::find(txn, self.0, 0);
        for op in delta {
            match op {
                Delta::Inserted(values, attributes) => {
                    for value in values {
                        let attributes = match &attributes {
                            Some(attrs) => (**attrs).clone(),
                            None => Attrs::new(),
                        };
                        let content = match value {
                            Value::Any(Any::String(s)) => ItemContent::String(SplittableString::from(&*s)),
                            Value::Any(any) => ItemContent::Embed(any),
                            _ => continue,
                        };
                        pos.insert_content(txn, content, attributes);
                    }
                }
                Delta::Retain(len, attributes) => {
                    let available = self.len(&*txn) - pos.index;
                    if len > available {
                        return Err(out_of_bounds(pos.index + len, self.len(&*txn)));
                    }
                    match attributes {
                        Some(attrs) => pos.format(txn, len, &attrs),
                        None => pos.advance(txn, len),
                    }
                }
                Delta::Deleted(len) => {
                    let available = self.len(&*txn) - pos.index;
                    if len > available {
                        return Err(out_of_bounds(pos.index + len, self.len(&*txn)));
                    }
                    pos.delete(txn, len);
                }
            }
        }
        return Ok(());
    }

    fn check_index(&self, txn: &Transaction<'_>, index: u32) -> Result<()> {
        let len = self.len(txn);
        if index > len {
            return Err(out_of_bounds(index, len));
        }
        return Ok(());
    }
}

/// Insert plain text at `index`. Without `attributes` the text inherits
/// the formatting at the insertion point.
pub(crate) fn insert_str(
    txn: &mut Transaction<'_>,
    parent: BranchId,
    index: u32,
    chunk: &str,
    attributes: Option<Attrs>,
) {
    if chunk.is_empty() {
        return;
    }
    let mut pos = match attributes {
        Some(_) => Position::find(txn, parent, index),
        None => Position::seek(txn, parent, index),
    };
    let attributes = attributes.unwrap_or_else(|| pos.attrs.clone());
    pos.insert_content(txn, ItemContent::String(chunk.into()), attributes);
}

fn set_attr(attrs: &mut Attrs, key: &Arc<str>, value: &Any) {
    if value.is_null() {
        attrs.remove(key);
    } else {
        attrs.insert(key.clone(), value.clone());
    }
}

fn attr_or_null<'a>(attrs: &'a Attrs, key: &str) -> &'a Any {
    return attrs.get(key).unwrap_or(&Any::Null);
}

// =============================================================================
// Cursor
// =============================================================================

/// A position between two items, with the attributes in effect there.
struct Position {
    parent: BranchId,
    /// Last id of the item left of the cursor.
    left: Option<Id>,
    /// Start id of the item right of the cursor.
    right: Option<Id>,
    index: u32,
    attrs: Attrs,
    /// Whether `attrs` holds everything in effect, or only what was
    /// switched on between a search marker and the cursor.
    exact: bool,
}

impl Position {
    /// Walk from the start to `index`, splitting the item it falls into.
    fn find(txn: &mut Transaction<'_>, parent: BranchId, index: u32) -> Position {
        let mut pos = Position {
            parent,
            left: None,
            right: txn.doc.store.branch(parent).start,
            index: 0,
            attrs: Attrs::new(),
            exact: true,
        };
        pos.advance(txn, index);
        return pos;
    }

    /// Like [`Position::find`], but starts from the search marker closest
    /// to `index`. Attributes switched on left of the marker are unknown,
    /// so the result only serves edits that keep the formatting in effect.
    fn seek(txn: &mut Transaction<'_>, parent: BranchId, index: u32) -> Position {
        let anchor = txn.doc.store.find_marker(parent, index);
        let Some((mut anchor, anchor_index)) = anchor.filter(|(_, at)| *at <= index) else {
            return Position::find(txn, parent, index);
        };
        // back up over deleted and format items, so the cursor ends up
        // right after the last unit before `index`
        let store = &txn.doc.store;
        let mut left = store.item(&anchor).and_then(|item| item.left);
        while let Some(prev) = left.and_then(|id| store.item(&id)) {
            if !prev.is_deleted() && prev.is_countable() {
                break;
            }
            anchor = prev.id;
            left = prev.left;
        }
        let mut pos = Position {
            parent,
            left,
            right: Some(anchor),
            index: anchor_index,
            attrs: Attrs::new(),
            exact: left.is_none(),
        };
        pos.advance(txn, index - anchor_index);
        return pos;
    }

    fn right_item<'a>(&self, store: &'a Store) -> Option<&'a Item> {
        return self.right.and_then(|id| store.item(&id));
    }

    /// Step over the item right of the cursor.
    fn forward(&mut self, store: &Store) {
        let Some(item) = self.right_item(store) else {
            return;
        };
        if !item.is_deleted() {
            match &item.content {
                ItemContent::Format(key, value) => set_attr(&mut self.attrs, key, value),
                _ if item.is_countable() => self.index += item.len,
                _ => {}
            }
        }
        self.left = Some(item.last_id());
        self.right = item.right;
    }

    /// Move right over `count` countable units.
    fn advance(&mut self, txn: &mut Transaction<'_>, mut count: u32) {
        while count > 0 {
            let Some(right) = self.right else { break };
            let Some(item) = txn.doc.store.item(&right) else { break };
            if !item.is_deleted() && item.is_countable() {
                if count < item.len {
                    txn.clean_start(&right.offset(count));
                }
                let len = txn.doc.store.item(&right).map_or(count, |item| item.len);
                count -= len.min(count);
            }
            self.forward(&txn.doc.store);
        }
    }

    /// Write `content` at the cursor and step over it.
    fn write(&mut self, txn: &mut Transaction<'_>, content: ItemContent) {
        let id = txn.next_id();
        insert_content(txn, self.parent, self.left, self.right, None, content);
        self.right = Some(id);
        self.forward(&txn.doc.store);
    }

    /// Skip deleted items and format items that already say what
    /// `attributes` wants. Format items are only judged when the cursor
    /// knows every attribute in effect.
    fn minimize_attribute_changes(&mut self, store: &Store, attributes: &Attrs) {
        while let Some(item) = self.right_item(store) {
            let redundant = item.is_deleted()
                || (self.exact
                    && matches!(&item.content, ItemContent::Format(key, value) if attr_or_null(attributes, key) == value));
            if !redundant {
                break;
            }
            self.forward(store);
        }
    }

    /// Write format items for every attribute that differs from what is
    /// in effect. Returns the values to restore afterwards.
    fn insert_attributes(&mut self, txn: &mut Transaction<'_>, attributes: &Attrs) -> Attrs {
        let mut negated = Attrs::new();
        for (key, value) in attributes {
            let current = attr_or_null(&self.attrs, key).clone();
            if &current != value {
                negated.insert(key.clone(), current);
                self.write(txn, ItemContent::Format(key.clone(), value.clone()));
            }
        }
        return negated;
    }

    fn insert_negated_attributes(&mut self, txn: &mut Transaction<'_>, mut negated: Attrs) {
        while let Some(item) = self.right_item(&txn.doc.store) {
            let absorbed = item.is_deleted()
                || matches!(&item.content, ItemContent::Format(key, value) if attr_or_null(&negated, key) == value);
            if !absorbed {
                break;
            }
            if let (false, ItemContent::Format(key, _)) = (item.is_deleted(), &item.content) {
                negated.remove(key);
            }
            self.forward(&txn.doc.store);
        }
        for (key, value) in negated {
            self.write(txn, ItemContent::Format(key, value));
        }
    }

    fn insert_content(&mut self, txn: &mut Transaction<'_>, content: ItemContent, mut attributes: Attrs) {
        if content.is_countable() {
            txn.doc.store.update_marker_changes(self.parent, self.index, content.len() as i64);
        }
        for key in self.attrs.keys() {
            attributes.entry(key.clone()).or_insert(Any::Null);
        }
        self.minimize_attribute_changes(&txn.doc.store, &attributes);
        let negated = self.insert_attributes(txn, &attributes);
        self.write(txn, content);
        self.insert_negated_attributes(txn, negated);
    }

    fn format(&mut self, txn: &mut Transaction<'_>, mut len: u32, attributes: &Attrs) {
        self.minimize_attribute_changes(&txn.doc.store, attributes);
        let mut negated = self.insert_attributes(txn, attributes);
        while let Some(right) = self.right {
            let Some(item) = txn.doc.store.item(&right) else { break };
            let is_format = matches!(item.content, ItemContent::Format(..));
            if len == 0 && (negated.is_empty() || !(item.is_deleted() || is_format)) {
                break;
            }
            if !item.is_deleted() {
                if let ItemContent::Format(key, value) = &item.content {
                    if let Some(wanted) = attributes.get(key) {
                        if wanted == value {
                            negated.remove(key);
                        } else {
                            if len == 0 {
                                break;
                            }
                            negated.insert(key.clone(), value.clone());
                        }
                        txn.delete_item(&right);
                    }
                } else {
                    if len < item.len {
                        txn.clean_start(&right.offset(len));
                    }
                    let item_len = txn.doc.store.item(&right).map_or(len, |item| item.len);
                    len -= item_len.min(len);
                }
            }
            self.forward(&txn.doc.store);
        }
        self.insert_negated_attributes(txn, negated);
    }

    fn delete(&mut self, txn: &mut Transaction<'_>, len: u32) {
        let start_attrs = self.exact.then(|| self.attrs.clone());
        let start = self.right;
        let mut remaining = len;
        while remaining > 0 {
            let Some(right) = self.right else { break };
            let Some(item) = txn.doc.store.item(&right) else { break };
            if !item.is_deleted() && item.is_countable() {
                if remaining < item.len {
                    txn.clean_start(&right.offset(remaining));
                }
                let item_len = txn.doc.store.item(&right).map_or(remaining, |item| item.len);
                remaining -= item_len.min(remaining);
                txn.delete_item(&right);
            }
            self.forward(&txn.doc.store);
        }
        let deleted = len - remaining;
        if deleted > 0 {
            txn.doc.store.update_marker_changes(self.parent, self.index, -(deleted as i64));
        }
        if let Some(start) = start {
            let curr = self.right;
            cleanup_formatting_gap(txn, self.parent, start, curr, start_attrs, &mut self.attrs);
        }
    }
}

/// Delete format items in the gap left by a deletion that became
/// redundant: overwritten before any content, or re-stating what was
/// already in effect at `start`. Without `start_attrs` they are collected
/// from the beginning of the text once a format item shows up. Returns the
/// number of format items removed.
fn cleanup_formatting_gap(
    txn: &mut Transaction<'_>,
    parent: BranchId,
    start: Id,
    curr: Option<Id>,
    mut start_attrs: Option<Attrs>,
    curr_attrs: &mut Attrs,
) -> u32 {
    let mut end = Some(start);
    let mut end_formats: FxHashMap<Arc<str>, Id> = FxHashMap::default();
    while let Some(id) = end {
        let Some(item) = txn.doc.store.item(&id) else { break };
        if item.is_countable() && !item.is_deleted() {
            break;
        }
        if let (false, ItemContent::Format(key, _)) = (item.is_deleted(), &item.content) {
            end_formats.insert(key.clone(), item.id);
        }
        end = item.right;
    }

    let mut cleanups = 0;
    let mut reached_curr = false;
    let mut cursor = Some(start);
    while cursor != end {
        let Some(id) = cursor else { break };
        if curr == Some(id) {
            reached_curr = true;
        }
        let Some(item) = txn.doc.store.item(&id) else { break };
        cursor = item.right;
        let (false, ItemContent::Format(key, value)) = (item.is_deleted(), &item.content) else {
            continue;
        };
        let (key, value) = (key.clone(), value.clone());
        let store = &txn.doc.store;
        let known = start_attrs.get_or_insert_with(|| attrs_before(store, parent, start));
        let start_value = attr_or_null(known, &key).clone();
        if end_formats.get(&key) != Some(&id) || start_value == value {
            txn.delete_item(&id);
            cleanups += 1;
            if !reached_curr && attr_or_null(curr_attrs, &key) == &value && start_value != value {
                set_attr(curr_attrs, &key, &start_value);
            }
        }
        let deleted = txn.doc.store.item(&id).is_some_and(Item::is_deleted);
        if !reached_curr && !deleted {
            set_attr(curr_attrs, &key, &value);
        }
    }
    return cleanups;
}

/// Attributes in effect right before the item starting at `id`.
fn attrs_before(store: &Store, parent: BranchId, id: Id) -> Attrs {
    let mut attrs = Attrs::new();
    for item in store.iter_items(parent) {
        if item.id == id {
            break;
        }
        if let (false, ItemContent::Format(key, value)) = (item.is_deleted(), &item.content) {
            set_attr(&mut attrs, key, value);
        }
    }
    return attrs;
}

// =============================================================================
// Reading formatted content
// =============================================================================

/// Formatted runs of the units `visible(item, offset)` accepts.
fn runs<F>(store: &Store, parent: BranchId, visible: F) -> Vec<Diff>
where
    F: Fn(&Item, u32) -> bool,
{
    let mut out = Vec::new();
    let mut attrs = Attrs::new();
    let mut text = String::new();

    fn pack(out: &mut Vec<Diff>, text: &mut String, attrs: &Attrs) {
        if text.is_empty() {
            return;
        }
        let insert = Value::Any(Any::String(Arc::from(text.as_str())));
        let attributes = (!attrs.is_empty()).then(|| Box::new(attrs.clone()));
        out.push(Diff { insert, attributes });
        text.clear();
    }

    for item in store.iter_items(parent) {
        match &item.content {
            ItemContent::String(s) => {
                if (0..item.len).all(|i| visible(item, i)) {
                    text.push_str(s.as_str());
                    continue;
                }
                // partially visible: keep the visible units only
                for i in 0..item.len {
                    if visible(item, i) {
                        let mut unit = s.clone();
                        let mut tail = unit.split_off(i);
                        let _ = tail.split_off(1);
                        text.push_str(tail.as_str());
                    }
                }
            }
            ItemContent::Embed(_) | ItemContent::Type(_) if visible(item, 0) => {
                pack(&mut out, &mut text, &attrs);
                if let Some(insert) = Value::from_content(store, &item.content).pop() {
                    let attributes = (!attrs.is_empty()).then(|| Box::new(attrs.clone()));
                    out.push(Diff { insert, attributes });
                }
            }
            ItemContent::Format(key, value) if visible(item, 0) => {
                pack(&mut out, &mut text, &attrs);
                set_attr(&mut attrs, key, value);
            }
            _ => {}
        }
    }
    pack(&mut out, &mut text, &attrs);
    return out;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::any::Any;
    use crate::doc::Doc;
    use crate::event::{Attrs, Delta};
    use crate::types::SharedRef;
    use crate::value::Value;

    use super::{Diff, Position};

    fn bold() -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert(Arc::from("bold"), Any::Bool(true));
        return attrs;
    }

    fn run(text: &str, attrs: Option<Attrs>) -> Diff {
        return Diff {
            insert: Value::Any(Any::from(text)),
            attributes: attrs.map(Box::new),
        };
    }

    #[test]
    fn insert_and_remove() {
        let mut doc = Doc::new();
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| {
            text.insert(txn, 0, "hello world").unwrap();
            text.remove_range(txn, 5, 6).unwrap();
            text.insert(txn, 0, ">> ").unwrap();
        });
        assert_eq!(text.get_string(&doc), ">> hello");
        assert_eq!(text.len(&doc), 8);
    }

    #[test]
    fn lengths_count_utf16_units() {
        let mut doc = Doc::new();
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| text.insert(txn, 0, "a😀b").unwrap());
        assert_eq!(text.len(&doc), 4);
        doc.transact(|txn| text.insert(txn, 3, "c").unwrap());
        assert_eq!(text.get_string(&doc), "a😀cb");
    }

    #[test]
    fn formatting_produces_runs() {
        let mut doc = Doc::new();
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| {
            text.insert(txn, 0, "abcdef").unwrap();
            text.format(txn, 2, 2, bold()).unwrap();
        });
        assert_eq!(
            text.diff(&doc),
            vec![run("ab", None), run("cd", Some(bold())), run("ef", None)]
        );

        // typing inside the bold range inherits it
        doc.transact(|txn| text.insert(txn, 3, "X").unwrap());
        assert_eq!(
            text.diff(&doc),
            vec![run("ab", None), run("cXd", Some(bold())), run("ef", None)]
        );

        let mut unbold = Attrs::new();
        unbold.insert(Arc::from("bold"), Any::Null);
        doc.transact(|txn| text.format(txn, 0, 7, unbold).unwrap());
        assert_eq!(text.diff(&doc), vec![run("abcXdef", None)]);
    }

    #[test]
    fn insert_with_attributes_does_not_leak() {
        let mut doc = Doc::new();
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| {
            text.insert(txn, 0, "plain").unwrap();
            text.insert_with_attributes(txn, 5, "!", bold()).unwrap();
            text.insert(txn, 0, "more ").unwrap();
        });
        assert_eq!(
            text.diff(&doc),
            vec![run("more plain", None), run("!", Some(bold()))]
        );
    }

    #[test]
    fn deleting_formatted_range_cleans_gap() {
        let mut doc = Doc::new();
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| {
            text.insert(txn, 0, "abc").unwrap();
            text.format(txn, 1, 1, bold()).unwrap();
        });
        doc.transact(|txn| text.remove_range(txn, 1, 1).unwrap());
        assert_eq!(text.diff(&doc), vec![run("ac", None)]);
        let live_formats = doc
            .store
            .iter_items(text.branch_id())
            .filter(|item| !item.is_deleted())
            .filter(|item| matches!(item.content, crate::content::ItemContent::Format(..)))
            .count();
        assert_eq!(live_formats, 0);
    }

    #[test]
    fn embeds_count_as_one() {
        let mut doc = Doc::new();
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| {
            text.insert(txn, 0, "ab").unwrap();
            text.insert_embed(txn, 1, Any::from("image"), None).unwrap();
        });
        assert_eq!(text.len(&doc), 3);
        assert_eq!(text.get_string(&doc), "ab");
        assert_eq!(text.diff(&doc).len(), 3);
    }

    #[test]
    fn apply_delta_replays_edits() {
        let mut doc = Doc::new();
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| text.insert(txn, 0, "hello").unwrap());
        doc.transact(|txn| {
            text.apply_delta(
                txn,
                vec![
                    Delta::Retain(1, None),
                    Delta::Deleted(3),
                    Delta::Inserted(vec![Value::Any(Any::from("ipp"))], None),
                ],
            )
            .unwrap();
        });
        assert_eq!(text.get_string(&doc), "hippo");
    }

    #[test]
    fn marker_positions_match_a_full_walk() {
        let mut doc = Doc::with_client_id(1);
        let text = doc.get_or_insert_text("t").unwrap();
        let mut expected: Vec<char> = "abcdefghij".repeat(30).chars().collect();
        let initial: String = expected.iter().collect();
        doc.transact(|txn| {
            text.insert(txn, 0, &initial).unwrap();
            text.format(txn, 40, 100, bold()).unwrap();
        });

        let mut seed: u32 = 17;
        for step in 0..300u32 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let at = (seed >> 8) % expected.len() as u32;
            if step % 3 == 2 {
                doc.transact(|txn| text.remove_range(txn, at, 1).unwrap());
                expected.remove(at as usize);
            } else {
                doc.transact(|txn| text.insert(txn, at, "x").unwrap());
                expected.insert(at as usize, 'x');
            }
            if step % 50 == 0 {
                doc.transact(|txn| text.format(txn, at / 2, 3, bold()).unwrap());
            }
            doc.transact(|txn| {
                let len = text.len(&*txn);
                for index in [0, at.min(len), len / 3, len / 2, len] {
                    let seek = Position::seek(txn, text.0, index);
                    let walk = Position::find(txn, text.0, index);
                    assert_eq!((seek.left, seek.right, seek.index), (walk.left, walk.right, walk.index));
                    if seek.exact {
                        assert_eq!(seek.attrs, walk.attrs);
                    }
                }
            });
        }
        assert_eq!(text.get_string(&doc), expected.iter().collect::<String>());
        let markers = doc.store.branch(text.0).markers.as_ref().map_or(0, |m| m.len());
        assert!(markers > 0);
    }

    #[test]
    fn typing_at_the_end_of_a_range_behind_a_marker_inherits_it() {
        let mut doc = Doc::with_client_id(1);
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| text.insert(txn, 0, &"a".repeat(200)).unwrap());
        doc.transact(|txn| text.insert(txn, 150, "x").unwrap());
        doc.transact(|txn| text.format(txn, 100, 50, bold()).unwrap());
        doc.transact(|txn| text.insert(txn, 150, "y").unwrap());

        let mut bolded = "a".repeat(50);
        bolded.push('y');
        let mut tail = String::from("x");
        tail.push_str(&"a".repeat(50));
        assert_eq!(
            text.diff(&doc),
            vec![
                run(&"a".repeat(100), None),
                run(&bolded, Some(bold())),
                run(&tail, None)
            ]
        );
    }
}
