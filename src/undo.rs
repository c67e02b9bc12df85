//! Selective undo and redo of local changes.
//!
//! An [`UndoManager`] watches a set of shared types and records every
//! tracked transaction touching them as a stack item: the clocks it
//! inserted plus the delete set it produced. Undoing deletes the inserted
//! items and re-creates the deleted ones as fresh items; the replaced item
//! points at its copy through `redone`, so later stack items can follow the
//! chain. Items referenced by a stack item carry the keep flag and survive
//! garbage collection until the stack item is dropped.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::block::Item;
use crate::branch::{BranchId, TypePtr};
use crate::content::{ItemContent, TypeContent};
use crate::delete_set::DeleteSet;
use crate::doc::Doc;
use crate::id::{ClientId, Clock, Id};
use crate::observer::SubscriptionId;
use crate::store::Store;
use crate::transaction::{ancestors, Origin, Transaction};
use crate::types::SharedRef;

#[derive(Clone, Debug)]
pub struct UndoOptions {
    /// Transactions committed within this interval of the previous one are
    /// merged into the same stack item.
    pub capture_timeout: Duration,
    /// Origins tracked besides local transactions without an origin.
    pub tracked_origins: Vec<Origin>,
}

impl Default for UndoOptions {
    fn default() -> Self {
        return UndoOptions {
            capture_timeout: Duration::from_millis(500),
            tracked_origins: Vec::new(),
        };
    }
}

/// One undoable step.
#[derive(Clone, Debug, Default)]
struct StackItem {
    insertions: DeleteSet,
    deletions: DeleteSet,
}

#[derive(Debug)]
struct UndoState {
    scope: FxHashSet<BranchId>,
    tracked_origins: FxHashSet<Origin>,
    capture_timeout: Duration,
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    undoing: bool,
    redoing: bool,
    last_change: Option<Instant>,
}

pub struct UndoManager {
    state: Rc<RefCell<UndoState>>,
    origin: Origin,
    subscription: SubscriptionId,
}

impl UndoManager {
    pub fn new<S: SharedRef>(doc: &mut Doc, scope: &S) -> UndoManager {
        return UndoManager::with_options(doc, scope, UndoOptions::default());
    }

    pub fn with_options<S: SharedRef>(doc: &mut Doc, scope: &S, options: UndoOptions) -> UndoManager {
        let origin = Origin::from(OsRng.next_u64());
        let mut tracked_origins: FxHashSet<Origin> = options.tracked_origins.into_iter().collect();
        tracked_origins.insert(origin.clone());
        let state = Rc::new(RefCell::new(UndoState {
            scope: [scope.branch_id()].into_iter().collect(),
            tracked_origins,
            capture_timeout: options.capture_timeout,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            undoing: false,
            redoing: false,
            last_change: None,
        }));
        let shared = state.clone();
        let subscription = doc.observe_after_transaction(move |txn| {
            // a borrow is only held outside of transactions
            if let Ok(mut state) = shared.try_borrow_mut() {
                state.record(txn);
            }
        });
        return UndoManager {
            state,
            origin,
            subscription,
        };
    }

    /// The origin of the transactions this manager runs.
    pub fn origin(&self) -> &Origin {
        return &self.origin;
    }

    /// Also track changes to `scope` and everything nested in it.
    pub fn expand_scope<S: SharedRef>(&self, scope: &S) {
        self.state.borrow_mut().scope.insert(scope.branch_id());
    }

    pub fn include_origin<O: Into<Origin>>(&self, origin: O) {
        self.state.borrow_mut().tracked_origins.insert(origin.into());
    }

    pub fn exclude_origin<O: Into<Origin>>(&self, origin: O) {
        self.state.borrow_mut().tracked_origins.remove(&origin.into());
    }

    pub fn can_undo(&self) -> bool {
        return !self.state.borrow().undo_stack.is_empty();
    }

    pub fn can_redo(&self) -> bool {
        return !self.state.borrow().redo_stack.is_empty();
    }

    /// Make the next tracked change start a new stack item even if it falls
    /// within the capture timeout.
    pub fn stop_capturing(&self) {
        self.state.borrow_mut().last_change = None;
    }

    /// Revert the last stack item. Returns whether anything changed.
    pub fn undo(&self, doc: &mut Doc) -> bool {
        return self.pop(doc, true);
    }

    /// Reapply the last undone stack item. Returns whether anything changed.
    pub fn redo(&self, doc: &mut Doc) -> bool {
        return self.pop(doc, false);
    }

    /// Drop both stacks and release the items they kept alive.
    pub fn clear(&self, doc: &mut Doc) {
        let mut state = self.state.borrow_mut();
        state.clear(&mut doc.store, true, true);
    }

    /// Stop tracking changes.
    pub fn destroy(self, doc: &mut Doc) {
        self.clear(doc);
        doc.unobserve(self.subscription);
    }

    fn pop(&self, doc: &mut Doc, undo: bool) -> bool {
        loop {
            let (item, scope) = {
                let mut state = self.state.borrow_mut();
                let stack = if undo {
                    &mut state.undo_stack
                } else {
                    &mut state.redo_stack
                };
                let Some(item) = stack.pop() else {
                    return false;
                };
                if undo {
                    state.undoing = true;
                } else {
                    state.redoing = true;
                }
                (item, state.scope.clone())
            };
            let performed = doc.transact_with(self.origin.clone(), |txn| apply(txn, &item, &scope));
            {
                let mut state = self.state.borrow_mut();
                state.undoing = false;
                state.redoing = false;
            }
            debug!(undo, performed, "popped undo stack item");
            if performed {
                return true;
            }
        }
    }
}

// =============================================================================
// Recording
// =============================================================================

impl UndoState {
    fn record(&mut self, txn: &mut Transaction<'_>) {
        let tracked = match txn.origin() {
            Some(origin) => self.tracked_origins.contains(origin),
            None => txn.is_local(),
        };
        if !tracked {
            return;
        }
        let store = &txn.doc.store;
        let touches_scope = txn
            .changed_types()
            .any(|branch| ancestors(store, branch).iter().any(|b| self.scope.contains(b)));
        if !touches_scope {
            return;
        }

        if self.undoing {
            self.last_change = None;
        } else if !self.redoing {
            self.clear(&mut txn.doc.store, false, true);
        }

        let mut insertions = DeleteSet::new();
        for (client, end) in txn.after_state().iter() {
            let start = txn.before_state().get(client);
            if *end > start {
                insertions.insert(Id::new(*client, start), end - start);
            }
        }
        let deletions = txn.delete_set().clone();

        let now = Instant::now();
        let within_timeout = self
            .last_change
            .is_some_and(|last| now.duration_since(last) < self.capture_timeout);
        let stack = if self.undoing {
            &mut self.redo_stack
        } else {
            &mut self.undo_stack
        };
        let merge = within_timeout && !self.undoing && !self.redoing;
        match stack.last_mut() {
            Some(last) if merge => {
                last.insertions.merge(&insertions);
                last.deletions.merge(&deletions);
            }
            _ => stack.push(StackItem {
                insertions,
                deletions: deletions.clone(),
            }),
        }
        if !self.undoing && !self.redoing {
            self.last_change = Some(now);
        }

        let store = &mut txn.doc.store;
        for id in items_in(store, &deletions) {
            if store.item(&id).is_some_and(|item| in_scope(store, &self.scope, item)) {
                keep_item(store, id, true);
            }
        }
    }

    fn clear(&mut self, store: &mut Store, undo: bool, redo: bool) {
        let mut dropped = Vec::new();
        if undo {
            dropped.append(&mut self.undo_stack);
        }
        if redo {
            dropped.append(&mut self.redo_stack);
        }
        for item in dropped.iter() {
            for id in items_in(store, &item.deletions) {
                if store.item(&id).is_some_and(|item| in_scope(store, &self.scope, item)) {
                    keep_item(store, id, false);
                }
            }
        }
    }
}

// =============================================================================
// Undo / redo
// =============================================================================

/// Revert one stack item inside `txn`. Returns whether it changed anything.
fn apply(txn: &mut Transaction<'_>, stack_item: &StackItem, scope: &FxHashSet<BranchId>) -> bool {
    let mut to_delete = Vec::new();
    for (client, ranges) in stack_item.insertions.iter() {
        for range in ranges.iter() {
            for mut id in split_range(txn, *client, range.start, range.end) {
                if txn.doc.store.item(&id).is_some_and(|item| item.redone.is_some()) {
                    match follow_redone(txn, id) {
                        Some(target) => id = target,
                        None => continue,
                    }
                }
                let store = &txn.doc.store;
                if let Some(item) = store.item(&id) {
                    if !item.is_deleted() && in_scope(store, scope, item) {
                        to_delete.push(item.id);
                    }
                }
            }
        }
    }

    let mut to_redo: Vec<Id> = Vec::new();
    for (client, ranges) in stack_item.deletions.iter() {
        for range in ranges.iter() {
            for id in split_range(txn, *client, range.start, range.end) {
                let store = &txn.doc.store;
                let Some(item) = store.item(&id) else { continue };
                // created and deleted within the same capture interval
                if stack_item.insertions.is_deleted(&id) {
                    continue;
                }
                if in_scope(store, scope, item) {
                    to_redo.push(item.id);
                }
            }
        }
    }

    let mut performed = false;
    let redo_set: FxHashSet<Id> = to_redo.iter().copied().collect();
    for id in to_redo {
        performed |= redo_item(txn, id, &redo_set, &stack_item.insertions).is_some();
    }
    // children before their parents
    for id in to_delete.into_iter().rev() {
        txn.delete_item(&id);
        performed = true;
    }

    let changed: Vec<BranchId> = txn.changed_types().collect();
    for branch in changed {
        txn.doc.store.clear_markers(branch);
    }
    return performed;
}

/// Re-create the deleted item starting at `id` as a new local item.
/// Returns the id of the copy.
fn redo_item(
    txn: &mut Transaction<'_>,
    id: Id,
    to_redo: &FxHashSet<Id>,
    insertions: &DeleteSet,
) -> Option<Id> {
    let item = txn.doc.store.item(&id)?;
    if let Some(redone) = item.redone {
        txn.clean_start(&redone);
        return Some(redone);
    }
    let origin_left = item.left;
    let has_right = item.right.is_some();
    let parent_sub = item.parent_sub.clone();
    let content = item.content.clone();
    let mut parent = txn.doc.store.parent_of(item)?;

    // the parent has to exist again first
    if let Some(anchor) = txn.doc.store.branch(parent).item {
        let anchor_item = txn.doc.store.item(&anchor)?;
        if anchor_item.is_deleted() {
            let anchor = anchor_item.id;
            if anchor_item.redone.is_none()
                && (!to_redo.contains(&anchor) || redo_item(txn, anchor, to_redo, insertions).is_none())
            {
                return None;
            }
            let mut current = anchor;
            while let Some(redone) = txn.doc.store.item(&current)?.redone {
                txn.clean_start(&redone);
                current = redone;
            }
            parent = txn.doc.store.branch_of_item(&current)?;
        }
    }

    let (left, right) = match parent_sub {
        None => {
            let mut left = None;
            let mut cursor = origin_left;
            while let Some(candidate) = cursor {
                if let Some(found) = trace_into(txn, candidate, parent) {
                    left = txn.doc.store.item(&found).map(Item::last_id);
                    break;
                }
                cursor = txn.doc.store.item(&candidate).and_then(|item| item.left);
            }
            let mut right = None;
            let mut cursor = Some(id);
            while let Some(candidate) = cursor {
                if let Some(found) = trace_into(txn, candidate, parent) {
                    right = Some(found);
                    break;
                }
                cursor = txn.doc.store.item(&candidate).and_then(|item| item.right);
            }
            (left, right)
        }
        Some(ref key) if !has_right => (txn.doc.store.branch(parent).map.get(key).copied(), None),
        Some(_) => {
            // walk over the values this stack item itself overwrote
            let mut current = id;
            loop {
                let Some(next) = txn.doc.store.item(&current)?.right else {
                    break;
                };
                let next_item = txn.doc.store.item(&next)?;
                if next_item.redone.is_none() && !insertions.is_deleted(&next) {
                    debug!(%id, "redo conflicts with a concurrent map write");
                    return None;
                }
                current = next_item.id;
                while let Some(redone) = txn.doc.store.item(&current)?.redone {
                    txn.clean_start(&redone);
                    current = redone;
                }
            }
            (txn.doc.store.item(&current).map(Item::last_id), None)
        }
    };

    let content = match content {
        ItemContent::Type(inner) => ItemContent::Type(TypeContent::new(inner.type_ref)),
        other => other,
    };
    let next = txn.next_id();
    let copy = Item::new(next, left, left, right, right, TypePtr::Branch(parent), parent_sub, content);
    if let Some(item) = txn.doc.store.item_mut(&id) {
        item.redone = Some(next);
    }
    txn.integrate(copy, 0);
    keep_item(&mut txn.doc.store, next, true);
    return Some(next);
}

/// Follow `redone` links from `id` until reaching an item in `parent`.
fn trace_into(txn: &mut Transaction<'_>, id: Id, parent: BranchId) -> Option<Id> {
    let mut current = txn.doc.store.item(&id)?.id;
    loop {
        let item = txn.doc.store.item(&current)?;
        if txn.doc.store.parent_of(item) == Some(parent) {
            return Some(item.id);
        }
        let redone = item.redone?;
        txn.clean_start(&redone);
        current = redone;
    }
}

/// The newest copy of the unit `id`, split so that it starts there.
fn follow_redone(txn: &mut Transaction<'_>, id: Id) -> Option<Id> {
    let mut current = id;
    loop {
        let item = txn.doc.store.item(&current)?;
        let diff = current.clock - item.id.clock;
        let Some(redone) = item.redone else { break };
        current = redone.offset(diff);
    }
    txn.clean_start(&current);
    return Some(current);
}

// =============================================================================
// Helpers
// =============================================================================

/// Split blocks so that `[start, end)` of `client` is covered exactly and
/// return the start ids of the covering items.
fn split_range(txn: &mut Transaction<'_>, client: ClientId, start: Clock, end: Clock) -> Vec<Id> {
    let mut out = Vec::new();
    if start >= end {
        return out;
    }
    txn.clean_start(&Id::new(client, start));
    txn.clean_end(&Id::new(client, end - 1));
    let mut clock = start;
    while clock < end {
        let Some(block) = txn.doc.store.block(&Id::new(client, clock)) else {
            break;
        };
        if let Some(item) = block.as_item() {
            out.push(item.id);
        }
        clock = block.end();
    }
    return out;
}

/// Start ids of the items overlapping `ds`, without splitting.
fn items_in(store: &Store, ds: &DeleteSet) -> Vec<Id> {
    let mut out = Vec::new();
    for (client, ranges) in ds.iter() {
        for range in ranges.iter() {
            let mut clock = range.start;
            while clock < range.end {
                let Some(block) = store.block(&Id::new(*client, clock)) else {
                    break;
                };
                if let Some(item) = block.as_item() {
                    out.push(item.id);
                }
                clock = block.end();
            }
        }
    }
    return out;
}

/// Whether `item` lives in one of the `scope` types or below them.
fn in_scope(store: &Store, scope: &FxHashSet<BranchId>, item: &Item) -> bool {
    let Some(parent) = store.parent_of(item) else {
        return false;
    };
    return ancestors(store, parent).iter().any(|b| scope.contains(b));
}

/// Set the keep flag on an item and every item its parents hang off.
fn keep_item(store: &mut Store, id: Id, keep: bool) {
    let mut current = Some(id);
    while let Some(id) = current {
        let Some(item) = store.item_mut(&id) else { break };
        if item.is_keep() == keep {
            break;
        }
        item.set_keep(keep);
        let parent = item.parent.clone();
        current = match parent {
            TypePtr::Branch(parent) => store.branch(parent).item,
            _ => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::any::Any;
    use crate::value::Value;

    fn manager<S: SharedRef>(doc: &mut Doc, scope: &S) -> UndoManager {
        let options = UndoOptions {
            capture_timeout: Duration::ZERO,
            ..UndoOptions::default()
        };
        return UndoManager::with_options(doc, scope, options);
    }

    #[test]
    fn text_undo_redo() {
        let mut doc = Doc::with_client_id(1);
        let text = doc.get_or_insert_text("t").unwrap();
        let undo = manager(&mut doc, &text);
        doc.transact(|txn| text.insert(txn, 0, "hello").unwrap());
        doc.transact(|txn| text.insert(txn, 5, " world").unwrap());
        assert!(undo.can_undo());

        assert!(undo.undo(&mut doc));
        assert_eq!(text.get_string(&doc), "hello");
        assert!(undo.undo(&mut doc));
        assert_eq!(text.get_string(&doc), "");
        assert!(!undo.undo(&mut doc));

        assert!(undo.redo(&mut doc));
        assert_eq!(text.get_string(&doc), "hello");
        assert!(undo.redo(&mut doc));
        assert_eq!(text.get_string(&doc), "hello world");
        assert!(!undo.can_redo());
    }

    #[test]
    fn changes_within_timeout_are_merged() {
        let mut doc = Doc::with_client_id(1);
        let text = doc.get_or_insert_text("t").unwrap();
        let undo = UndoManager::with_options(
            &mut doc,
            &text,
            UndoOptions {
                capture_timeout: Duration::from_secs(3600),
                ..UndoOptions::default()
            },
        );
        doc.transact(|txn| text.insert(txn, 0, "a").unwrap());
        doc.transact(|txn| text.insert(txn, 1, "b").unwrap());
        undo.stop_capturing();
        doc.transact(|txn| text.insert(txn, 2, "c").unwrap());

        undo.undo(&mut doc);
        assert_eq!(text.get_string(&doc), "ab");
        undo.undo(&mut doc);
        assert_eq!(text.get_string(&doc), "");
    }

    #[test]
    fn map_values_are_restored() {
        let mut doc = Doc::with_client_id(1);
        let map = doc.get_or_insert_map("m").unwrap();
        let undo = manager(&mut doc, &map);
        doc.transact(|txn| map.insert(txn, "k", 1.0));
        doc.transact(|txn| map.insert(txn, "k", 2.0));

        undo.undo(&mut doc);
        assert_eq!(map.get(&doc, "k"), Some(Value::Any(Any::Number(1.0))));
        undo.undo(&mut doc);
        assert_eq!(map.get(&doc, "k"), None);
        undo.redo(&mut doc);
        assert_eq!(map.get(&doc, "k"), Some(Value::Any(Any::Number(1.0))));
        undo.redo(&mut doc);
        assert_eq!(map.get(&doc, "k"), Some(Value::Any(Any::Number(2.0))));
    }

    #[test]
    fn remote_changes_are_not_undone() {
        let mut local = Doc::with_client_id(1);
        let mut remote = Doc::with_client_id(2);
        let text = local.get_or_insert_text("t").unwrap();
        let remote_text = remote.get_or_insert_text("t").unwrap();
        let undo = manager(&mut local, &text);

        remote.transact(|txn| remote_text.insert(txn, 0, "remote ").unwrap());
        local.apply_update(remote.diff_update(&local.state_vector()));
        assert!(!undo.can_undo());

        local.transact(|txn| text.insert(txn, 7, "local").unwrap());
        assert_eq!(text.get_string(&local), "remote local");
        undo.undo(&mut local);
        assert_eq!(text.get_string(&local), "remote ");
    }

    #[test]
    fn untracked_origins_are_ignored() {
        let mut doc = Doc::with_client_id(1);
        let array = doc.get_or_insert_array("a").unwrap();
        let undo = manager(&mut doc, &array);
        doc.transact_with("sync", |txn| array.push_back(txn, 1.0));
        assert!(!undo.can_undo());
        undo.include_origin("sync");
        doc.transact_with("sync", |txn| array.push_back(txn, 2.0));
        assert!(undo.can_undo());
        undo.undo(&mut doc);
        assert_eq!(array.len(&doc), 1);
    }

    #[test]
    fn new_edits_drop_the_redo_stack() {
        let mut doc = Doc::with_client_id(1);
        let text = doc.get_or_insert_text("t").unwrap();
        let undo = manager(&mut doc, &text);
        doc.transact(|txn| text.insert(txn, 0, "a").unwrap());
        undo.undo(&mut doc);
        assert!(undo.can_redo());
        doc.transact(|txn| text.insert(txn, 0, "b").unwrap());
        assert!(!undo.can_redo());
        undo.clear(&mut doc);
        assert!(!undo.can_undo());
    }

    #[test]
    fn kept_content_survives_collection() {
        let mut doc = Doc::with_client_id(1);
        let array = doc.get_or_insert_array("a").unwrap();
        let undo = manager(&mut doc, &array);
        doc.transact(|txn| array.insert_range(txn, 0, ["x", "y"]).unwrap());
        doc.transact(|txn| array.remove(txn, 0).unwrap());
        undo.undo(&mut doc);
        let values: Vec<String> = array.iter(&doc).map(|v| v.to_string()).collect();
        assert_eq!(values, vec!["x", "y"]);
    }
}
