//! Transactions and the commit pipeline.
//!
//! Every mutation runs inside a [`Transaction`] obtained from
//! [`Doc::transact`](crate::Doc::transact). The closure form makes nesting
//! impossible: a body that wants to mutate further simply keeps using the
//! transaction it was given. Committing then runs, in order:
//!
//! 1. delete set squash and the after-state snapshot
//! 2. shallow observers, then deep observers (children before parents)
//! 3. after-transaction observers
//! 4. garbage collection and block merging
//! 5. client id collision check for remote transactions
//! 6. update events (v1 and v2) and sub-document events
//!
//! Observers receive a fresh follow-up transaction. Whatever they change is
//! committed after the current transaction, never nested inside it.

use std::fmt;
use std::mem;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::branch::{BranchId, TypePtr};
use crate::content::SubdocRef;
use crate::delete_set::DeleteSet;
use crate::doc::Doc;
use crate::event::Event;
use crate::id::{random_client_id, ClientId, Id};
use crate::observer::{guarded, SubdocsEvent, UpdateEvent};
use crate::state_vector::StateVector;
use crate::store::Store;
use crate::update::Update;

// =============================================================================
// Origin
// =============================================================================

/// Opaque tag describing who started a transaction. Compared bytewise.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Origin(SmallVec<[u8; 16]>);

impl Origin {
    pub fn as_bytes(&self) -> &[u8] {
        return &self.0;
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Origin({:?})", s),
            Err(_) => write!(f, "Origin({:?})", self.0.as_slice()),
        }
    }
}

impl From<&str> for Origin {
    fn from(value: &str) -> Self {
        return Origin(SmallVec::from_slice(value.as_bytes()));
    }
}

impl From<String> for Origin {
    fn from(value: String) -> Self {
        return Origin::from(value.as_str());
    }
}

impl From<&[u8]> for Origin {
    fn from(value: &[u8]) -> Self {
        return Origin(SmallVec::from_slice(value));
    }
}

impl From<u64> for Origin {
    fn from(value: u64) -> Self {
        return Origin(SmallVec::from_slice(&value.to_be_bytes()));
    }
}

// =============================================================================
// Read access
// =============================================================================

/// Anything that can read document state: a [`Doc`] between transactions
/// or a [`Transaction`] in progress.
pub trait ReadTxn {
    #[doc(hidden)]
    fn store(&self) -> &Store;

    fn state_vector(&self) -> StateVector {
        return self.store().state_vector();
    }

    fn client_id(&self) -> ClientId {
        return self.store().client_id;
    }
}

impl ReadTxn for Doc {
    fn store(&self) -> &Store {
        return &self.store;
    }
}

impl ReadTxn for Transaction<'_> {
    fn store(&self) -> &Store {
        return &self.doc.store;
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    pub before_state: StateVector,
    pub after_state: StateVector,
    /// Everything deleted by this transaction.
    pub delete_set: DeleteSet,
    /// Types whose content changed, with the changed map keys (`None` for
    /// sequence changes).
    pub changed: FxHashMap<BranchId, FxHashSet<Option<Arc<str>>>>,
    /// Start ids of blocks created by mid-transaction splits.
    pub merge_blocks: Vec<Id>,
    pub origin: Option<Origin>,
    pub local: bool,
    pub subdocs: SubdocsEvent,
}

impl TransactionState {
    fn new(before_state: StateVector, origin: Option<Origin>, local: bool) -> TransactionState {
        return TransactionState {
            before_state,
            origin,
            local,
            ..TransactionState::default()
        };
    }

    /// Whether anything was written since `before_state`, given the
    /// document's `current` state.
    fn has_changes(&self, current: &StateVector) -> bool {
        return !self.delete_set.is_empty()
            || !self.changed.is_empty()
            || !self.subdocs.is_empty()
            || current != &self.before_state;
    }
}

pub struct Transaction<'doc> {
    pub(crate) doc: &'doc mut Doc,
    pub(crate) state: TransactionState,
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn new(doc: &'doc mut Doc, origin: Option<Origin>, local: bool) -> Transaction<'doc> {
        let before_state = doc.store.state_vector();
        return Transaction {
            doc,
            state: TransactionState::new(before_state, origin, local),
        };
    }

    pub fn doc(&self) -> &Doc {
        return self.doc;
    }

    pub fn origin(&self) -> Option<&Origin> {
        return self.state.origin.as_ref();
    }

    /// Whether the changes were made on this replica (as opposed to being
    /// received in an update).
    pub fn is_local(&self) -> bool {
        return self.state.local;
    }

    pub fn before_state(&self) -> &StateVector {
        return &self.state.before_state;
    }

    /// Only meaningful once the commit started (in after-transaction
    /// observers).
    pub fn after_state(&self) -> &StateVector {
        return &self.state.after_state;
    }

    pub fn delete_set(&self) -> &DeleteSet {
        return &self.state.delete_set;
    }

    pub fn changed_types(&self) -> impl Iterator<Item = BranchId> + '_ {
        return self.state.changed.keys().copied();
    }

    /// Id for the next locally created item.
    pub(crate) fn next_id(&self) -> Id {
        let client = self.doc.store.client_id;
        return Id::new(client, self.doc.store.get_state(&client));
    }

    /// Whether `id` was created by this transaction.
    pub(crate) fn has_added(&self, id: &Id) -> bool {
        return id.clock >= self.state.before_state.get(&id.client);
    }

    /// Split so that a block starts at `id`; remembers the split for the
    /// merge pass. Returns the block index.
    pub(crate) fn clean_start(&mut self, id: &Id) -> Option<usize> {
        let (idx, split) = self.doc.store.clean_start(id)?;
        if split {
            self.state.merge_blocks.push(*id);
        }
        return Some(idx);
    }

    /// Split so that a block ends at `id`.
    pub(crate) fn clean_end(&mut self, id: &Id) -> Option<usize> {
        let (idx, split) = self.doc.store.clean_end(id)?;
        if split {
            self.state.merge_blocks.push(id.offset(1));
        }
        return Some(idx);
    }

    /// Record that `branch` changed. Types created in this transaction or
    /// already deleted are not reported.
    pub(crate) fn add_changed_type(&mut self, branch: BranchId, key: Option<Arc<str>>) {
        let anchor = self.doc.store.branch(branch).item;
        let report = match anchor {
            None => true,
            Some(id) => {
                !self.has_added(&id)
                    && self.doc.store.item(&id).is_some_and(|item| !item.is_deleted())
            }
        };
        if report {
            self.state.changed.entry(branch).or_default().insert(key);
        }
    }

    pub(crate) fn add_subdoc(&mut self, doc: SubdocRef) {
        if doc.should_load() {
            self.state.subdocs.loaded.push(doc.clone());
        }
        self.state.subdocs.added.push(doc);
    }

    pub(crate) fn remove_subdoc(&mut self, doc: SubdocRef) {
        self.state.subdocs.added.retain(|d| d.guid != doc.guid);
        self.state.subdocs.loaded.retain(|d| d.guid != doc.guid);
        self.state.subdocs.removed.push(doc);
    }

    /// The update describing this transaction's changes.
    pub fn update(&self) -> Update {
        let mut update = self.doc.store.blocks_since(&self.state.before_state);
        let after = self.doc.store.state_vector();
        for (client, blocks) in update.blocks.iter_mut() {
            let end = if self.state.after_state.is_empty() {
                after.get(client)
            } else {
                self.state.after_state.get(client)
            };
            blocks.retain(|b| b.id().clock < end);
            if let Some(last) = blocks.last_mut() {
                if last.end() > end {
                    last.truncate(end - last.id().clock);
                }
            }
        }
        update.blocks.retain(|_, blocks| !blocks.is_empty());
        let mut ds = self.state.delete_set.clone();
        ds.squash();
        update.delete_set = ds;
        return update;
    }

    pub fn encode_update_v1(&self) -> Vec<u8> {
        return self.update().encode_v1();
    }

    pub fn encode_update_v2(&self) -> Vec<u8> {
        return self.update().encode_v2();
    }

    // =========================================================================
    // Commit
    // =========================================================================

    pub(crate) fn run_before_hooks(&mut self) {
        let mut handlers = mem::take(&mut self.doc.observers.before_transaction);
        for callback in handlers.iter_mut() {
            guarded("before_transaction", || callback(self));
        }
        self.doc.observers.before_transaction.restore(handlers);
    }

    /// Commit this transaction and every follow-up its observers caused,
    /// then notify after-all observers.
    pub(crate) fn commit(self) {
        let Transaction { doc, state } = self;
        let mut next = Some(state);
        while let Some(state) = next.take() {
            next = Transaction { doc: &mut *doc, state }.cleanup();
        }
        let mut handlers = mem::take(&mut doc.observers.after_all_transactions);
        for callback in handlers.iter_mut() {
            guarded("after_all_transactions", || callback(doc));
        }
        doc.observers.after_all_transactions.restore(handlers);
    }

    /// Run the commit pipeline. Returns the follow-up transaction state if
    /// observers changed the document.
    fn cleanup(mut self) -> Option<TransactionState> {
        self.state.delete_set.squash();
        self.state.after_state = self.doc.store.state_vector();
        if !self.state.local {
            let changed: Vec<BranchId> = self.state.changed.keys().copied().collect();
            for branch in changed {
                self.doc.store.clear_markers(branch);
            }
        }

        let (events, deep) = self.collect_events();
        let follow = if events.is_empty() {
            None
        } else {
            Some(self.dispatch_events(events, deep))
        };

        let mut handlers = mem::take(&mut self.doc.observers.after_transaction);
        for callback in handlers.iter_mut() {
            guarded("after_transaction", || callback(&mut self));
        }
        self.doc.observers.after_transaction.restore(handlers);

        if self.doc.options.gc {
            self.collect_garbage();
        }
        self.merge_blocks();
        self.check_client_id();
        self.emit_updates();
        self.emit_subdocs();

        let current = self.doc.store.state_vector();
        return follow.filter(|state| state.has_changes(&current));
    }

    /// Build the events of every changed type somebody listens to. Deep
    /// event lists are keyed by the observed ancestor and hold indices into
    /// the event list.
    fn collect_events(&self) -> (Vec<Event>, FxHashMap<BranchId, Vec<usize>>) {
        let store = &self.doc.store;
        let observers = &self.doc.observers;
        let mut events = Vec::new();
        let mut deep: FxHashMap<BranchId, Vec<usize>> = FxHashMap::default();
        if observers.types.is_empty() && observers.deep.is_empty() {
            return (events, deep);
        }
        let mut changed: Vec<_> = self.state.changed.iter().collect();
        changed.sort_by_key(|(branch, _)| **branch);
        for (branch, keys) in changed {
            if let Some(anchor) = store.branch(*branch).item {
                if store.item(&anchor).is_none_or(|item| item.is_deleted()) {
                    continue;
                }
            }
            let ancestors = ancestors(store, *branch);
            let shallow = observers.types.get(branch).is_some_and(|h| !h.is_empty());
            let deep_observed = ancestors
                .iter()
                .any(|a| observers.deep.get(a).is_some_and(|h| !h.is_empty()));
            if !shallow && !deep_observed {
                continue;
            }
            let index = events.len();
            events.push(Event::new(self, *branch, keys));
            for ancestor in ancestors {
                deep.entry(ancestor).or_default().push(index);
            }
        }
        return (events, deep);
    }

    fn dispatch_events(
        &mut self,
        events: Vec<Event>,
        deep: FxHashMap<BranchId, Vec<usize>>,
    ) -> TransactionState {
        let store = &self.doc.store;
        let mut deep_lists: Vec<(BranchId, Vec<Event>)> = Vec::new();
        for (ancestor, indices) in deep {
            if !self.doc.observers.deep.contains_key(&ancestor) {
                continue;
            }
            let mut list: Vec<Event> = indices
                .into_iter()
                .map(|i| {
                    let mut event = events[i].clone();
                    event.path = Event::path_between(store, ancestor, event.target);
                    event
                })
                .collect();
            list.sort_by_key(|e| e.path.len());
            deep_lists.push((ancestor, list));
        }
        deep_lists.sort_by_key(|(ancestor, _)| *ancestor);

        let origin = self.state.origin.clone();
        let local = self.state.local;
        let mut follow = Transaction::new(&mut *self.doc, origin, local);
        for event in events.iter() {
            let Some(mut handlers) = follow.doc.observers.types.remove(&event.target) else {
                continue;
            };
            for callback in handlers.iter_mut() {
                guarded("observe", || callback(&mut follow, event));
            }
            follow
                .doc
                .observers
                .types
                .entry(event.target)
                .or_default()
                .restore(handlers);
        }
        for (ancestor, list) in deep_lists.iter() {
            let Some(mut handlers) = follow.doc.observers.deep.remove(ancestor) else {
                continue;
            };
            for callback in handlers.iter_mut() {
                guarded("observe_deep", || callback(&mut follow, list));
            }
            follow
                .doc
                .observers
                .deep
                .entry(*ancestor)
                .or_default()
                .restore(handlers);
        }
        return follow.state;
    }

    /// Merge blocks that became adjacent: deleted ranges, everything
    /// written by this transaction and mid-transaction splits.
    fn merge_blocks(&mut self) {
        let store = &mut self.doc.store;
        let mut merged = 0usize;
        for (client, ranges) in self.state.delete_set.iter() {
            for range in ranges.iter().rev() {
                let Some(blocks) = store.blocks.get(client) else { break };
                let Some(last) = blocks.find_pivot(range.end - 1) else {
                    continue;
                };
                let mut si = (blocks.len() - 1).min(last + 1);
                loop {
                    let Some(block) = store.block_at(client, si) else { break };
                    if si == 0 || block.id().clock < range.start {
                        break;
                    }
                    let n = store.try_merge_with_lefts(client, si);
                    merged += n;
                    si = si.saturating_sub(1 + n);
                }
            }
        }
        for (client, clock) in self.state.after_state.iter() {
            let before = self.state.before_state.get(client);
            if before == *clock {
                continue;
            }
            let Some(blocks) = store.blocks.get(client) else {
                continue;
            };
            let first = blocks.find_pivot(before).unwrap_or(0).max(1);
            let mut i = blocks.len() as isize - 1;
            while i >= first as isize {
                let n = store.try_merge_with_lefts(client, i as usize);
                merged += n;
                i -= 1 + n as isize;
            }
        }
        for id in self.state.merge_blocks.iter().rev() {
            let Some(pos) = store.find_index(id) else {
                continue;
            };
            let len = store.blocks.get(&id.client).map_or(0, |b| b.len());
            if pos + 1 < len {
                let n = store.try_merge_with_lefts(&id.client, pos + 1);
                merged += n;
                if n > 1 {
                    continue;
                }
            }
            if pos > 0 {
                merged += store.try_merge_with_lefts(&id.client, pos);
            }
        }
        if merged > 0 {
            trace!(merged, "merged adjacent blocks");
        }
    }

    /// A remote transaction that advanced our own client means somebody
    /// else writes under our id: pick a new one.
    fn check_client_id(&mut self) {
        let client = self.doc.store.client_id;
        if self.state.local
            || self.state.after_state.get(&client) == self.state.before_state.get(&client)
        {
            return;
        }
        let fresh = random_client_id();
        warn!(old = client, new = fresh, "client id collision, switching to a new client id");
        self.doc.store.client_id = fresh;
    }

    fn emit_updates(&mut self) {
        let observers = &self.doc.observers;
        if observers.update_v1.is_empty() && observers.update_v2.is_empty() {
            return;
        }
        let changed = !self.state.delete_set.is_empty()
            || self
                .state
                .after_state
                .iter()
                .any(|(client, clock)| self.state.before_state.get(client) != *clock);
        if !changed {
            return;
        }
        let update = self.update();
        let origin = self.state.origin.clone();
        if !self.doc.observers.update_v1.is_empty() {
            let event = UpdateEvent {
                update: update.encode_v1(),
                origin: origin.clone(),
            };
            let mut handlers = mem::take(&mut self.doc.observers.update_v1);
            for callback in handlers.iter_mut() {
                guarded("update_v1", || callback(&event));
            }
            self.doc.observers.update_v1.restore(handlers);
        }
        if !self.doc.observers.update_v2.is_empty() {
            let event = UpdateEvent {
                update: update.encode_v2(),
                origin,
            };
            let mut handlers = mem::take(&mut self.doc.observers.update_v2);
            for callback in handlers.iter_mut() {
                guarded("update_v2", || callback(&event));
            }
            self.doc.observers.update_v2.restore(handlers);
        }
    }

    fn emit_subdocs(&mut self) {
        if self.state.subdocs.is_empty() || self.doc.observers.subdocs.is_empty() {
            return;
        }
        let event = mem::take(&mut self.state.subdocs);
        let mut handlers = mem::take(&mut self.doc.observers.subdocs);
        for callback in handlers.iter_mut() {
            guarded("subdocs", || callback(&event));
        }
        self.doc.observers.subdocs.restore(handlers);
    }
}

/// `branch` and every type it is nested in, innermost first.
pub(crate) fn ancestors(store: &Store, branch: BranchId) -> Vec<BranchId> {
    let mut out = vec![branch];
    let mut current = branch;
    while let Some(anchor) = store.branch(current).item {
        let Some(item) = store.item(&anchor) else { break };
        match item.parent {
            TypePtr::Branch(parent) => {
                out.push(parent);
                current = parent;
            }
            _ => break,
        }
    }
    return out;
}
