//! Integration of items into a store, deletion, and update application.
//!
//! Integration places an item relative to its creation-time neighbours
//! (`origin` and `right_origin`) so that concurrent inserts at the same
//! position end up in the same order on every replica:
//!
//! - items with the same origin are ordered by client id (lower first)
//! - an item whose origin lies among the already scanned conflicting items
//!   was inserted into that run and stays to its right
//! - anything else ends the scan
//!
//! Remote blocks whose dependencies are missing are parked as a pending
//! update and retried once the store has advanced far enough.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::block::{Block, BlockRange, Item};
use crate::branch::{BranchId, TypePtr};
use crate::content::ItemContent;
use crate::delete_set::DeleteSet;
use crate::error::Result;
use crate::id::{ClientId, Clock, Id};
use crate::state_vector::StateVector;
use crate::store::Store;
use crate::transaction::Transaction;
use crate::update::{PendingUpdate, Update};

/// Start id of the leftmost item of a map slot's history.
fn map_leftmost(store: &Store, branch: BranchId, key: &str) -> Option<Id> {
    let last = store.branch(branch).map.get(key)?;
    let mut current = store.item(last)?;
    while let Some(left) = current.left {
        current = store.item(&left)?;
    }
    return Some(current.id);
}

impl<'doc> Transaction<'doc> {
    // =========================================================================
    // Items
    // =========================================================================

    /// Resolve the neighbours and parent of a remote item. Returns the
    /// client whose blocks are needed first if a dependency is missing.
    pub(crate) fn get_missing(&mut self, item: &mut Item) -> Option<ClientId> {
        let store = &self.doc.store;
        let unknown = |id: &Id| id.client != item.id.client && id.clock >= store.get_state(&id.client);
        if let Some(origin) = item.origin.filter(|o| unknown(o)) {
            return Some(origin.client);
        }
        if let Some(right) = item.right_origin.filter(|o| unknown(o)) {
            return Some(right.client);
        }
        if let TypePtr::Id(parent) = &item.parent {
            if unknown(parent) {
                return Some(parent.client);
            }
        }

        let mut collected = false;
        if let Some(origin) = item.origin {
            self.clean_end(&origin);
            item.left = Some(origin);
            collected |= self.doc.store.block(&origin).is_some_and(Block::is_gc);
        }
        if let Some(right) = item.right_origin {
            self.clean_start(&right);
            item.right = Some(right);
            collected |= self.doc.store.block(&right).is_some_and(Block::is_gc);
        }

        let store = &mut self.doc.store;
        if collected {
            item.parent = TypePtr::Unknown;
            return None;
        }
        match item.parent.clone() {
            TypePtr::Unknown => {
                let neighbour = item
                    .left
                    .and_then(|id| store.item(&id))
                    .or_else(|| item.right.and_then(|id| store.item(&id)));
                if let Some(n) = neighbour {
                    item.parent = n.parent.clone();
                    item.parent_sub = n.parent_sub.clone();
                }
            }
            TypePtr::Named(name) => {
                item.parent = match store.resolve_parent(&TypePtr::Named(name)) {
                    Some(branch) => TypePtr::Branch(branch),
                    None => TypePtr::Unknown,
                };
            }
            TypePtr::Id(id) => {
                item.parent = match store.branch_of_item(&id) {
                    Some(branch) => TypePtr::Branch(branch),
                    None => TypePtr::Unknown,
                };
            }
            TypePtr::Branch(_) => {}
        }
        return None;
    }

    /// Integrate a block whose first `offset` units are already known.
    fn integrate_block(&mut self, block: Block, offset: u32) {
        match block {
            Block::Item(item) => self.integrate(*item, offset),
            Block::Gc(mut range) => {
                range.id.clock += offset;
                range.len -= offset;
                self.doc.store.push_block(Block::Gc(range));
            }
            Block::Skip(_) => {}
        }
    }

    /// Link `item` into its parent and append it to the store.
    pub(crate) fn integrate(&mut self, mut item: Item, offset: u32) {
        if offset > 0 {
            let left = Id::new(item.id.client, item.id.clock + offset - 1);
            self.clean_end(&left);
            item = item.split(offset);
        }
        let TypePtr::Branch(parent) = item.parent else {
            // parent unreachable: keep the clock range reserved
            self.doc.store.push_block(Block::Gc(BlockRange::new(item.id, item.len)));
            return;
        };

        let store = &mut self.doc.store;
        let needs_scan = match item.left {
            None => match item.right {
                None => true,
                Some(right) => store.item(&right).is_some_and(|r| r.left.is_some()),
            },
            Some(left) => store.item(&left).map(|l| l.right) != Some(item.right),
        };
        if needs_scan {
            let mut left = item.left;
            let mut o = match (left, item.parent_sub.as_deref()) {
                (Some(l), _) => store.item(&l).and_then(|l| l.right),
                (None, Some(key)) => map_leftmost(store, parent, key),
                (None, None) => store.branch(parent).start,
            };
            let mut conflicting: FxHashSet<Id> = FxHashSet::default();
            let mut before_origin: FxHashSet<Id> = FxHashSet::default();
            while let Some(oid) = o {
                if Some(oid) == item.right {
                    break;
                }
                let Some(other) = store.item(&oid) else { break };
                before_origin.insert(oid);
                conflicting.insert(oid);
                if item.origin == other.origin {
                    if other.id.client < item.id.client {
                        left = Some(other.last_id());
                        conflicting.clear();
                    } else if item.right_origin == other.right_origin {
                        // same neighbours, higher client: we go first
                        break;
                    }
                } else {
                    let origin_start = other.origin.and_then(|x| store.block(&x)).map(Block::id);
                    match origin_start {
                        Some(start) if before_origin.contains(&start) => {
                            if !conflicting.contains(&start) {
                                left = Some(other.last_id());
                                conflicting.clear();
                            }
                        }
                        _ => break,
                    }
                }
                o = other.right;
            }
            item.left = left;
        }

        // reconnect
        if let Some(left) = item.left {
            if let Some(l) = store.item_mut(&left) {
                item.right = l.right;
                l.right = Some(item.id);
            }
        } else {
            item.right = match item.parent_sub.as_deref() {
                Some(key) => map_leftmost(store, parent, key),
                None => {
                    let branch = store.branch_mut(parent);
                    let start = branch.start;
                    branch.start = Some(item.id);
                    start
                }
            };
        }
        let mut shadowed = None;
        if let Some(right) = item.right {
            if let Some(r) = store.item_mut(&right) {
                r.left = Some(item.last_id());
            }
        } else if let Some(key) = item.parent_sub.clone() {
            store.branch_mut(parent).map.insert(key, item.last_id());
            shadowed = item.left;
        }
        if item.parent_sub.is_none() && item.is_countable() && !item.is_deleted() {
            store.branch_mut(parent).content_len += item.len;
        }

        let mut subdoc = None;
        match &mut item.content {
            ItemContent::Type(content) => {
                if content.branch.is_none() {
                    content.branch = Some(store.new_branch(content.type_ref.clone(), Some(item.id)));
                }
            }
            ItemContent::Doc(doc) => subdoc = Some(doc.clone()),
            _ => {}
        }

        let id = item.id;
        let parent_sub = item.parent_sub.clone();
        let dead_on_arrival = parent_sub.is_some() && item.right.is_some();
        store.push_block(Block::Item(Box::new(item)));

        if let Some(doc) = subdoc {
            self.add_subdoc(doc);
        }
        if let Some(left) = shadowed {
            self.delete_item(&left);
        }
        self.add_changed_type(parent, parent_sub);
        let parent_deleted = self
            .doc
            .store
            .branch(parent)
            .item
            .and_then(|anchor| self.doc.store.item(&anchor))
            .is_some_and(|anchor| anchor.is_deleted());
        if parent_deleted || dead_on_arrival {
            self.delete_item(&id);
        }
    }

    /// Mark the item containing `id` deleted. Nested types are deleted
    /// recursively. Returns false if it already was.
    pub(crate) fn delete_item(&mut self, id: &Id) -> bool {
        let store = &mut self.doc.store;
        let Some(item) = store.item_mut(id) else {
            return false;
        };
        if item.is_deleted() {
            return false;
        }
        let counted = item.content_len();
        item.mark_deleted();
        let start = item.id;
        let len = item.len;
        let parent = item.parent.clone();
        let parent_sub = item.parent_sub.clone();
        let (nested, subdoc) = match &item.content {
            ItemContent::Type(t) => (t.branch, None),
            ItemContent::Doc(doc) => (None, Some(doc.clone())),
            _ => (None, None),
        };
        if let TypePtr::Branch(branch) = parent {
            if parent_sub.is_none() {
                store.branch_mut(branch).content_len -= counted;
            }
        }
        self.state.delete_set.insert(start, len);
        if let TypePtr::Branch(branch) = parent {
            self.add_changed_type(branch, parent_sub);
        }
        if let Some(branch) = nested {
            self.delete_children(branch);
        }
        if let Some(doc) = subdoc {
            self.remove_subdoc(doc);
        }
        return true;
    }

    fn delete_children(&mut self, branch: BranchId) {
        let mut next = self.doc.store.branch(branch).start;
        while let Some(id) = next {
            let Some(item) = self.doc.store.item(&id) else { break };
            next = item.right;
            if !item.is_deleted() {
                self.delete_item(&id);
            } else if self.state.before_state.contains(&id) {
                self.state.merge_blocks.push(id);
            }
        }
        let slots: Vec<Id> = self.doc.store.branch(branch).map.values().copied().collect();
        for last in slots {
            let Some(item) = self.doc.store.item(&last) else {
                continue;
            };
            let start = item.id;
            if !item.is_deleted() {
                self.delete_item(&start);
            } else if self.state.before_state.contains(&start) {
                self.state.merge_blocks.push(start);
            }
        }
        self.state.changed.remove(&branch);
    }

    // =========================================================================
    // Remote updates
    // =========================================================================

    /// Integrate as many blocks as possible. What cannot be integrated yet
    /// is returned with the lowest missing clock per client.
    fn integrate_blocks(&mut self, blocks: FxHashMap<ClientId, Vec<Block>>) -> Option<PendingUpdate> {
        let mut refs: FxHashMap<ClientId, VecDeque<Block>> = blocks
            .into_iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(client, b)| (client, VecDeque::from(b)))
            .collect();
        let mut clients: Vec<ClientId> = refs.keys().copied().collect();
        clients.sort_unstable();

        fn next_target(
            clients: &mut Vec<ClientId>,
            refs: &FxHashMap<ClientId, VecDeque<Block>>,
        ) -> Option<ClientId> {
            while let Some(&client) = clients.last() {
                if refs.get(&client).is_some_and(|r| !r.is_empty()) {
                    return Some(client);
                }
                clients.pop();
            }
            return None;
        }

        let mut current = next_target(&mut clients, &refs)?;
        let mut head = refs.get_mut(&current)?.pop_front()?;
        let mut stack: Vec<Block> = Vec::new();
        let mut rest: FxHashMap<ClientId, Vec<Block>> = FxHashMap::default();
        let mut missing = StateVector::new();
        let mut state: FxHashMap<ClientId, Clock> = FxHashMap::default();

        let mut park = |stack: &mut Vec<Block>,
                        refs: &mut FxHashMap<ClientId, VecDeque<Block>>,
                        clients: &mut Vec<ClientId>| {
            for block in stack.drain(..) {
                let client = block.id().client;
                let parked = rest.entry(client).or_default();
                parked.push(block);
                if let Some(remaining) = refs.remove(&client) {
                    parked.extend(remaining);
                }
                clients.retain(|c| *c != client);
            }
        };

        loop {
            if !head.is_skip() {
                let id = head.id();
                let local = *state
                    .entry(id.client)
                    .or_insert_with(|| self.doc.store.get_state(&id.client));
                if id.clock > local {
                    missing.set_min(id.client, id.clock - 1);
                    stack.push(head);
                    park(&mut stack, &mut refs, &mut clients);
                } else {
                    let offset = local - id.clock;
                    let dependency = match &mut head {
                        Block::Item(item) => self.get_missing(item),
                        _ => None,
                    };
                    if let Some(dep) = dependency {
                        stack.push(head);
                        match refs.get_mut(&dep).and_then(|r| r.pop_front()) {
                            Some(next) => {
                                head = next;
                                continue;
                            }
                            None => {
                                missing.set_min(dep, self.doc.store.get_state(&dep));
                                park(&mut stack, &mut refs, &mut clients);
                            }
                        }
                    } else if offset == 0 || offset < head.len() {
                        let end = head.end();
                        self.integrate_block(head, offset);
                        state.insert(id.client, end);
                    }
                }
            }
            if let Some(next) = stack.pop() {
                head = next;
            } else if let Some(next) = refs.get_mut(&current).and_then(|r| r.pop_front()) {
                head = next;
            } else {
                match next_target(&mut clients, &refs) {
                    Some(client) => {
                        current = client;
                        match refs.get_mut(&client).and_then(|r| r.pop_front()) {
                            Some(next) => head = next,
                            None => break,
                        }
                    }
                    None => break,
                }
            }
        }

        if rest.is_empty() {
            return None;
        }
        for blocks in rest.values_mut() {
            blocks.sort_by_key(|b| b.id().clock);
        }
        return Some(PendingUpdate {
            update: Update {
                blocks: rest,
                delete_set: DeleteSet::new(),
            },
            missing,
        });
    }

    /// Delete every range of `ds` this store already has. Returns the
    /// ranges that refer to blocks not received yet.
    pub(crate) fn apply_delete_set(&mut self, ds: &DeleteSet) -> DeleteSet {
        let mut unapplied = DeleteSet::new();
        let ranges: Vec<(ClientId, Vec<_>)> = ds
            .iter()
            .map(|(client, ranges)| (*client, ranges.clone()))
            .collect();
        for (client, ranges) in ranges {
            let state = self.doc.store.get_state(&client);
            for range in ranges {
                if range.start >= state {
                    unapplied.insert(Id::new(client, range.start), range.len());
                    continue;
                }
                if state < range.end {
                    unapplied.insert(Id::new(client, state), range.end - state);
                }
                let end = range.end.min(state);
                let mut clock = range.start;
                while clock < end {
                    let Some(block) = self.doc.store.block(&Id::new(client, clock)) else {
                        break;
                    };
                    if block.is_deleted() {
                        clock = block.end();
                        continue;
                    }
                    if block.id().clock < clock {
                        self.clean_start(&Id::new(client, clock));
                    }
                    let block_end = self
                        .doc
                        .store
                        .block(&Id::new(client, clock))
                        .map_or(end, Block::end);
                    if block_end > end {
                        self.clean_end(&Id::new(client, end - 1));
                    }
                    self.delete_item(&Id::new(client, clock));
                    clock = self
                        .doc
                        .store
                        .block(&Id::new(client, clock))
                        .map_or(end, Block::end);
                }
            }
        }
        unapplied.squash();
        return unapplied;
    }

    /// Integrate a decoded update. Blocks and deletions that depend on
    /// missing data are kept pending and retried on later updates.
    pub fn apply_update(&mut self, update: Update) {
        let Update { blocks, delete_set } = update;
        debug!(clients = blocks.len(), deletes = delete_set.len(), "applying update");
        let rest = self.integrate_blocks(blocks);

        let mut retry = false;
        let pending = self.doc.store.pending.take();
        self.doc.store.pending = match (pending, rest) {
            (Some(mut pending), rest) => {
                retry = pending
                    .missing
                    .iter()
                    .any(|(client, clock)| *clock < self.doc.store.get_state(client));
                if let Some(rest) = rest {
                    for (client, clock) in rest.missing.iter() {
                        pending.missing.set_min(*client, *clock);
                    }
                    pending.update = Update::merge([pending.update, rest.update]);
                }
                Some(pending)
            }
            (None, rest) => {
                if let Some(rest) = rest.as_ref() {
                    debug!(missing = ?rest.missing, "update buffered as pending");
                }
                rest
            }
        };

        let unapplied = self.apply_delete_set(&delete_set);
        let unapplied_pending = match self.doc.store.pending_ds.take() {
            Some(ds) => self.apply_delete_set(&ds),
            None => DeleteSet::new(),
        };
        let mut pending_ds = unapplied;
        pending_ds.merge(&unapplied_pending);
        self.doc.store.pending_ds = (!pending_ds.is_empty()).then_some(pending_ds);

        if retry {
            if let Some(pending) = self.doc.store.pending.take() {
                debug!(missing = ?pending.missing, "retrying pending update");
                self.apply_update(pending.update);
            }
        }
    }

    pub fn apply_update_v1(&mut self, update: &[u8]) -> Result<()> {
        self.apply_update(Update::decode_v1(update)?);
        return Ok(());
    }

    pub fn apply_update_v2(&mut self, update: &[u8]) -> Result<()> {
        self.apply_update(Update::decode_v2(update)?);
        return Ok(());
    }
}

/// Helper for callers that insert local items: the item right of `left`,
/// or the parent's first item.
pub(crate) fn right_of(store: &Store, parent: BranchId, left: Option<Id>) -> Option<Id> {
    match left {
        Some(left) => store.item(&left).and_then(|l| l.right),
        None => store.branch(parent).start,
    }
}
