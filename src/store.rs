//! The struct store: per-client block logs plus the branch arena.
//!
//! Blocks of one client are kept in clock order without gaps, so the block
//! holding any id is found by binary search. Items reference each other
//! by id and every link is resolved through this store.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::block::{Block, Item};
use crate::branch::{Branch, BranchId, TypePtr, TypeRef};
use crate::content::ItemContent;
use crate::delete_set::DeleteSet;
use crate::error::{Error, Result};
use crate::id::{ClientId, Clock, Id};
use crate::state_vector::StateVector;
use crate::update::{PendingUpdate, Update};

// =============================================================================
// Client logs
// =============================================================================

/// The gap-free, clock-ordered blocks of one client.
#[derive(Clone, Debug, Default)]
pub struct ClientBlocks(Vec<Block>);

impl ClientBlocks {
    /// Index of the block containing `clock`.
    ///
    /// The first probe assumes clocks are spread evenly over the blocks,
    /// which is close to true for typical logs; then plain bisection.
    pub fn find_pivot(&self, clock: Clock) -> Option<usize> {
        let last = self.0.last()?;
        let mut right = self.0.len() - 1;
        if last.id().clock == clock {
            return Some(right);
        }
        if clock >= last.end() {
            return None;
        }
        let mut left = 0usize;
        let span = (last.end() as u64 - 1).max(1);
        let mut mid = ((clock as u64 * right as u64) / span) as usize;
        while left <= right {
            let block = &self.0[mid];
            if block.id().clock <= clock {
                if clock < block.end() {
                    return Some(mid);
                }
                left = mid + 1;
            } else {
                if mid == 0 {
                    return None;
                }
                right = mid - 1;
            }
            mid = (left + right) / 2;
        }
        return None;
    }

    /// Clock right after the last block.
    pub fn state(&self) -> Clock {
        return self.0.last().map(Block::end).unwrap_or(0);
    }
}

impl Deref for ClientBlocks {
    type Target = Vec<Block>;

    fn deref(&self) -> &Vec<Block> {
        return &self.0;
    }
}

impl DerefMut for ClientBlocks {
    fn deref_mut(&mut self) -> &mut Vec<Block> {
        return &mut self.0;
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug)]
pub struct Store {
    pub(crate) client_id: ClientId,
    pub(crate) blocks: FxHashMap<ClientId, ClientBlocks>,
    pub(crate) branches: Vec<Branch>,
    pub(crate) roots: FxHashMap<Arc<str>, BranchId>,
    /// Blocks received before their dependencies.
    pub(crate) pending: Option<PendingUpdate>,
    /// Deletions of ranges not received yet.
    pub(crate) pending_ds: Option<DeleteSet>,
}

impl Store {
    pub fn new(client_id: ClientId) -> Store {
        return Store {
            client_id,
            blocks: FxHashMap::default(),
            branches: Vec::new(),
            roots: FxHashMap::default(),
            pending: None,
            pending_ds: None,
        };
    }

    /// Next expected clock of `client`.
    pub fn get_state(&self, client: &ClientId) -> Clock {
        return self.blocks.get(client).map(ClientBlocks::state).unwrap_or(0);
    }

    pub fn state_vector(&self) -> StateVector {
        return self
            .blocks
            .iter()
            .map(|(client, blocks)| (*client, blocks.state()))
            .collect();
    }

    /// Index of the block containing `id` within its client's log.
    pub fn find_index(&self, id: &Id) -> Option<usize> {
        return self.blocks.get(&id.client)?.find_pivot(id.clock);
    }

    /// The block containing `id`.
    pub fn block(&self, id: &Id) -> Option<&Block> {
        let blocks = self.blocks.get(&id.client)?;
        let idx = blocks.find_pivot(id.clock)?;
        return Some(&blocks[idx]);
    }

    pub fn block_mut(&mut self, id: &Id) -> Option<&mut Block> {
        let blocks = self.blocks.get_mut(&id.client)?;
        let idx = blocks.find_pivot(id.clock)?;
        return Some(&mut blocks[idx]);
    }

    /// The item containing `id` (`None` for GC ranges).
    pub fn item(&self, id: &Id) -> Option<&Item> {
        return self.block(id)?.as_item();
    }

    pub fn item_mut(&mut self, id: &Id) -> Option<&mut Item> {
        return self.block_mut(id)?.as_item_mut();
    }

    /// Append a block to its client's log.
    ///
    /// # Panics
    ///
    /// If the block does not start exactly at the client's current state.
    pub fn push_block(&mut self, block: Block) {
        let id = block.id();
        let blocks = self.blocks.entry(id.client).or_default();
        let state = blocks.state();
        assert_eq!(
            state, id.clock,
            "block {} does not continue the log of client {} at {}",
            id, id.client, state
        );
        blocks.push(block);
    }

    /// Make sure a block starts at `id`, splitting the item holding it.
    /// Returns the index of that block and whether a split happened.
    /// GC ranges are never split.
    pub fn clean_start(&mut self, id: &Id) -> Option<(usize, bool)> {
        let blocks = self.blocks.get_mut(&id.client)?;
        let idx = blocks.find_pivot(id.clock)?;
        let block = &mut blocks[idx];
        let start = block.id().clock;
        if start < id.clock && !block.is_gc() {
            let right = block.split(id.clock - start);
            blocks.insert(idx + 1, right);
            return Some((idx + 1, true));
        }
        return Some((idx, false));
    }

    /// Make sure a block ends at `id`, splitting the item holding it.
    pub fn clean_end(&mut self, id: &Id) -> Option<(usize, bool)> {
        let blocks = self.blocks.get_mut(&id.client)?;
        let idx = blocks.find_pivot(id.clock)?;
        let block = &mut blocks[idx];
        if id.clock != block.end() - 1 && !block.is_gc() {
            let start = block.id().clock;
            let right = block.split(id.clock - start + 1);
            blocks.insert(idx + 1, right);
            return Some((idx, true));
        }
        return Some((idx, false));
    }

    /// The block at `idx` in the log of `client`.
    pub fn block_at(&self, client: &ClientId, idx: usize) -> Option<&Block> {
        return self.blocks.get(client)?.get(idx);
    }

    pub fn block_at_mut(&mut self, client: &ClientId, idx: usize) -> Option<&mut Block> {
        return self.blocks.get_mut(client)?.get_mut(idx);
    }

    // =========================================================================
    // Branches
    // =========================================================================

    pub fn branch(&self, id: BranchId) -> &Branch {
        return &self.branches[id.0 as usize];
    }

    pub fn branch_mut(&mut self, id: BranchId) -> &mut Branch {
        return &mut self.branches[id.0 as usize];
    }

    pub(crate) fn new_branch(&mut self, type_ref: TypeRef, item: Option<Id>) -> BranchId {
        let id = BranchId(self.branches.len() as u32);
        let mut branch = Branch::new(type_ref);
        branch.item = item;
        self.branches.push(branch);
        return id;
    }

    /// Look up a root type, creating it on first use. A typeless root
    /// (created by a remote update) takes the requested type.
    pub fn get_or_create_root(&mut self, name: &str, type_ref: TypeRef) -> Result<BranchId> {
        if let Some(id) = self.roots.get(name).copied() {
            let branch = self.branch_mut(id);
            if branch.type_ref == TypeRef::Undefined {
                branch.upgrade(type_ref);
            } else if type_ref != TypeRef::Undefined && branch.type_ref != type_ref {
                return Err(Error::TypeMismatch {
                    name: Arc::from(name),
                    expected: type_ref,
                    actual: branch.type_ref.clone(),
                });
            }
            return Ok(id);
        }
        let name: Arc<str> = Arc::from(name);
        let id = self.new_branch(type_ref, None);
        self.branch_mut(id).name = Some(name.clone());
        self.roots.insert(name, id);
        return Ok(id);
    }

    /// Resolve an item's parent to a branch, creating typeless roots for
    /// unknown names.
    pub(crate) fn resolve_parent(&mut self, parent: &TypePtr) -> Option<BranchId> {
        match parent {
            TypePtr::Branch(id) => Some(*id),
            TypePtr::Named(name) => self.get_or_create_root(name, TypeRef::Undefined).ok(),
            TypePtr::Id(id) => self.branch_of_item(id),
            TypePtr::Unknown => None,
        }
    }

    /// The branch of the nested type anchored at `id`.
    pub fn branch_of_item(&self, id: &Id) -> Option<BranchId> {
        match &self.item(id)?.content {
            ItemContent::Type(t) => t.branch,
            _ => None,
        }
    }

    /// How an update refers to `branch` as a parent.
    pub(crate) fn type_ptr_of(&self, branch: BranchId) -> TypePtr {
        let branch = self.branch(branch);
        if let Some(item) = branch.item {
            return TypePtr::Id(item);
        }
        if let Some(name) = branch.name.as_ref() {
            return TypePtr::Named(name.clone());
        }
        return TypePtr::Unknown;
    }

    /// The branch an integrated item lives in.
    pub fn parent_of(&self, item: &Item) -> Option<BranchId> {
        match item.parent {
            TypePtr::Branch(id) => Some(id),
            _ => None,
        }
    }

    /// Iterate over the sequence items of a branch, deleted ones included.
    pub fn iter_items(&self, branch: BranchId) -> ItemIter<'_> {
        return ItemIter {
            store: self,
            next: self.branch(branch).start,
        };
    }

    // =========================================================================
    // Whole-store views
    // =========================================================================

    /// All deleted ranges currently in the store, GC ranges included.
    pub fn delete_set(&self) -> DeleteSet {
        let mut ds = DeleteSet::new();
        for (client, blocks) in self.blocks.iter() {
            let mut i = 0;
            while i < blocks.len() {
                if !blocks[i].is_deleted() {
                    i += 1;
                    continue;
                }
                let start = blocks[i].id();
                let mut len = blocks[i].len();
                i += 1;
                while i < blocks.len() && blocks[i].is_deleted() {
                    len += blocks[i].len();
                    i += 1;
                }
                ds.insert(Id::new(*client, start.clock), len);
            }
        }
        ds.squash();
        return ds;
    }

    /// Everything the holder of `sv` is missing, as an update. Pending
    /// blocks and deletions are not included.
    pub fn diff(&self, sv: &StateVector) -> Update {
        let mut update = self.blocks_since(sv);
        update.delete_set = self.delete_set();
        return update;
    }

    /// The blocks the holder of `sv` is missing, with an empty delete set.
    pub(crate) fn blocks_since(&self, sv: &StateVector) -> Update {
        let mut update = Update::new();
        for (client, blocks) in self.blocks.iter() {
            let clock = sv.get(client);
            if clock >= blocks.state() {
                continue;
            }
            let first = blocks.find_pivot(clock).unwrap_or(0);
            let mut out = Vec::with_capacity(blocks.len() - first);
            for block in blocks[first..].iter() {
                out.push(self.detach(block));
            }
            if let Some(head) = out.first_mut() {
                let offset = clock.saturating_sub(head.id().clock);
                if offset > 0 {
                    *head = head.split(offset);
                }
            }
            update.blocks.insert(*client, out);
        }
        return update;
    }

    fn detach(&self, block: &Block) -> Block {
        let parent = match block {
            Block::Item(item) => match item.parent {
                TypePtr::Branch(id) => self.type_ptr_of(id),
                ref other => other.clone(),
            },
            _ => TypePtr::Unknown,
        };
        return block.detached(parent);
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Merge the block at `pos` into its left neighbours for as long as they
    /// absorb it. Returns how many blocks disappeared.
    pub(crate) fn try_merge_with_lefts(&mut self, client: &ClientId, pos: usize) -> usize {
        let Some(blocks) = self.blocks.get_mut(client) else {
            return 0;
        };
        if pos >= blocks.len() {
            return 0;
        }
        let mut i = pos;
        while i > 0 {
            let (head, tail) = blocks.split_at_mut(i);
            let left = &mut head[i - 1];
            let right = &tail[0];
            if left.is_deleted() != right.is_deleted() {
                break;
            }
            let left_id = left.id();
            let left_len = match left.as_item() {
                Some(item) => item.content_len(),
                None => 0,
            };
            let right_id = right.id();
            if !left.try_merge(right) {
                break;
            }
            if let Some(TypePtr::Branch(parent)) = left.as_item().map(|item| &item.parent) {
                if let Some(markers) = self.branches[parent.0 as usize].markers.as_mut() {
                    markers.on_merge(right_id, left_id, left_len);
                }
            }
            i -= 1;
        }
        let merged = pos - i;
        if merged > 0 {
            blocks.drain(i + 1..=pos);
        }
        return merged;
    }
}

/// Walks a branch's item chain left to right.
pub struct ItemIter<'a> {
    store: &'a Store,
    next: Option<Id>,
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<&'a Item> {
        let id = self.next?;
        let item = self.store.item(&id)?;
        self.next = item.right;
        return Some(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRange;
    use crate::content::SplittableString;

    fn text(store: &mut Store, client: ClientId, text: &str) {
        let clock = store.get_state(&client);
        let item = Item::new(
            Id::new(client, clock),
            None,
            None,
            None,
            None,
            TypePtr::Named(Arc::from("t")),
            None,
            ItemContent::String(SplittableString::from(text)),
        );
        store.push_block(Block::Item(Box::new(item)));
    }

    #[test]
    fn pivot_search_finds_every_clock() {
        let mut store = Store::new(1);
        for chunk in ["a", "bcd", "ef", "g", "hijkl"] {
            text(&mut store, 1, chunk);
        }
        let blocks = &store.blocks[&1];
        let expected = [0, 1, 1, 1, 2, 2, 3, 4, 4, 4, 4, 4];
        for (clock, idx) in expected.iter().enumerate() {
            assert_eq!(blocks.find_pivot(clock as Clock), Some(*idx));
        }
        assert_eq!(blocks.find_pivot(12), None);
    }

    #[test]
    #[should_panic(expected = "does not continue")]
    fn gaps_are_fatal() {
        let mut store = Store::new(1);
        store.push_block(Block::Gc(BlockRange::new(Id::new(1, 3), 1)));
    }

    #[test]
    fn clean_start_and_end_split_items() {
        let mut store = Store::new(1);
        text(&mut store, 1, "hello");
        assert_eq!(store.clean_start(&Id::new(1, 2)), Some((1, true)));
        assert_eq!(store.clean_end(&Id::new(1, 3)), Some((1, true)));
        let lens: Vec<_> = store.blocks[&1].iter().map(Block::len).collect();
        assert_eq!(lens, vec![2, 2, 1]);
        assert_eq!(store.clean_start(&Id::new(1, 2)), Some((1, false)));
    }

    #[test]
    fn split_blocks_merge_back() {
        let mut store = Store::new(1);
        text(&mut store, 1, "hello");
        store.clean_start(&Id::new(1, 2));
        store.clean_start(&Id::new(1, 4));
        assert_eq!(store.try_merge_with_lefts(&1, 2), 2);
        assert_eq!(store.blocks[&1].len(), 1);
        assert_eq!(store.blocks[&1][0].len(), 5);
    }

    #[test]
    fn root_type_mismatch_is_an_error() {
        let mut store = Store::new(1);
        store.get_or_create_root("doc", TypeRef::Text).unwrap();
        let err = store.get_or_create_root("doc", TypeRef::Map).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        // a remote-first root adopts the first requested type
        store.get_or_create_root("remote", TypeRef::Undefined).unwrap();
        store.get_or_create_root("remote", TypeRef::Array).unwrap();
        assert!(store.get_or_create_root("remote", TypeRef::Text).is_err());
    }

    #[test]
    fn delete_set_covers_gc_and_deleted_items() {
        let mut store = Store::new(1);
        store.push_block(Block::Gc(BlockRange::new(Id::new(1, 0), 2)));
        text(&mut store, 1, "ab");
        text(&mut store, 1, "cd");
        if let Some(item) = store.item_mut(&Id::new(1, 2)) {
            item.mark_deleted();
        }
        let ds = store.delete_set();
        assert!(ds.is_deleted(&Id::new(1, 3)));
        assert!(!ds.is_deleted(&Id::new(1, 4)));
    }
}
