//! Garbage collection of deleted content.
//!
//! A deleted item keeps its place in the chain (later updates may still use
//! it as an origin) but its content shrinks to a `Deleted` length. Items
//! inside a deleted nested type are unreachable and are replaced by plain
//! GC ranges.

use tracing::trace;

use crate::block::{Block, BlockRange};
use crate::content::ItemContent;
use crate::id::Id;
use crate::store::Store;
use crate::transaction::Transaction;

impl Store {
    /// Drop the content of the deleted item containing `id`. With
    /// `parent_collected` the item is replaced by a GC range entirely.
    pub(crate) fn gc_item(&mut self, id: &Id, parent_collected: bool) {
        let Some(item) = self.item(id) else {
            return;
        };
        debug_assert!(item.is_deleted(), "collecting live item {}", item.id);
        let start = item.id;
        let len = item.len;
        if let ItemContent::Type(content) = &item.content {
            if let Some(branch) = content.branch {
                self.gc_branch(branch);
            }
        }
        if parent_collected {
            if let Some(idx) = self.find_index(&start) {
                if let Some(block) = self.block_at_mut(&start.client, idx) {
                    *block = Block::Gc(BlockRange::new(start, len));
                }
            }
        } else if let Some(item) = self.item_mut(&start) {
            item.content = ItemContent::Deleted(len);
        }
    }

    fn gc_branch(&mut self, branch: crate::branch::BranchId) {
        let mut next = self.branch(branch).start;
        while let Some(id) = next {
            next = self.item(&id).and_then(|item| item.right);
            self.gc_item(&id, true);
        }
        let slots: Vec<Id> = self.branch(branch).map.values().copied().collect();
        for last in slots {
            let mut current = Some(last);
            while let Some(id) = current {
                current = self.item(&id).and_then(|item| item.left);
                self.gc_item(&id, true);
            }
        }
        let branch = self.branch_mut(branch);
        branch.start = None;
        branch.map.clear();
    }
}

impl<'doc> Transaction<'doc> {
    /// Collect everything deleted by this transaction that is neither kept
    /// nor rejected by the document's GC filter.
    pub(crate) fn collect_garbage(&mut self) {
        let filter = self.doc.options.gc_filter.clone();
        let store = &mut self.doc.store;
        let mut collected = 0usize;
        for (client, ranges) in self.state.delete_set.iter() {
            for range in ranges.iter().rev() {
                let mut clock = range.start;
                while clock < range.end {
                    let id = Id::new(*client, clock);
                    let Some(block) = store.block(&id) else { break };
                    clock = block.end();
                    let Some(item) = block.as_item() else {
                        continue;
                    };
                    let eligible = item.is_deleted()
                        && !item.is_keep()
                        && !matches!(item.content, ItemContent::Deleted(_))
                        && filter.as_ref().is_none_or(|f| f(item));
                    if eligible {
                        store.gc_item(&id, false);
                        collected += 1;
                    }
                }
            }
        }
        if collected > 0 {
            trace!(collected, "collected deleted items");
        }
    }
}
