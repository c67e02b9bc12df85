//! Search markers: cached (item, index) anchors for sequence lookups.
//!
//! Resolving an index means walking the item chain. Each sequence branch
//! keeps up to [`MAX_SEARCH_MARKERS`] anchors and starts the walk from the
//! one closest to the requested index. Markers are refreshed on use and the
//! least recently used one is recycled when the pool is full.

use crate::branch::BranchId;
use crate::id::Id;
use crate::store::Store;

pub const MAX_SEARCH_MARKERS: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
    /// Start id of the anchor item.
    pub item: Id,
    /// Index of the anchor item in its sequence.
    pub index: u32,
    timestamp: u64,
}

#[derive(Clone, Debug, Default)]
pub struct SearchMarkers {
    markers: Vec<Marker>,
    clock: u64,
}

impl SearchMarkers {
    pub fn len(&self) -> usize {
        return self.markers.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.markers.is_empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        return self.markers.iter();
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        return self.clock;
    }

    /// The item at `right` was merged into the item starting at `left`,
    /// whose countable length was `left_len`.
    pub(crate) fn on_merge(&mut self, right: Id, left: Id, left_len: u32) {
        for marker in self.markers.iter_mut() {
            if marker.item == right {
                marker.item = left;
                marker.index -= left_len;
            }
        }
    }

    fn closest(&self, index: u32) -> Option<usize> {
        return self
            .markers
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| (m.index as i64 - index as i64).abs())
            .map(|(i, _)| i);
    }

    fn oldest(&self) -> Option<usize> {
        return self
            .markers
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| m.timestamp)
            .map(|(i, _)| i);
    }
}

impl Store {
    /// Start id of the item chain element left of `id`'s item.
    fn left_item_start(&self, id: &Id) -> Option<Id> {
        let left = self.item(id)?.left?;
        return Some(self.item(&left)?.id);
    }

    /// Find an item near `index` to start a walk from and cache it.
    /// Returns the item's start id and its index.
    pub(crate) fn find_marker(&mut self, branch: BranchId, index: u32) -> Option<(Id, u32)> {
        let parent = self.branch(branch);
        let start = parent.start?;
        let parent_len = parent.content_len;
        if index == 0 {
            return None;
        }
        let mut markers = self.branch_mut(branch).markers.take()?;

        let closest = markers.closest(index);
        let (mut p, mut pindex) = match closest {
            Some(i) => {
                let ts = markers.tick();
                let marker = &mut markers.markers[i];
                marker.timestamp = ts;
                (marker.item, marker.index)
            }
            None => (start, 0),
        };
        if self.item(&p).is_none() {
            // stale anchor: its range was collected
            p = start;
            pindex = 0;
        }

        // walk right
        while let Some(item) = self.item(&p) {
            let Some(right) = item.right else { break };
            if pindex >= index {
                break;
            }
            if !item.is_deleted() && item.is_countable() {
                if index < pindex + item.len {
                    break;
                }
                pindex += item.len;
            }
            p = right;
        }
        // walk left if we overshot
        while pindex > index {
            let Some(left) = self.left_item_start(&p) else { break };
            p = left;
            if let Some(item) = self.item(&p) {
                pindex -= item.content_len();
            }
        }
        // an anchor must not be mergeable with its left neighbour
        while let Some(item) = self.item(&p) {
            let contiguous = item.id.clock > 0 && item.left == Some(Id::new(item.id.client, item.id.clock - 1));
            if !contiguous {
                break;
            }
            let Some(left) = self.left_item_start(&p) else { break };
            p = left;
            if let Some(item) = self.item(&p) {
                pindex -= item.content_len();
            }
        }

        let ts = markers.tick();
        let reuse = closest.filter(|i| {
            let m = &markers.markers[*i];
            ((m.index as i64 - pindex as i64).abs() as u64) < (parent_len as u64 / MAX_SEARCH_MARKERS as u64)
        });
        let slot = match reuse {
            Some(i) => Some(i),
            None if markers.markers.len() >= MAX_SEARCH_MARKERS => markers.oldest(),
            None => None,
        };
        match slot {
            Some(i) => {
                let old = markers.markers[i].item;
                if let Some(item) = self.item_mut(&old) {
                    item.set_marker(false);
                }
                markers.markers[i] = Marker {
                    item: p,
                    index: pindex,
                    timestamp: ts,
                };
            }
            None => markers.markers.push(Marker {
                item: p,
                index: pindex,
                timestamp: ts,
            }),
        }
        if let Some(item) = self.item_mut(&p) {
            item.set_marker(true);
        }
        self.branch_mut(branch).markers = Some(markers);
        return Some((p, pindex));
    }

    /// Forget all markers of `branch`, e.g. after remote changes moved
    /// indices around.
    pub(crate) fn clear_markers(&mut self, branch: BranchId) {
        let Some(mut markers) = self.branch_mut(branch).markers.take() else {
            return;
        };
        for marker in markers.markers.iter() {
            if let Some(item) = self.item_mut(&marker.item) {
                item.set_marker(false);
            }
        }
        markers.clear();
        self.branch_mut(branch).markers = Some(markers);
    }

    /// Shift markers after `len` units were inserted (positive) or removed
    /// (negative) at `index`.
    pub(crate) fn update_marker_changes(&mut self, branch: BranchId, index: u32, len: i64) {
        let Some(mut markers) = self.branch_mut(branch).markers.take() else {
            return;
        };
        let mut i = markers.markers.len();
        while i > 0 {
            i -= 1;
            let mut marker = markers.markers[i];
            let mut m_index = marker.index as i64;
            if len > 0 {
                let mut p = Some(marker.item);
                if let Some(item) = self.item_mut(&marker.item) {
                    item.set_marker(false);
                }
                // move to the closest countable, live item on the left
                while let Some(item) = p.and_then(|id| self.item(&id)) {
                    if !item.is_deleted() && item.is_countable() {
                        break;
                    }
                    p = self.left_item_start(&item.id);
                    if let Some(left) = p.and_then(|id| self.item(&id)) {
                        if !left.is_deleted() && left.is_countable() {
                            m_index -= left.len as i64;
                        }
                    }
                }
                let anchor = p.and_then(|id| self.item(&id)).filter(|item| !item.is_marker());
                let Some(anchor) = anchor else {
                    markers.markers.remove(i);
                    continue;
                };
                marker.item = anchor.id;
                if let Some(item) = self.item_mut(&marker.item) {
                    item.set_marker(true);
                }
            }
            let index = index as i64;
            if index < m_index || (len > 0 && index == m_index) {
                m_index = index.max(m_index + len);
            }
            marker.index = m_index.max(0) as u32;
            markers.markers[i] = marker;
        }
        self.branch_mut(branch).markers = Some(markers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_moves_marker_to_left_item() {
        let mut markers = SearchMarkers::default();
        markers.markers.push(Marker {
            item: Id::new(1, 5),
            index: 7,
            timestamp: 0,
        });
        markers.on_merge(Id::new(1, 5), Id::new(1, 2), 3);
        let marker = markers.iter().next().unwrap();
        assert_eq!(marker.item, Id::new(1, 2));
        assert_eq!(marker.index, 4);
    }

    #[test]
    fn closest_prefers_nearest_index() {
        let mut markers = SearchMarkers::default();
        for (clock, index) in [(0, 0), (10, 40), (20, 90)] {
            markers.markers.push(Marker {
                item: Id::new(1, clock),
                index,
                timestamp: 0,
            });
        }
        assert_eq!(markers.closest(50), Some(1));
        assert_eq!(markers.closest(80), Some(2));
    }
}
