//! Delete sets: sparse per-client interval sets of tombstoned clocks.
//!
//! Deletions never remove blocks. They are recorded as ranges here, shipped
//! with every update and replayed against the receiving store.

use rustc_hash::FxHashMap;

use crate::encoding::codec::{Decoder, Encoder};
use crate::error::Result;
use crate::id::{ClientId, Clock, Id, IdRange};

/// Sorted, non-overlapping deleted ranges per client (after [`squash`]).
///
/// [`squash`]: DeleteSet::squash
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteSet(FxHashMap<ClientId, Vec<IdRange>>);

impl DeleteSet {
    pub fn new() -> DeleteSet {
        return DeleteSet::default();
    }

    /// Record `len` deleted units starting at `id`. Call [`squash`] before
    /// querying.
    ///
    /// [`squash`]: DeleteSet::squash
    pub fn insert(&mut self, id: Id, len: Clock) {
        if len == 0 {
            return;
        }
        self.0
            .entry(id.client)
            .or_default()
            .push(IdRange::new(id.clock, len));
    }

    /// Check if the unit `id` lies in a deleted range.
    pub fn is_deleted(&self, id: &Id) -> bool {
        let Some(ranges) = self.0.get(&id.client) else {
            return false;
        };
        let idx = ranges.partition_point(|r| r.end <= id.clock);
        return ranges.get(idx).is_some_and(|r| r.contains(id.clock));
    }

    /// Sort every client's ranges and merge the ones that overlap or touch.
    pub fn squash(&mut self) {
        for ranges in self.0.values_mut() {
            squash_ranges(ranges);
        }
        self.0.retain(|_, ranges| !ranges.is_empty());
    }

    /// Add all ranges of `other` and squash.
    pub fn merge(&mut self, other: &DeleteSet) {
        for (client, ranges) in other.0.iter() {
            self.0
                .entry(*client)
                .or_default()
                .extend(ranges.iter().copied());
        }
        self.squash();
    }

    pub fn is_empty(&self) -> bool {
        return self.0.is_empty();
    }

    pub fn len(&self) -> usize {
        return self.0.len();
    }

    /// The deleted ranges of one client.
    pub fn ranges(&self, client: &ClientId) -> &[IdRange] {
        return self.0.get(client).map(|r| r.as_slice()).unwrap_or(&[]);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &Vec<IdRange>)> {
        return self.0.iter();
    }

    /// Clients sorted highest first (the wire order).
    pub fn clients_desc(&self) -> Vec<ClientId> {
        let mut clients: Vec<_> = self.0.keys().copied().collect();
        clients.sort_by(|a, b| b.cmp(a));
        return clients;
    }

    /// Write the delete set. The ranges must be squashed.
    pub fn encode<E: Encoder>(&self, encoder: &mut E) {
        let clients = self.clients_desc();
        encoder.write_var(clients.len() as u64);
        for client in clients {
            let ranges = self.ranges(&client);
            encoder.reset_ds_cur_val();
            encoder.write_var(client);
            encoder.write_var(ranges.len() as u64);
            for range in ranges {
                encoder.write_ds_clock(range.start);
                encoder.write_ds_len(range.len());
            }
        }
    }

    pub fn decode<'a, D: Decoder<'a>>(decoder: &mut D) -> Result<DeleteSet> {
        let mut ds = DeleteSet::default();
        let clients = decoder.read_var()? as usize;
        for _ in 0..clients {
            decoder.reset_ds_cur_val();
            let client = decoder.read_var()?;
            let count = decoder.read_var()? as usize;
            let mut ranges = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let clock = decoder.read_ds_clock()?;
                let len = decoder.read_ds_len()?;
                if len > 0 {
                    ranges.push(IdRange::new(clock, len));
                }
            }
            if !ranges.is_empty() {
                ds.0.entry(client).or_default().extend(ranges);
            }
        }
        ds.squash();
        return Ok(ds);
    }
}

fn squash_ranges(ranges: &mut Vec<IdRange>) {
    if ranges.len() < 2 {
        return;
    }
    ranges.sort_by_key(|r| r.start);
    let mut write = 0;
    for read in 1..ranges.len() {
        let next = ranges[read];
        let current = &mut ranges[write];
        if current.touches(&next) {
            current.end = current.end.max(next.end);
        } else {
            write += 1;
            ranges[write] = next;
        }
    }
    ranges.truncate(write + 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::codec::{DecoderV1, DecoderV2, EncoderV1, EncoderV2};

    #[test]
    fn squash_merges_overlapping_and_adjacent() {
        let mut ds = DeleteSet::new();
        ds.insert(Id::new(1, 5), 2);
        ds.insert(Id::new(1, 0), 2);
        ds.insert(Id::new(1, 2), 1);
        ds.insert(Id::new(1, 6), 4);
        ds.squash();
        assert_eq!(ds.ranges(&1), &[IdRange::new(0, 3), IdRange::new(5, 5)]);
    }

    #[test]
    fn membership() {
        let mut ds = DeleteSet::new();
        ds.insert(Id::new(2, 10), 5);
        ds.insert(Id::new(2, 0), 1);
        ds.squash();
        assert!(ds.is_deleted(&Id::new(2, 0)));
        assert!(!ds.is_deleted(&Id::new(2, 1)));
        assert!(ds.is_deleted(&Id::new(2, 14)));
        assert!(!ds.is_deleted(&Id::new(2, 15)));
        assert!(!ds.is_deleted(&Id::new(3, 10)));
    }

    #[test]
    fn merge_unions_clients() {
        let mut a = DeleteSet::new();
        a.insert(Id::new(1, 0), 3);
        let mut b = DeleteSet::new();
        b.insert(Id::new(1, 2), 3);
        b.insert(Id::new(4, 1), 1);
        a.merge(&b);
        assert_eq!(a.ranges(&1), &[IdRange::new(0, 5)]);
        assert_eq!(a.ranges(&4), &[IdRange::new(1, 1)]);
    }

    #[test]
    fn encodes_in_both_formats() {
        let mut ds = DeleteSet::new();
        ds.insert(Id::new(9, 3), 2);
        ds.insert(Id::new(9, 10), 1);
        ds.insert(Id::new(1, 0), 7);
        ds.squash();

        let mut v1 = EncoderV1::new();
        ds.encode(&mut v1);
        let bytes = v1.finish();
        assert_eq!(DeleteSet::decode(&mut DecoderV1::new(&bytes)).unwrap(), ds);

        let mut v2 = EncoderV2::new();
        ds.encode(&mut v2);
        let bytes = v2.finish();
        assert_eq!(DeleteSet::decode(&mut DecoderV2::new(&bytes).unwrap()).unwrap(), ds);
    }
}
