//! Decoded updates: blocks grouped by client plus a delete set.
//!
//! An [`Update`] is the in-memory form of a delta. It is what gets
//! integrated into a store, what the store produces when asked for its
//! state, and what is parked as pending when dependencies are missing.

use rustc_hash::FxHashMap;

use crate::block::{Block, BlockRange};
use crate::delete_set::DeleteSet;
use crate::encoding::codec::{Decoder, DecoderV1, DecoderV2, Encoder, EncoderV1, EncoderV2};
use crate::error::Result;
use crate::id::{ClientId, Id};
use crate::state_vector::StateVector;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    /// Blocks per client in clock order. Gaps are allowed and become
    /// `Skip` blocks on the wire.
    pub(crate) blocks: FxHashMap<ClientId, Vec<Block>>,
    pub(crate) delete_set: DeleteSet,
}

/// An update that could not be integrated yet, and the lowest clock per
/// client it is waiting for.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingUpdate {
    pub update: Update,
    pub missing: StateVector,
}

impl Update {
    pub fn new() -> Update {
        return Update::default();
    }

    /// An update carrying only deletions.
    pub fn from_delete_set(delete_set: DeleteSet) -> Update {
        return Update {
            blocks: FxHashMap::default(),
            delete_set,
        };
    }

    pub fn is_empty(&self) -> bool {
        return self.delete_set.is_empty() && self.blocks.values().all(|b| b.is_empty());
    }

    pub fn delete_set(&self) -> &DeleteSet {
        return &self.delete_set;
    }

    /// The blocks of one client.
    pub fn blocks(&self, client: &ClientId) -> &[Block] {
        return self.blocks.get(client).map(|b| b.as_slice()).unwrap_or(&[]);
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        return self.blocks.keys();
    }

    // =========================================================================
    // Wire format
    // =========================================================================

    pub fn decode<'a, D: Decoder<'a>>(decoder: &mut D) -> Result<Update> {
        let mut update = Update::new();
        let clients = decoder.read_var()?;
        for _ in 0..clients {
            let count = decoder.read_var()? as usize;
            let client = decoder.read_client()?;
            let mut clock = decoder.read_var_u32()?;
            let blocks = update.blocks.entry(client).or_default();
            blocks.reserve(count.min(4096));
            for _ in 0..count {
                let block = Block::decode(decoder, Id::new(client, clock))?;
                clock += block.len();
                blocks.push(block);
            }
        }
        for blocks in update.blocks.values_mut() {
            if !blocks.is_sorted_by_key(|b| b.id().clock) {
                blocks.sort_by_key(|b| b.id().clock);
            }
        }
        update.delete_set = DeleteSet::decode(decoder)?;
        return Ok(update);
    }

    pub fn decode_v1(buf: &[u8]) -> Result<Update> {
        return Update::decode(&mut DecoderV1::new(buf));
    }

    pub fn decode_v2(buf: &[u8]) -> Result<Update> {
        return Update::decode(&mut DecoderV2::new(buf)?);
    }

    pub fn encode<E: Encoder>(&self, encoder: &mut E) {
        let mut clients: Vec<_> = self
            .blocks
            .iter()
            .filter(|(_, blocks)| !blocks.is_empty())
            .map(|(client, _)| *client)
            .collect();
        clients.sort_by(|a, b| b.cmp(a));
        encoder.write_var(clients.len() as u64);
        for client in clients {
            encode_with_skips(encoder, client, self.blocks(&client));
        }
        let mut ds = self.delete_set.clone();
        ds.squash();
        ds.encode(encoder);
    }

    pub fn encode_v1(&self) -> Vec<u8> {
        let mut encoder = EncoderV1::new();
        self.encode(&mut encoder);
        return encoder.finish();
    }

    pub fn encode_v2(&self) -> Vec<u8> {
        let mut encoder = EncoderV2::new();
        self.encode(&mut encoder);
        return encoder.finish();
    }

    // =========================================================================
    // Combinators
    // =========================================================================

    /// Union of several updates. Blocks covered by another block are
    /// dropped, partial overlaps are sliced, adjacent GC ranges coalesce.
    pub fn merge<I: IntoIterator<Item = Update>>(updates: I) -> Update {
        let mut result = Update::new();
        for update in updates {
            for (client, blocks) in update.blocks {
                result
                    .blocks
                    .entry(client)
                    .or_default()
                    .extend(blocks.into_iter().filter(|b| !b.is_skip()));
            }
            result.delete_set.merge(&update.delete_set);
        }
        for blocks in result.blocks.values_mut() {
            blocks.sort_by(|a, b| {
                a.id()
                    .clock
                    .cmp(&b.id().clock)
                    .then_with(|| b.len().cmp(&a.len()))
            });
            let mut merged: Vec<Block> = Vec::with_capacity(blocks.len());
            for mut block in blocks.drain(..) {
                let Some(last) = merged.last_mut() else {
                    merged.push(block);
                    continue;
                };
                let last_end = last.end();
                if block.end() <= last_end {
                    continue;
                }
                let start = block.id().clock;
                if start < last_end {
                    block = block.split(last_end - start);
                }
                if !last.try_merge(&block) {
                    merged.push(block);
                }
            }
            *blocks = merged;
        }
        result.blocks.retain(|_, blocks| !blocks.is_empty());
        return result;
    }

    /// The part of this update the holder of `sv` does not have yet. The
    /// delete set is kept whole.
    pub fn diff(&self, sv: &StateVector) -> Update {
        let mut result = Update::from_delete_set(self.delete_set.clone());
        for (client, blocks) in self.blocks.iter() {
            let clock = sv.get(client);
            let mut out = Vec::new();
            for block in blocks.iter().filter(|b| !b.is_skip() && b.end() > clock) {
                let mut block = block.clone();
                let start = block.id().clock;
                if start < clock {
                    block = block.split(clock - start);
                }
                out.push(block);
            }
            if !out.is_empty() {
                result.blocks.insert(*client, out);
            }
        }
        return result;
    }

    /// Per client, the clock up to which this update is contiguous from
    /// zero.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for (client, blocks) in self.blocks.iter() {
            let mut clock = 0;
            for block in blocks.iter() {
                if block.is_skip() || block.id().clock != clock {
                    break;
                }
                clock = block.end();
            }
            if clock > 0 {
                sv.set(*client, clock);
            }
        }
        return sv;
    }
}

/// Number of clock gaps between consecutive blocks.
fn gap_count(blocks: &[Block]) -> usize {
    return blocks
        .windows(2)
        .filter(|pair| pair[1].id().clock > pair[0].end())
        .count();
}

/// Write the blocks of one client, with a `Skip` in every clock gap.
fn encode_with_skips<E: Encoder>(encoder: &mut E, client: ClientId, blocks: &[Block]) {
    let Some(first) = blocks.first() else {
        return;
    };
    encoder.write_var((blocks.len() + gap_count(blocks)) as u64);
    encoder.write_client(client);
    encoder.write_var(first.id().clock as u64);
    let mut expected = first.id().clock;
    for block in blocks {
        let start = block.id().clock;
        if start > expected {
            let skip = Block::Skip(BlockRange::new(Id::new(client, expected), start - expected));
            skip.encode(encoder, 0);
        }
        block.encode(encoder, 0);
        expected = expected.max(block.end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Item;
    use crate::branch::TypePtr;
    use crate::content::{ItemContent, SplittableString};
    use std::sync::Arc;

    fn text_block(client: ClientId, clock: u32, text: &str) -> Block {
        let item = Item::new(
            Id::new(client, clock),
            None,
            if clock > 0 { Some(Id::new(client, clock - 1)) } else { None },
            None,
            None,
            if clock > 0 { TypePtr::Unknown } else { TypePtr::Named(Arc::from("t")) },
            None,
            ItemContent::String(SplittableString::from(text)),
        );
        return Block::Item(Box::new(item));
    }

    #[test]
    fn gaps_roundtrip_as_skips() {
        let mut update = Update::new();
        update
            .blocks
            .insert(1, vec![text_block(1, 0, "ab"), text_block(1, 5, "c")]);
        let decoded = Update::decode_v1(&update.encode_v1()).unwrap();
        let blocks = decoded.blocks(&1);
        assert_eq!(blocks.len(), 3);
        assert!(blocks[1].is_skip());
        assert_eq!(blocks[1].len(), 3);
        assert_eq!(decoded.state_vector().get(&1), 2);
    }

    #[test]
    fn merge_drops_duplicates_and_slices_overlaps() {
        let mut a = Update::new();
        a.blocks.insert(1, vec![text_block(1, 0, "abc")]);
        let mut b = Update::new();
        b.blocks.insert(1, vec![text_block(1, 1, "bcde")]);
        let merged = Update::merge([a.clone(), b, a]);
        let blocks = merged.blocks(&1);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].len(), 3);
        assert_eq!(blocks[1].id(), Id::new(1, 3));
        assert_eq!(blocks[1].len(), 2);
    }

    #[test]
    fn diff_slices_first_block() {
        let mut update = Update::new();
        update.blocks.insert(1, vec![text_block(1, 0, "hello")]);
        let diff = update.diff(&StateVector::from_iter([(1, 3)]));
        let blocks = diff.blocks(&1);
        assert_eq!(blocks[0].id(), Id::new(1, 3));
        assert_eq!(blocks[0].len(), 2);
    }
}
