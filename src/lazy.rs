//! Streaming operations on encoded updates.
//!
//! None of these build a document: blocks are read one at a time with a
//! [`BlockReader`] and written back with a [`LazyWriter`], so updates can
//! be merged, diffed and converted without being materialized.

use std::cmp::Ordering;
use std::marker::PhantomData;

use tracing::trace;

use crate::block::Block;
use crate::delete_set::DeleteSet;
use crate::encoding::codec::{Decoder, DecoderV1, DecoderV2, Encoder, EncoderV1, EncoderV2};
use crate::error::Result;
use crate::id::{ClientId, Clock, Id};
use crate::state_vector::StateVector;

// =============================================================================
// Reader
// =============================================================================

/// Single-pass iterator over the blocks of an encoded update.
///
/// The delete set follows the blocks on the wire; call
/// [`BlockReader::finish`] to get the decoder positioned right before it.
pub struct BlockReader<'a, D: Decoder<'a>> {
    decoder: D,
    clients_left: u64,
    blocks_left: u64,
    client: ClientId,
    clock: Clock,
    _buf: PhantomData<&'a [u8]>,
}

impl<'a, D: Decoder<'a>> BlockReader<'a, D> {
    pub fn new(mut decoder: D) -> Result<Self> {
        let clients_left = decoder.read_var()?;
        return Ok(BlockReader {
            decoder,
            clients_left,
            blocks_left: 0,
            client: 0,
            clock: 0,
            _buf: PhantomData,
        });
    }

    fn read_next(&mut self) -> Result<Option<Block>> {
        while self.blocks_left == 0 {
            if self.clients_left == 0 {
                return Ok(None);
            }
            self.clients_left -= 1;
            self.blocks_left = self.decoder.read_var()?;
            self.client = self.decoder.read_client()?;
            self.clock = self.decoder.read_var_u32()?;
        }
        let block = Block::decode(&mut self.decoder, Id::new(self.client, self.clock))?;
        self.clock += block.len();
        self.blocks_left -= 1;
        return Ok(Some(block));
    }

    /// Skip the remaining blocks and hand back the decoder.
    pub fn finish(mut self) -> Result<D> {
        while self.read_next()?.is_some() {}
        return Ok(self.decoder);
    }
}

impl<'a, D: Decoder<'a>> Iterator for BlockReader<'a, D> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Result<Block>> {
        return self.read_next().transpose();
    }
}

/// A reader with a look-ahead slot, as needed by the k-way merge.
struct Peeked<'a, D: Decoder<'a>> {
    reader: BlockReader<'a, D>,
    curr: Option<Block>,
    filter_skips: bool,
}

impl<'a, D: Decoder<'a>> Peeked<'a, D> {
    fn new(decoder: D, filter_skips: bool) -> Result<Self> {
        let mut peeked = Peeked {
            reader: BlockReader::new(decoder)?,
            curr: None,
            filter_skips,
        };
        peeked.advance()?;
        return Ok(peeked);
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            self.curr = self.reader.read_next()?;
            match &self.curr {
                Some(block) if self.filter_skips && block.is_skip() => continue,
                _ => return Ok(()),
            }
        }
    }

    /// Take the current block and move on.
    fn take(&mut self) -> Result<Option<Block>> {
        let curr = self.curr.take();
        self.advance()?;
        return Ok(curr);
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Writes blocks client by client without knowing the per-client counts
/// up front. Each client run is buffered as a fragment and the header is
/// written on [`LazyWriter::finish`].
pub struct LazyWriter<E: Encoder> {
    encoder: E,
    client: ClientId,
    written: u64,
    fragments: Vec<(u64, Vec<u8>)>,
}

impl<E: Encoder> LazyWriter<E> {
    pub fn new(encoder: E) -> LazyWriter<E> {
        return LazyWriter {
            encoder,
            client: 0,
            written: 0,
            fragments: Vec::new(),
        };
    }

    /// Write `block` as seen from `offset` units into it.
    pub fn write(&mut self, block: &Block, offset: u32) {
        let id = block.id();
        if self.written > 0 && self.client != id.client {
            self.flush();
        }
        if self.written == 0 {
            self.client = id.client;
            self.encoder.write_client(id.client);
            self.encoder.write_var((id.clock + offset) as u64);
        }
        block.encode(&mut self.encoder, offset);
        self.written += 1;
    }

    fn flush(&mut self) {
        if self.written > 0 {
            let rest = self.encoder.take_rest();
            self.fragments.push((self.written, rest));
            self.written = 0;
        }
    }

    /// Write the fragment table. The encoder is ready for the delete set.
    pub fn finish(mut self) -> E {
        self.flush();
        self.encoder.write_var(self.fragments.len() as u64);
        for (count, bytes) in self.fragments.iter() {
            self.encoder.write_var(*count);
            self.encoder.write_raw(bytes);
        }
        return self.encoder;
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Higher clients first; within a client by clock, real blocks before
/// skips at the same clock.
fn merge_order(a: &Block, b: &Block) -> Ordering {
    let (ia, ib) = (a.id(), b.id());
    if ia.client != ib.client {
        return ib.client.cmp(&ia.client);
    }
    return ia
        .clock
        .cmp(&ib.clock)
        .then_with(|| a.is_skip().cmp(&b.is_skip()));
}

fn merge_with<'a, D: Decoder<'a>, E: Encoder>(decoders: Vec<D>, encoder: E) -> Result<Vec<u8>> {
    let mut readers = decoders
        .into_iter()
        .map(|d| Peeked::new(d, true))
        .collect::<Result<Vec<_>>>()?;
    let mut writer = LazyWriter::new(encoder);
    let mut current: Option<Block> = None;

    loop {
        let mut order: Vec<usize> = (0..readers.len())
            .filter(|&i| readers[i].curr.is_some())
            .collect();
        order.sort_by(|&a, &b| match (&readers[a].curr, &readers[b].curr) {
            (Some(x), Some(y)) => merge_order(x, y),
            _ => Ordering::Equal,
        });
        let Some(&ri) = order.first() else { break };
        let reader = &mut readers[ri];
        let first_client = match &reader.curr {
            Some(block) => block.id().client,
            None => break,
        };

        match current.as_mut() {
            None => {
                current = reader.take()?;
            }
            Some(cw) => {
                let mut iterated = false;
                // drop whatever the block being written already covers
                while let Some(curr) = &reader.curr {
                    if curr.end() <= cw.end() && curr.id().client >= cw.id().client {
                        reader.advance()?;
                        iterated = true;
                    } else {
                        break;
                    }
                }
                let Some(curr) = &reader.curr else { continue };
                let curr_id = curr.id();
                if curr_id.client != first_client || (iterated && curr_id.clock > cw.end()) {
                    continue;
                }
                if first_client != cw.id().client {
                    writer.write(cw, 0);
                    current = reader.take()?;
                } else if cw.end() < curr_id.clock {
                    // gap: fill it with a skip
                    if cw.is_skip() {
                        let start = cw.id().clock;
                        if let Block::Skip(range) = cw {
                            range.len = curr_id.clock - start;
                        }
                    } else {
                        writer.write(cw, 0);
                        let gap = curr_id.clock - cw.end();
                        current = Some(Block::Skip(crate::block::BlockRange::new(
                            Id::new(first_client, cw.end()),
                            gap,
                        )));
                    }
                } else {
                    let diff = cw.end() - curr_id.clock;
                    let mut next = curr.clone();
                    if diff > 0 {
                        if cw.is_skip() {
                            if let Block::Skip(range) = cw {
                                range.len -= diff;
                            }
                        } else {
                            next = next.split(diff);
                        }
                    }
                    if !cw.try_merge(&next) {
                        writer.write(cw, 0);
                        current = Some(next);
                        reader.advance()?;
                    }
                }
            }
        }

        // write through a contiguous run of the same client
        let reader = &mut readers[ri];
        while let (Some(cw), Some(next)) = (current.as_ref(), reader.curr.as_ref()) {
            if next.id().client != first_client || next.id().clock != cw.end() || next.is_skip() {
                break;
            }
            writer.write(cw, 0);
            current = reader.take()?;
        }
    }
    if let Some(cw) = current.as_ref() {
        writer.write(cw, 0);
    }

    let mut encoder = writer.finish();
    let mut ds = DeleteSet::new();
    for reader in readers {
        let mut decoder = reader.reader.finish()?;
        ds.merge(&DeleteSet::decode(&mut decoder)?);
    }
    ds.squash();
    ds.encode(&mut encoder);
    return Ok(encoder.finish());
}

/// Merge v1 updates into one without loading them into a document.
pub fn merge_updates_v1(updates: &[&[u8]]) -> Result<Vec<u8>> {
    if let [single] = updates {
        return Ok(single.to_vec());
    }
    trace!(count = updates.len(), "merging v1 updates");
    let decoders = updates.iter().map(|u| DecoderV1::new(u)).collect();
    return merge_with(decoders, EncoderV1::new());
}

/// Merge v2 updates into one without loading them into a document.
pub fn merge_updates_v2(updates: &[&[u8]]) -> Result<Vec<u8>> {
    if let [single] = updates {
        return Ok(single.to_vec());
    }
    trace!(count = updates.len(), "merging v2 updates");
    let decoders = updates
        .iter()
        .map(|u| DecoderV2::new(u))
        .collect::<Result<Vec<_>>>()?;
    return merge_with(decoders, EncoderV2::new());
}

// =============================================================================
// Diff and conversion
// =============================================================================

fn diff_with<'a, D: Decoder<'a>, E: Encoder>(decoder: D, sv: &StateVector, encoder: E) -> Result<Vec<u8>> {
    let mut reader = Peeked::new(decoder, false)?;
    let mut writer = LazyWriter::new(encoder);
    while let Some(curr) = reader.curr.as_ref() {
        let client = curr.id().client;
        let sv_clock = sv.get(&client);
        if curr.is_skip() {
            reader.advance()?;
            continue;
        }
        if curr.end() > sv_clock {
            writer.write(curr, sv_clock.saturating_sub(curr.id().clock));
            reader.advance()?;
            while let Some(next) = reader.curr.as_ref() {
                if next.id().client != client {
                    break;
                }
                writer.write(next, 0);
                reader.advance()?;
            }
        } else {
            while let Some(next) = reader.curr.as_ref() {
                if next.id().client != client || next.end() > sv_clock {
                    break;
                }
                reader.advance()?;
            }
        }
    }
    let mut encoder = writer.finish();
    let mut decoder = reader.reader.finish()?;
    DeleteSet::decode(&mut decoder)?.encode(&mut encoder);
    return Ok(encoder.finish());
}

/// The part of a v1 update that a peer with state vector `sv` is missing.
/// The delete set is passed through whole.
pub fn diff_updates_v1(update: &[u8], sv: &[u8]) -> Result<Vec<u8>> {
    let sv = StateVector::decode_v1(sv)?;
    return diff_with(DecoderV1::new(update), &sv, EncoderV1::new());
}

pub fn diff_updates_v2(update: &[u8], sv: &[u8]) -> Result<Vec<u8>> {
    let sv = StateVector::decode_v1(sv)?;
    return diff_with(DecoderV2::new(update)?, &sv, EncoderV2::new());
}

fn convert_with<'a, D: Decoder<'a>, E: Encoder>(decoder: D, encoder: E) -> Result<Vec<u8>> {
    let mut reader = BlockReader::new(decoder)?;
    let mut writer = LazyWriter::new(encoder);
    for block in reader.by_ref() {
        writer.write(&block?, 0);
    }
    let mut encoder = writer.finish();
    let mut decoder = reader.finish()?;
    DeleteSet::decode(&mut decoder)?.encode(&mut encoder);
    return Ok(encoder.finish());
}

pub fn convert_update_v1_to_v2(update: &[u8]) -> Result<Vec<u8>> {
    return convert_with(DecoderV1::new(update), EncoderV2::new());
}

pub fn convert_update_v2_to_v1(update: &[u8]) -> Result<Vec<u8>> {
    return convert_with(DecoderV2::new(update)?, EncoderV1::new());
}

// =============================================================================
// State vectors
// =============================================================================

fn state_vector_with<'a, D: Decoder<'a>>(decoder: D) -> Result<StateVector> {
    let mut sv = StateVector::new();
    let mut client: Option<ClientId> = None;
    let mut clock: Clock = 0;
    let mut stop = false;
    for block in BlockReader::new(decoder)? {
        let block = block?;
        let id = block.id();
        if client != Some(id.client) {
            if let (Some(c), true) = (client, clock > 0) {
                sv.set(c, clock);
            }
            client = Some(id.client);
            clock = 0;
            stop = id.clock != 0;
        }
        if block.is_skip() {
            stop = true;
        }
        if !stop {
            clock = block.end();
        }
    }
    if let (Some(c), true) = (client, clock > 0) {
        sv.set(c, clock);
    }
    return Ok(sv);
}

/// The state vector a document would have after applying only this
/// update to an empty state.
pub fn encode_state_vector_from_update_v1(update: &[u8]) -> Result<Vec<u8>> {
    return Ok(state_vector_with(DecoderV1::new(update))?.encode_v1());
}

pub fn encode_state_vector_from_update_v2(update: &[u8]) -> Result<Vec<u8>> {
    return Ok(state_vector_with(DecoderV2::new(update)?)?.encode_v1());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockRange, Item};
    use crate::branch::TypePtr;
    use crate::content::{ItemContent, SplittableString};
    use crate::update::Update;
    use std::sync::Arc;

    fn chain(client: ClientId, start: u32, text: &str) -> Block {
        let origin = if start > 0 { Some(Id::new(client, start - 1)) } else { None };
        let parent = if origin.is_some() { TypePtr::Unknown } else { TypePtr::Named(Arc::from("t")) };
        let item = Item::new(
            Id::new(client, start),
            None,
            origin,
            None,
            None,
            parent,
            None,
            ItemContent::String(SplittableString::from(text)),
        );
        return Block::Item(Box::new(item));
    }

    fn update(blocks: Vec<Block>) -> Update {
        let mut update = Update::new();
        for block in blocks {
            update.blocks.entry(block.id().client).or_default().push(block);
        }
        return update;
    }

    #[test]
    fn streaming_merge_matches_in_memory_merge() {
        let a = update(vec![chain(1, 0, "ab"), chain(2, 0, "x")]);
        let b = update(vec![chain(1, 2, "cd")]);
        let merged = merge_updates_v1(&[&a.encode_v1(), &b.encode_v1()]).unwrap();
        let decoded = Update::decode_v1(&merged).unwrap();
        assert_eq!(decoded.state_vector().get(&1), 4);
        assert_eq!(decoded.state_vector().get(&2), 1);
        let expected = Update::merge([a, b]);
        assert_eq!(decoded.state_vector(), expected.state_vector());
    }

    #[test]
    fn merge_fills_gaps_with_skips() {
        let a = update(vec![chain(1, 0, "ab")]);
        let b = update(vec![chain(1, 5, "z")]);
        let merged = merge_updates_v2(&[&a.encode_v2(), &b.encode_v2()]).unwrap();
        let decoded = Update::decode_v2(&merged).unwrap();
        let blocks = decoded.blocks(&1);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1], Block::Skip(BlockRange::new(Id::new(1, 2), 3)));
    }

    #[test]
    fn diff_drops_known_prefix() {
        let full = update(vec![chain(1, 0, "hello"), chain(2, 0, "x")]);
        let sv = StateVector::from_iter([(1, 3), (2, 1)]);
        let diff = diff_updates_v1(&full.encode_v1(), &sv.encode_v1()).unwrap();
        let decoded = Update::decode_v1(&diff).unwrap();
        assert!(decoded.blocks(&2).is_empty());
        assert_eq!(decoded.blocks(&1)[0].id(), Id::new(1, 3));
        assert_eq!(decoded.blocks(&1)[0].len(), 2);
    }

    #[test]
    fn conversion_roundtrips() {
        let mut u = update(vec![chain(1, 0, "ab"), chain(1, 2, "c"), chain(7, 0, "q")]);
        u.delete_set.insert(Id::new(1, 1), 1);
        let v1 = u.encode_v1();
        let v2 = convert_update_v1_to_v2(&v1).unwrap();
        assert_eq!(convert_update_v2_to_v1(&v2).unwrap(), v1);
        assert_eq!(Update::decode_v2(&v2).unwrap(), Update::decode_v1(&v1).unwrap());
    }

    #[test]
    fn state_vector_stops_at_gaps() {
        let u = update(vec![chain(1, 0, "ab"), chain(1, 4, "c"), chain(2, 3, "x")]);
        let sv = StateVector::decode_v1(&encode_state_vector_from_update_v1(&u.encode_v1()).unwrap()).unwrap();
        assert_eq!(sv.get(&1), 2);
        assert_eq!(sv.get(&2), 0);
    }
}
