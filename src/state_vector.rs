//! State vectors: per-client "next expected clock" summaries.
//!
//! A state vector is the compact answer to "what do you already have". Two
//! replicas exchange state vectors, then each sends the blocks the other
//! has not seen yet.

use rustc_hash::FxHashMap;

use crate::encoding::codec::{Decoder, DecoderV1, Encoder, EncoderV1};
use crate::error::Result;
use crate::id::{ClientId, Clock, Id};

/// Maps each client to the first clock not yet integrated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateVector(FxHashMap<ClientId, Clock>);

impl StateVector {
    pub fn new() -> StateVector {
        return StateVector::default();
    }

    /// The next expected clock of `client` (zero if unknown).
    #[inline]
    pub fn get(&self, client: &ClientId) -> Clock {
        return self.0.get(client).copied().unwrap_or(0);
    }

    pub fn set(&mut self, client: ClientId, clock: Clock) {
        self.0.insert(client, clock);
    }

    /// Raise the entry of `client` to at least `clock`.
    pub fn set_max(&mut self, client: ClientId, clock: Clock) {
        let entry = self.0.entry(client).or_insert(0);
        *entry = (*entry).max(clock);
    }

    /// Lower the entry of `client` to at most `clock`, inserting it if missing.
    pub fn set_min(&mut self, client: ClientId, clock: Clock) {
        match self.0.get_mut(&client) {
            Some(entry) => *entry = (*entry).min(clock),
            None => {
                self.0.insert(client, clock);
            }
        }
    }

    /// Check if the unit `id` is covered.
    #[inline]
    pub fn contains(&self, id: &Id) -> bool {
        return id.clock < self.get(&id.client);
    }

    pub fn contains_client(&self, client: &ClientId) -> bool {
        return self.0.contains_key(client);
    }

    pub fn len(&self) -> usize {
        return self.0.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.0.is_empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &Clock)> {
        return self.0.iter();
    }

    /// Take the per-client maximum of both vectors.
    pub fn merge(&mut self, other: &StateVector) {
        for (client, clock) in other.iter() {
            self.set_max(*client, *clock);
        }
    }

    /// Entries sorted by client, highest first (the wire order).
    pub fn sorted_desc(&self) -> Vec<(ClientId, Clock)> {
        let mut entries: Vec<_> = self.0.iter().map(|(c, k)| (*c, *k)).collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        return entries;
    }

    pub fn encode<E: Encoder>(&self, encoder: &mut E) {
        let entries = self.sorted_desc();
        encoder.write_var(entries.len() as u64);
        for (client, clock) in entries {
            encoder.write_var(client);
            encoder.write_var(clock as u64);
        }
    }

    pub fn decode<'a, D: Decoder<'a>>(decoder: &mut D) -> Result<StateVector> {
        let len = decoder.read_var()? as usize;
        let mut sv = StateVector::default();
        sv.0.reserve(len.min(1024));
        for _ in 0..len {
            let client = decoder.read_var()?;
            let clock = decoder.read_var_u32()?;
            sv.0.insert(client, clock);
        }
        return Ok(sv);
    }

    /// Encode as a standalone message. Both update formats share this layout.
    pub fn encode_v1(&self) -> Vec<u8> {
        let mut encoder = EncoderV1::new();
        self.encode(&mut encoder);
        return encoder.finish();
    }

    pub fn decode_v1(buf: &[u8]) -> Result<StateVector> {
        return StateVector::decode(&mut DecoderV1::new(buf));
    }
}

impl FromIterator<(ClientId, Clock)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ClientId, Clock)>>(iter: T) -> StateVector {
        return StateVector(iter.into_iter().collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_clients_read_as_zero() {
        let sv = StateVector::from_iter([(1, 5)]);
        assert_eq!(sv.get(&1), 5);
        assert_eq!(sv.get(&2), 0);
        assert!(sv.contains(&Id::new(1, 4)));
        assert!(!sv.contains(&Id::new(1, 5)));
    }

    #[test]
    fn encoding_is_sorted_descending() {
        let sv = StateVector::from_iter([(1, 5), (300, 2), (7, 1)]);
        let bytes = sv.encode_v1();
        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..4], &[0xac, 0x02, 2]);
        assert_eq!(StateVector::decode_v1(&bytes).unwrap(), sv);
    }

    #[test]
    fn merge_takes_maximum() {
        let mut a = StateVector::from_iter([(1, 5), (2, 1)]);
        let b = StateVector::from_iter([(1, 3), (2, 4), (3, 1)]);
        a.merge(&b);
        assert_eq!(a, StateVector::from_iter([(1, 5), (2, 4), (3, 1)]));
    }
}
