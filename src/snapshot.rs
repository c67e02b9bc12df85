//! Point-in-time views of a document.
//!
//! A snapshot is a state vector plus the delete set at that moment. An
//! item unit is visible in the snapshot if its clock is covered by the
//! state vector and it was not yet deleted. Reading a document at a
//! snapshot only works while deleted content is still around, that is
//! with garbage collection disabled.

use crate::delete_set::DeleteSet;
use crate::encoding::codec::{Decoder, DecoderV1, DecoderV2, Encoder, EncoderV1, EncoderV2};
use crate::error::Result;
use crate::id::Id;
use crate::state_vector::StateVector;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub state_vector: StateVector,
    pub delete_set: DeleteSet,
}

impl Snapshot {
    pub fn new(state_vector: StateVector, mut delete_set: DeleteSet) -> Snapshot {
        delete_set.squash();
        return Snapshot {
            state_vector,
            delete_set,
        };
    }

    /// Whether the unit `id` existed and was not deleted at this snapshot.
    pub fn is_visible(&self, id: &Id) -> bool {
        return self.state_vector.contains(id) && !self.delete_set.is_deleted(id);
    }

    pub fn encode<E: Encoder>(&self, encoder: &mut E) {
        self.delete_set.encode(encoder);
        self.state_vector.encode(encoder);
    }

    pub fn decode<'a, D: Decoder<'a>>(decoder: &mut D) -> Result<Snapshot> {
        let delete_set = DeleteSet::decode(decoder)?;
        let state_vector = StateVector::decode(decoder)?;
        return Ok(Snapshot {
            state_vector,
            delete_set,
        });
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

    pub fn decode_v1(buf: &[u8]) -> Result<Snapshot> {
        return Snapshot::decode(&mut DecoderV1::new(buf));
    }

    pub fn decode_v2(buf: &[u8]) -> Result<Snapshot> {
        return Snapshot::decode(&mut DecoderV2::new(buf)?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Doc, Options};
    use crate::value::Value;

    fn doc_without_gc() -> Doc {
        return Doc::with_options(Options {
            client_id: 1,
            gc: false,
            ..Options::default()
        });
    }

    #[test]
    fn visibility() {
        let mut ds = DeleteSet::new();
        ds.insert(Id::new(1, 2), 2);
        let sv: StateVector = [(1, 5)].into_iter().collect();
        let snapshot = Snapshot::new(sv, ds);
        assert!(snapshot.is_visible(&Id::new(1, 0)));
        assert!(!snapshot.is_visible(&Id::new(1, 3)));
        assert!(snapshot.is_visible(&Id::new(1, 4)));
        assert!(!snapshot.is_visible(&Id::new(1, 5)));
        assert!(!snapshot.is_visible(&Id::new(2, 0)));
    }

    #[test]
    fn encoding_round_trips() {
        let mut doc = doc_without_gc();
        let text = doc.get_or_insert_text("t").unwrap();
        doc.transact(|txn| text.insert(txn, 0, "abcdef").unwrap());
        doc.transact(|txn| text.remove_range(txn, 1, 2).unwrap());
        let snapshot = doc.snapshot();
        assert_eq!(Snapshot::decode_v1(&snapshot.encode_v1()).unwrap(), snapshot);
        assert_eq!(Snapshot::decode_v2(&snapshot.encode_v2()).unwrap(), snapshot);
    }

    #[test]
    fn reading_past_states() {
        let mut doc = doc_without_gc();
        let text = doc.get_or_insert_text("t").unwrap();
        let array = doc.get_or_insert_array("a").unwrap();
        doc.transact(|txn| {
            text.insert(txn, 0, "hello").unwrap();
            array.insert_range(txn, 0, [1.0, 2.0, 3.0]).unwrap();
        });
        let before = doc.snapshot();
        doc.transact(|txn| {
            text.remove_range(txn, 0, 1).unwrap();
            text.insert(txn, 4, " world").unwrap();
            array.remove(txn, 1).unwrap();
        });
        assert_eq!(text.get_string(&doc), "ello world");

        let old: String = text
            .diff_at(&doc, &before)
            .into_iter()
            .map(|run| run.insert.to_string())
            .collect();
        assert_eq!(old, "hello");
        let values: Vec<f64> = array
            .to_vec_at(&doc, &before)
            .iter()
            .filter_map(|v| match v {
                Value::Any(any) => any.as_f64(),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }
}
