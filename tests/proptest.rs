//! Property-based convergence tests: random edits on three replicas,
//! exchanged in random order, must always end in the same state.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use stitch::{ArrayRef, Doc, MapRef, StateVector, TextRef};

// =============================================================================
// Test helpers
// =============================================================================

const REPLICAS: usize = 3;

#[derive(Clone, Debug)]
enum Op {
    Insert { replica: usize, pos_pct: f64, content: String },
    Delete { replica: usize, pos_pct: f64, len_pct: f64 },
    SetKey { replica: usize, key: u8, value: i32 },
    Push { replica: usize, value: i32 },
    /// Apply one of the updates produced so far, picked by position in
    /// the global log. May be out of order or a duplicate.
    Deliver { to: usize, pick_pct: f64 },
}

fn arbitrary_op() -> impl Strategy<Value = Op> {
    let replica = 0..REPLICAS;
    prop_oneof![
        (replica.clone(), 0.0..=1.0f64, "[a-z]{1,6}")
            .prop_map(|(replica, pos_pct, content)| Op::Insert { replica, pos_pct, content }),
        (replica.clone(), 0.0..=1.0f64, 0.0..=0.5f64)
            .prop_map(|(replica, pos_pct, len_pct)| Op::Delete { replica, pos_pct, len_pct }),
        (replica.clone(), 0..3u8, any::<i32>()).prop_map(|(replica, key, value)| Op::SetKey { replica, key, value }),
        (replica.clone(), any::<i32>()).prop_map(|(replica, value)| Op::Push { replica, value }),
        (replica, 0.0..1.0f64).prop_map(|(to, pick_pct)| Op::Deliver { to, pick_pct }),
    ]
}

struct Replica {
    doc: Doc,
    text: TextRef,
    map: MapRef,
    array: ArrayRef,
}

impl Replica {
    fn new(client_id: u64, log: &Rc<RefCell<Vec<Vec<u8>>>>) -> Replica {
        let mut doc = Doc::with_client_id(client_id);
        let text = doc.get_or_insert_text("text").unwrap();
        let map = doc.get_or_insert_map("map").unwrap();
        let array = doc.get_or_insert_array("array").unwrap();
        let sink = log.clone();
        doc.observe_update_v1(move |event| sink.borrow_mut().push(event.update.clone()));
        return Replica { doc, text, map, array };
    }

    fn state(&self) -> (String, serde_json::Value, serde_json::Value) {
        return (
            self.text.get_string(&self.doc),
            self.map.to_json(&self.doc).to_json(),
            self.array.to_json(&self.doc).to_json(),
        );
    }
}

fn apply_op(replicas: &mut [Replica], log: &Rc<RefCell<Vec<Vec<u8>>>>, op: &Op) {
    match op {
        Op::Insert { replica, pos_pct, content } => {
            let r = &mut replicas[*replica];
            let text = r.text;
            r.doc.transact(|txn| {
                let len = text.len(&*txn);
                let pos = ((*pos_pct * len as f64) as u32).min(len);
                text.insert(txn, pos, content).unwrap();
            });
        }
        Op::Delete { replica, pos_pct, len_pct } => {
            let r = &mut replicas[*replica];
            let text = r.text;
            r.doc.transact(|txn| {
                let len = text.len(&*txn);
                if len == 0 {
                    return;
                }
                let start = ((*pos_pct * len as f64) as u32).min(len - 1);
                let max_len = len - start;
                let del_len = ((*len_pct * max_len as f64) as u32).clamp(1, max_len);
                text.remove_range(txn, start, del_len).unwrap();
            });
        }
        Op::SetKey { replica, key, value } => {
            let r = &mut replicas[*replica];
            let map = r.map;
            let key = format!("k{}", key);
            r.doc.transact(|txn| map.insert(txn, &key, *value as f64));
        }
        Op::Push { replica, value } => {
            let r = &mut replicas[*replica];
            let array = r.array;
            r.doc.transact(|txn| array.push_back(txn, *value as f64));
        }
        Op::Deliver { to, pick_pct } => {
            let update = {
                let log = log.borrow();
                if log.is_empty() {
                    return;
                }
                let idx = ((*pick_pct * log.len() as f64) as usize).min(log.len() - 1);
                log[idx].clone()
            };
            replicas[*to].doc.apply_update_v1(&update).unwrap();
        }
    }
}

// =============================================================================
// Convergence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Once every replica saw every update, all replicas agree.
    #[test]
    fn replicas_converge(ops in prop::collection::vec(arbitrary_op(), 1..60)) {
        let log: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
        let mut replicas: Vec<Replica> = (0..REPLICAS).map(|i| Replica::new(i as u64 + 1, &log)).collect();
        for op in &ops {
            apply_op(&mut replicas, &log, op);
        }

        let updates = log.borrow().clone();
        for replica in replicas.iter_mut() {
            for update in updates.iter() {
                replica.doc.apply_update_v1(update).unwrap();
            }
        }
        for replica in replicas.iter() {
            prop_assert!(!replica.doc.has_pending());
        }
        let expected = replicas[0].state();
        for replica in replicas.iter().skip(1) {
            prop_assert_eq!(&replica.state(), &expected);
        }

        // a late joiner receiving everything backwards
        let late_log: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
        let mut late = Replica::new(99, &late_log);
        for update in updates.iter().rev() {
            late.doc.apply_update_v1(update).unwrap();
        }
        prop_assert!(!late.doc.has_pending());
        prop_assert_eq!(late.state(), expected);
    }

    /// A full state update restores the same document in both encodings.
    #[test]
    fn snapshots_restore_state(ops in prop::collection::vec(arbitrary_op(), 1..40)) {
        let log: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
        let mut replicas: Vec<Replica> = (0..REPLICAS).map(|i| Replica::new(i as u64 + 1, &log)).collect();
        for op in &ops {
            apply_op(&mut replicas, &log, op);
        }
        let source = &replicas[0];
        let empty = StateVector::new();

        let scratch: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
        let mut from_v1 = Replica::new(10, &scratch);
        from_v1.doc.apply_update_v1(&source.doc.encode_state_as_update_v1(&empty)).unwrap();
        let mut from_v2 = Replica::new(11, &scratch);
        from_v2.doc.apply_update_v2(&source.doc.encode_state_as_update_v2(&empty)).unwrap();

        prop_assert_eq!(from_v1.state(), source.state());
        prop_assert_eq!(from_v2.state(), source.state());
        prop_assert_eq!(from_v1.doc.state_vector(), source.doc.state_vector());
    }
}
