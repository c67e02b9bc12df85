//! Behaviour every replica must agree on: local edits, concurrent edits
//! exchanged through updates, and delivery in any order.
//!
//! Replicas are created with fixed client ids so that the tie-breaking of
//! concurrent inserts (lower client id goes left) is predictable.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;
use stitch::{Any, Delta, Doc, In, SharedRef, StateVector, Update, Value};

// =============================================================================
// Helpers
// =============================================================================

/// Exchange everything both replicas are missing.
fn sync(a: &mut Doc, b: &mut Doc) {
    let to_b = a.diff_update(&b.state_vector());
    let to_a = b.diff_update(&a.state_vector());
    b.apply_update(to_b);
    a.apply_update(to_a);
}

fn full_update(doc: &Doc) -> Vec<u8> {
    return doc.encode_state_as_update_v1(&StateVector::new());
}

// =============================================================================
// Text
// =============================================================================

#[test]
fn text_insert_and_remove() {
    let mut doc = Doc::with_client_id(1);
    let text = doc.get_or_insert_text("t").unwrap();
    doc.transact(|txn| {
        text.insert(txn, 0, "hd").unwrap();
        text.insert(txn, 1, "ello worl").unwrap();
    });
    assert_eq!(text.get_string(&doc), "hello world");
    assert_eq!(text.len(&doc), 11);

    doc.transact(|txn| text.remove_range(txn, 5, 6).unwrap());
    assert_eq!(text.get_string(&doc), "hello");
    assert!(doc.transact(|txn| text.insert(txn, 6, "!")).is_err());
}

#[test]
fn text_lengths_are_utf16() {
    let mut doc = Doc::with_client_id(1);
    let text = doc.get_or_insert_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "a😀b").unwrap());
    assert_eq!(text.len(&doc), 4);
    doc.transact(|txn| text.insert(txn, 3, "é").unwrap());
    assert_eq!(text.get_string(&doc), "a😀éb");
    doc.transact(|txn| text.remove_range(txn, 1, 2).unwrap());
    assert_eq!(text.get_string(&doc), "aéb");
}

#[test]
fn concurrent_inserts_at_same_position() {
    let mut a = Doc::with_client_id(1);
    let mut b = Doc::with_client_id(2);
    let ta = a.get_or_insert_text("t").unwrap();
    let tb = b.get_or_insert_text("t").unwrap();
    a.transact(|txn| ta.insert(txn, 0, "a").unwrap());
    b.transact(|txn| tb.insert(txn, 0, "b").unwrap());
    sync(&mut a, &mut b);
    assert_eq!(ta.get_string(&a), "ab");
    assert_eq!(tb.get_string(&b), "ab");
}

#[test]
fn concurrent_delete_and_insert() {
    let mut a = Doc::with_client_id(1);
    let mut b = Doc::with_client_id(2);
    let ta = a.get_or_insert_text("t").unwrap();
    let tb = b.get_or_insert_text("t").unwrap();
    a.transact(|txn| ta.insert(txn, 0, "abc").unwrap());
    sync(&mut a, &mut b);

    a.transact(|txn| ta.remove_range(txn, 1, 1).unwrap());
    b.transact(|txn| tb.insert(txn, 2, "x").unwrap());
    sync(&mut a, &mut b);
    assert_eq!(ta.get_string(&a), "axc");
    assert_eq!(tb.get_string(&b), "axc");
}

#[test]
fn text_events_carry_deltas() {
    let mut a = Doc::with_client_id(1);
    let mut b = Doc::with_client_id(2);
    let ta = a.get_or_insert_text("t").unwrap();
    let tb = b.get_or_insert_text("t").unwrap();
    a.transact(|txn| ta.insert(txn, 0, "hello").unwrap());
    sync(&mut a, &mut b);

    let seen: Rc<RefCell<Vec<Delta>>> = Rc::default();
    let sink = seen.clone();
    tb.observe(&mut b, move |_, event| sink.borrow_mut().extend(event.delta().iter().cloned()));

    a.transact(|txn| {
        ta.remove_range(txn, 0, 1).unwrap();
        ta.insert(txn, 2, "!").unwrap();
    });
    sync(&mut a, &mut b);
    assert_eq!(tb.get_string(&b), "el!lo");

    let delta = seen.borrow();
    assert_eq!(delta.len(), 3);
    assert_eq!(delta[0], Delta::Deleted(1));
    assert_eq!(delta[1], Delta::Retain(2, None));
    match &delta[2] {
        Delta::Inserted(values, None) => {
            let inserted: String = values.iter().map(|v| v.to_string()).collect();
            assert_eq!(inserted, "!");
        }
        other => panic!("unexpected delta {:?}", other),
    }
}

// =============================================================================
// Arrays and maps
// =============================================================================

#[test]
fn array_operations() {
    let mut doc = Doc::with_client_id(1);
    let array = doc.get_or_insert_array("a").unwrap();
    doc.transact(|txn| {
        array.insert_range(txn, 0, [1.0, 2.0, 3.0]).unwrap();
        array.push_front(txn, "first");
        array.push_back(txn, true);
    });
    assert_eq!(array.to_json(&doc).to_json(), json!(["first", 1, 2, 3, true]));
    doc.transact(|txn| array.remove_range(txn, 1, 3).unwrap());
    assert_eq!(array.to_json(&doc).to_json(), json!(["first", true]));
    assert!(array.try_get(&doc, 2).is_err());
}

#[test]
fn concurrent_map_writes_pick_one_winner() {
    let mut a = Doc::with_client_id(1);
    let mut b = Doc::with_client_id(2);
    let ma = a.get_or_insert_map("m").unwrap();
    let mb = b.get_or_insert_map("m").unwrap();
    a.transact(|txn| ma.insert(txn, "k", "from a"));
    b.transact(|txn| mb.insert(txn, "k", "from b"));
    sync(&mut a, &mut b);
    assert_eq!(ma.get(&a, "k"), mb.get(&b, "k"));
    assert_eq!(ma.get(&a, "k"), Some(Value::Any(Any::from("from b"))));
}

#[test]
fn nested_types_replicate() {
    let mut a = Doc::with_client_id(1);
    let mut b = Doc::with_client_id(2);
    let root = a.get_or_insert_map("root").unwrap();
    a.transact(|txn| {
        root.insert(txn, "list", In::Array(vec![In::from(1.0), In::from("two")]));
        root.insert(txn, "title", In::Text("draft".to_string()));
    });
    sync(&mut a, &mut b);
    let other = b.get_or_insert_map("root").unwrap();
    assert_eq!(
        other.to_json(&b).to_json(),
        json!({"list": [1, "two"], "title": "draft"})
    );

    let Some(Value::Array(list)) = other.get(&b, "list") else {
        panic!("expected a nested array");
    };
    b.transact(|txn| list.push_back(txn, 3.0));
    sync(&mut a, &mut b);
    assert_eq!(root.to_json(&a), other.to_json(&b));
}

#[test]
fn root_type_mismatch_is_an_error() {
    let mut doc = Doc::new();
    doc.get_or_insert_map("x").unwrap();
    assert!(doc.get_or_insert_array("x").is_err());
}

// =============================================================================
// Delivery
// =============================================================================

#[test]
fn updates_apply_in_any_order() {
    let mut source = Doc::with_client_id(1);
    let text = source.get_or_insert_text("t").unwrap();
    let mut updates = Vec::new();
    for chunk in ["one ", "two ", "three"] {
        let sv = source.state_vector();
        source.transact(|txn| {
            let len = text.len(&*txn);
            text.insert(txn, len, chunk).unwrap();
        });
        updates.push(source.encode_state_as_update_v1(&sv));
    }

    let mut target = Doc::with_client_id(2);
    for update in updates.iter().rev() {
        target.apply_update_v1(update).unwrap();
    }
    assert!(!target.has_pending());
    let received = target.get_or_insert_text("t").unwrap();
    assert_eq!(received.get_string(&target), "one two three");
}

#[test]
fn missing_dependencies_stay_pending() {
    let mut source = Doc::with_client_id(1);
    let text = source.get_or_insert_text("t").unwrap();
    source.transact(|txn| text.insert(txn, 0, "ab").unwrap());
    let sv = source.state_vector();
    source.transact(|txn| text.insert(txn, 2, "cd").unwrap());
    let tail = source.encode_state_as_update_v1(&sv);

    let mut target = Doc::with_client_id(2);
    target.apply_update_v1(&tail).unwrap();
    assert!(target.has_pending());
    let received = target.get_or_insert_text("t").unwrap();
    assert_eq!(received.get_string(&target), "");

    target.apply_update_v1(&full_update(&source)).unwrap();
    assert!(!target.has_pending());
    assert_eq!(received.get_string(&target), "abcd");
}

#[test]
fn applying_twice_changes_nothing() {
    let mut source = Doc::with_client_id(1);
    let array = source.get_or_insert_array("a").unwrap();
    source.transact(|txn| array.insert_range(txn, 0, ["x", "y"]).unwrap());
    source.transact(|txn| array.remove(txn, 0).unwrap());
    let update = full_update(&source);

    let mut target = Doc::with_client_id(2);
    target.apply_update_v1(&update).unwrap();
    target.apply_update_v1(&update).unwrap();
    let received = target.get_or_insert_array("a").unwrap();
    assert_eq!(received.to_json(&target).to_json(), json!(["y"]));
    assert_eq!(target.state_vector(), source.state_vector());
}

#[test]
fn empty_update_round_trips() {
    let update = Update::new();
    assert!(update.is_empty());
    let decoded = Update::decode_v1(&update.encode_v1()).unwrap();
    assert!(decoded.is_empty());
}
