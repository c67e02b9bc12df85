//! Wire format tests: both encodings, and the helpers that work on encoded
//! updates without a document.

use serde_json::json;
use stitch::{
    convert_update_v1_to_v2, convert_update_v2_to_v1, diff_updates_v1, encode_state_vector_from_update_v1,
    encode_state_vector_from_update_v2, merge_updates_v1, merge_updates_v2, Doc, StateVector, Update,
};

/// A document with a bit of everything, plus the v1 updates that built it.
fn sample() -> (Doc, Vec<Vec<u8>>) {
    let mut doc = Doc::with_client_id(7);
    let text = doc.get_or_insert_text("text").unwrap();
    let map = doc.get_or_insert_map("map").unwrap();
    let updates = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = updates.clone();
    doc.observe_update_v1(move |event| sink.borrow_mut().push(event.update.clone()));

    doc.transact(|txn| text.insert(txn, 0, "hello world").unwrap());
    doc.transact(|txn| {
        map.insert(txn, "n", 42.0);
        map.insert(txn, "s", "str");
        map.insert(txn, "bytes", stitch::Any::Buffer(vec![1u8, 2, 3].into()));
    });
    doc.transact(|txn| text.remove_range(txn, 0, 6).unwrap());
    let updates = updates.borrow().clone();
    return (doc, updates);
}

fn state(doc: &mut Doc) -> serde_json::Value {
    let text = doc.get_or_insert_text("text").unwrap();
    let map = doc.get_or_insert_map("map").unwrap();
    return json!({
        "text": text.get_string(&*doc),
        "map": map.to_json(&*doc).to_json(),
    });
}

#[test]
fn v1_and_v2_restore_the_same_state() {
    let (mut doc, _) = sample();
    let expected = state(&mut doc);

    let mut from_v1 = Doc::with_client_id(1);
    from_v1.apply_update_v1(&doc.encode_state_as_update_v1(&StateVector::new())).unwrap();
    let mut from_v2 = Doc::with_client_id(2);
    from_v2.apply_update_v2(&doc.encode_state_as_update_v2(&StateVector::new())).unwrap();

    assert_eq!(state(&mut from_v1), expected);
    assert_eq!(state(&mut from_v2), expected);
    assert_eq!(expected["text"], json!("world"));
}

#[test]
fn merged_updates_equal_applying_each() {
    let (mut doc, updates) = sample();
    assert_eq!(updates.len(), 3);
    let parts: Vec<&[u8]> = updates.iter().map(|u| u.as_slice()).collect();
    let merged = merge_updates_v1(&parts).unwrap();

    let mut target = Doc::with_client_id(1);
    target.apply_update_v1(&merged).unwrap();
    assert_eq!(state(&mut target), state(&mut doc));
    assert_eq!(target.state_vector(), doc.state_vector());
}

#[test]
fn merging_v2_updates() {
    let (mut doc, updates) = sample();
    let v2: Vec<Vec<u8>> = updates.iter().map(|u| convert_update_v1_to_v2(u).unwrap()).collect();
    let parts: Vec<&[u8]> = v2.iter().map(|u| u.as_slice()).collect();
    let merged = merge_updates_v2(&parts).unwrap();

    let mut target = Doc::with_client_id(1);
    target.apply_update_v2(&merged).unwrap();
    assert_eq!(state(&mut target), state(&mut doc));
}

#[test]
fn state_vector_from_update() {
    let (doc, _) = sample();
    let update = doc.encode_state_as_update_v1(&StateVector::new());
    let sv = StateVector::decode_v1(&encode_state_vector_from_update_v1(&update).unwrap()).unwrap();
    assert_eq!(sv, doc.state_vector());

    let v2 = doc.encode_state_as_update_v2(&StateVector::new());
    let sv = StateVector::decode_v1(&encode_state_vector_from_update_v2(&v2).unwrap()).unwrap();
    assert_eq!(sv, doc.state_vector());
}

#[test]
fn diffing_an_encoded_update() {
    let (mut doc, updates) = sample();
    let mut partial = Doc::with_client_id(1);
    partial.apply_update_v1(&updates[0]).unwrap();

    let full = doc.encode_state_as_update_v1(&StateVector::new());
    let missing = diff_updates_v1(&full, &partial.encode_state_vector_v1()).unwrap();
    assert!(missing.len() < full.len());
    partial.apply_update_v1(&missing).unwrap();
    assert_eq!(state(&mut partial), state(&mut doc));
}

#[test]
fn conversion_preserves_content() {
    let (mut doc, _) = sample();
    let v1 = doc.encode_state_as_update_v1(&StateVector::new());
    let back = convert_update_v2_to_v1(&convert_update_v1_to_v2(&v1).unwrap()).unwrap();
    let mut target = Doc::with_client_id(1);
    target.apply_update_v1(&back).unwrap();
    assert_eq!(state(&mut target), state(&mut doc));
}

#[test]
fn garbage_is_rejected() {
    let mut doc = Doc::new();
    assert!(doc.apply_update_v1(&[0xff, 0xff, 0xff]).is_err());
    assert!(doc.apply_update_v2(&[]).is_err());
    assert!(Update::decode_v1(&[1, 1]).is_err());
}
