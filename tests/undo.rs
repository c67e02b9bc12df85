//! Undo and redo across replicas and nested types.

use std::time::Duration;

use serde_json::json;
use stitch::{Doc, In, UndoManager, UndoOptions};

fn separate_steps() -> UndoOptions {
    return UndoOptions {
        capture_timeout: Duration::ZERO,
        ..UndoOptions::default()
    };
}

fn sync(a: &mut Doc, b: &mut Doc) {
    let to_b = a.diff_update(&b.state_vector());
    let to_a = b.diff_update(&a.state_vector());
    b.apply_update(to_b);
    a.apply_update(to_a);
}

#[test]
fn undo_only_reverts_own_changes_on_every_replica() {
    let mut a = Doc::with_client_id(1);
    let mut b = Doc::with_client_id(2);
    let ta = a.get_or_insert_text("t").unwrap();
    let tb = b.get_or_insert_text("t").unwrap();
    let undo = UndoManager::with_options(&mut a, &ta, separate_steps());

    a.transact(|txn| ta.insert(txn, 0, "abc").unwrap());
    sync(&mut a, &mut b);
    b.transact(|txn| tb.insert(txn, 0, "X").unwrap());
    sync(&mut a, &mut b);
    assert_eq!(ta.get_string(&a), "Xabc");

    assert!(undo.undo(&mut a));
    sync(&mut a, &mut b);
    assert_eq!(ta.get_string(&a), "X");
    assert_eq!(tb.get_string(&b), "X");

    assert!(undo.redo(&mut a));
    sync(&mut a, &mut b);
    assert_eq!(ta.get_string(&a), "Xabc");
    assert_eq!(tb.get_string(&b), "Xabc");
}

#[test]
fn removed_nested_type_comes_back_with_its_content() {
    let mut doc = Doc::with_client_id(1);
    let root = doc.get_or_insert_map("root").unwrap();
    let undo = UndoManager::with_options(&mut doc, &root, separate_steps());

    doc.transact(|txn| root.insert(txn, "list", In::Array(vec![In::from(1.0), In::from(2.0)])));
    doc.transact(|txn| {
        root.remove(txn, "list");
    });
    assert_eq!(root.to_json(&doc).to_json(), json!({}));

    assert!(undo.undo(&mut doc));
    assert_eq!(root.to_json(&doc).to_json(), json!({"list": [1, 2]}));
    assert!(undo.undo(&mut doc));
    assert_eq!(root.to_json(&doc).to_json(), json!({}));
    assert!(undo.redo(&mut doc));
    assert_eq!(root.to_json(&doc).to_json(), json!({"list": [1, 2]}));
}

#[test]
fn changes_outside_the_scope_are_ignored() {
    let mut doc = Doc::with_client_id(1);
    let tracked = doc.get_or_insert_array("tracked").unwrap();
    let other = doc.get_or_insert_array("other").unwrap();
    let undo = UndoManager::with_options(&mut doc, &tracked, separate_steps());

    doc.transact(|txn| other.push_back(txn, "x"));
    assert!(!undo.can_undo());

    undo.expand_scope(&other);
    doc.transact(|txn| other.push_back(txn, "y"));
    assert!(undo.undo(&mut doc));
    assert_eq!(other.to_json(&doc).to_json(), json!(["x"]));
}

#[test]
fn destroyed_manager_stops_tracking() {
    let mut doc = Doc::with_client_id(1);
    let text = doc.get_or_insert_text("t").unwrap();
    let undo = UndoManager::new(&mut doc, &text);
    doc.transact(|txn| text.insert(txn, 0, "a").unwrap());
    undo.destroy(&mut doc);

    let undo = UndoManager::new(&mut doc, &text);
    assert!(!undo.can_undo());
    assert!(!undo.undo(&mut doc));
    assert_eq!(text.get_string(&doc), "a");
}
