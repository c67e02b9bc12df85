//! Change events delivered to type observers.
//!
//! An [`Event`] is computed once per changed type when a transaction
//! commits, comparing the type's current item chain against the
//! transaction's before-state and delete set.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::any::Any;
use crate::block::Item;
use crate::branch::{BranchId, TypePtr, TypeRef};
use crate::content::ItemContent;
use crate::delete_set::DeleteSet;
use crate::state_vector::StateVector;
use crate::store::Store;
use crate::transaction::{ReadTxn, Transaction};
use crate::value::Value;

/// Formatting attributes attached to a text range.
pub type Attrs = BTreeMap<Arc<str>, Any>;

/// One step from an observed type down to a nested one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(Arc<str>),
    Index(u32),
}

/// What happened to one map key.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryChange {
    Inserted(Value),
    /// Old value, new value.
    Updated(Value, Value),
    Removed(Value),
}

/// Sequence change, in the usual retain / insert / delete form.
#[derive(Clone, Debug, PartialEq)]
pub enum Delta {
    Inserted(Vec<Value>, Option<Box<Attrs>>),
    Deleted(u32),
    Retain(u32, Option<Box<Attrs>>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub(crate) target: BranchId,
    pub(crate) path: Vec<PathSegment>,
    pub(crate) keys: BTreeMap<Arc<str>, EntryChange>,
    pub(crate) delta: Vec<Delta>,
}

impl Event {
    pub(crate) fn new(
        txn: &Transaction<'_>,
        target: BranchId,
        changed: &FxHashSet<Option<Arc<str>>>,
    ) -> Event {
        let scope = Scope {
            store: &txn.doc.store,
            before: &txn.state.before_state,
            deleted: &txn.state.delete_set,
        };
        let keys = changed
            .iter()
            .flatten()
            .filter_map(|key| Some((key.clone(), scope.key_change(target, key)?)))
            .collect();
        let delta = if !changed.contains(&None) {
            Vec::new()
        } else if is_text(&scope.store.branch(target).type_ref) {
            scope.text_delta(target)
        } else {
            scope.list_delta(target)
        };
        return Event {
            target,
            path: Vec::new(),
            keys,
            delta,
        };
    }

    /// The changed type.
    pub fn target<T: ReadTxn>(&self, txn: &T) -> Value {
        return Value::from_branch(txn.store(), self.target);
    }

    pub fn target_id(&self) -> BranchId {
        return self.target;
    }

    /// Path from the deep-observed type to [`Event::target`]. Empty for
    /// shallow observers.
    pub fn path(&self) -> &[PathSegment] {
        return &self.path;
    }

    pub fn keys(&self) -> &BTreeMap<Arc<str>, EntryChange> {
        return &self.keys;
    }

    pub fn delta(&self) -> &[Delta] {
        return &self.delta;
    }

    /// Steps leading from `ancestor` down to `target`.
    pub(crate) fn path_between(store: &Store, ancestor: BranchId, target: BranchId) -> Vec<PathSegment> {
        let mut path = Vec::new();
        let mut child = target;
        while child != ancestor {
            let Some(anchor) = store.branch(child).item.and_then(|id| store.item(&id)) else {
                break;
            };
            let TypePtr::Branch(parent) = anchor.parent else {
                break;
            };
            match &anchor.parent_sub {
                Some(key) => path.push(PathSegment::Key(key.clone())),
                None => {
                    let index = store
                        .iter_items(parent)
                        .take_while(|item| item.id != anchor.id)
                        .map(Item::content_len)
                        .sum();
                    path.push(PathSegment::Index(index));
                }
            }
            child = parent;
        }
        path.reverse();
        return path;
    }
}

fn is_text(type_ref: &TypeRef) -> bool {
    return matches!(type_ref, TypeRef::Text | TypeRef::XmlText);
}

/// What a transaction did, as seen from one type.
struct Scope<'a> {
    store: &'a Store,
    before: &'a StateVector,
    deleted: &'a DeleteSet,
}

impl Scope<'_> {
    fn adds(&self, item: &Item) -> bool {
        return item.id.clock >= self.before.get(&item.id.client);
    }

    fn deletes(&self, item: &Item) -> bool {
        return self.deleted.is_deleted(&item.id);
    }

    fn last_value(&self, item: &Item) -> Value {
        return Value::from_content(self.store, &item.content)
            .pop()
            .unwrap_or(Value::Any(Any::Undefined));
    }

    fn key_change(&self, branch: BranchId, key: &str) -> Option<EntryChange> {
        let item = self.store.branch(branch).map.get(key).and_then(|id| self.store.item(id))?;
        if self.adds(item) {
            // skip over everything this transaction wrote for the key
            let mut prev = item.left.and_then(|id| self.store.item(&id));
            while let Some(p) = prev.filter(|p| self.adds(p)) {
                prev = p.left.and_then(|id| self.store.item(&id));
            }
            if self.deletes(item) {
                let prev = prev.filter(|p| self.deletes(p))?;
                return Some(EntryChange::Removed(self.last_value(prev)));
            }
            return Some(match prev.filter(|p| self.deletes(p)) {
                Some(prev) => EntryChange::Updated(self.last_value(prev), self.last_value(item)),
                None => EntryChange::Inserted(self.last_value(item)),
            });
        }
        if self.deletes(item) {
            return Some(EntryChange::Removed(self.last_value(item)));
        }
        return None;
    }

    fn list_delta(&self, branch: BranchId) -> Vec<Delta> {
        let mut delta = Vec::new();
        let mut push = |op: Delta| match (delta.last_mut(), op) {
            (Some(Delta::Inserted(values, None)), Delta::Inserted(more, None)) => values.extend(more),
            (Some(Delta::Deleted(n)), Delta::Deleted(m)) => *n += m,
            (Some(Delta::Retain(n, None)), Delta::Retain(m, None)) => *n += m,
            (_, op) => delta.push(op),
        };
        for item in self.store.iter_items(branch) {
            if !item.is_countable() {
                continue;
            }
            match (self.adds(item), self.deletes(item)) {
                (true, false) => push(Delta::Inserted(Value::from_content(self.store, &item.content), None)),
                (false, true) => push(Delta::Deleted(item.len)),
                (false, false) if !item.is_deleted() => push(Delta::Retain(item.len, None)),
                _ => {}
            }
        }
        if matches!(delta.last(), Some(Delta::Retain(_, None))) {
            delta.pop();
        }
        return delta;
    }

    fn text_delta(&self, branch: BranchId) -> Vec<Delta> {
        let mut builder = TextDelta::default();
        for item in self.store.iter_items(branch) {
            match &item.content {
                ItemContent::String(s) => {
                    if self.adds(item) {
                        if !self.deletes(item) {
                            builder.switch(Action::Insert);
                            builder.insert_text.push_str(s.as_str());
                        }
                    } else if self.deletes(item) {
                        builder.switch(Action::Delete);
                        builder.delete += item.len;
                    } else if !item.is_deleted() {
                        builder.switch(Action::Retain);
                        builder.retain += item.len;
                    }
                }
                ItemContent::Embed(_) | ItemContent::Type(_) => {
                    if self.adds(item) {
                        if !self.deletes(item) {
                            builder.flush();
                            builder.action = Some(Action::Insert);
                            builder.insert_value = Value::from_content(self.store, &item.content).pop();
                            builder.flush();
                        }
                    } else if self.deletes(item) {
                        builder.switch(Action::Delete);
                        builder.delete += 1;
                    } else if !item.is_deleted() {
                        builder.switch(Action::Retain);
                        builder.retain += 1;
                    }
                }
                ItemContent::Format(key, value) => {
                    self.format_boundary(&mut builder, item, key, value);
                }
                _ => {}
            }
        }
        builder.flush();
        while matches!(builder.delta.last(), Some(Delta::Retain(_, None))) {
            builder.delta.pop();
        }
        return builder.delta;
    }

    fn format_boundary(&self, b: &mut TextDelta, item: &Item, key: &Arc<str>, value: &Any) {
        if self.adds(item) {
            if !self.deletes(item) {
                let current = b.current.get(key).unwrap_or(&Any::Null);
                if current != value {
                    if b.action == Some(Action::Retain) {
                        b.flush();
                    }
                    if b.old.get(key).unwrap_or(&Any::Null) == value {
                        b.attrs.remove(key);
                    } else {
                        b.attrs.insert(key.clone(), value.clone());
                    }
                }
            }
        } else if self.deletes(item) {
            b.old.insert(key.clone(), value.clone());
            let current = b.current.get(key).cloned().unwrap_or(Any::Null);
            if &current != value {
                if b.action == Some(Action::Retain) {
                    b.flush();
                }
                b.attrs.insert(key.clone(), current);
            }
        } else if !item.is_deleted() {
            b.old.insert(key.clone(), value.clone());
            if let Some(attr) = b.attrs.get(key) {
                if attr != value {
                    if b.action == Some(Action::Retain) {
                        b.flush();
                    }
                    if value.is_null() {
                        b.attrs.remove(key);
                    } else {
                        b.attrs.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        if !item.is_deleted() {
            if b.action == Some(Action::Insert) {
                b.flush();
            }
            if value.is_null() {
                b.current.remove(key);
            } else {
                b.current.insert(key.clone(), value.clone());
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Insert,
    Retain,
    Delete,
}

/// Accumulates text delta operations while walking the item chain.
#[derive(Default)]
struct TextDelta {
    delta: Vec<Delta>,
    action: Option<Action>,
    insert_text: String,
    insert_value: Option<Value>,
    retain: u32,
    delete: u32,
    /// Attributes in effect at the current position.
    current: Attrs,
    /// Attributes in effect before the transaction.
    old: Attrs,
    /// Attribute changes applying to the pending retain.
    attrs: Attrs,
}

impl TextDelta {
    fn switch(&mut self, action: Action) {
        if self.action != Some(action) {
            self.flush();
            self.action = Some(action);
        }
    }

    fn flush(&mut self) {
        let Some(action) = self.action.take() else {
            return;
        };
        let op = match action {
            Action::Delete => (self.delete > 0).then(|| Delta::Deleted(self.delete)),
            Action::Insert => {
                let value = match self.insert_value.take() {
                    Some(value) => Some(value),
                    None if !self.insert_text.is_empty() => {
                        Some(Value::Any(Any::String(Arc::from(self.insert_text.as_str()))))
                    }
                    None => None,
                };
                let attrs: Attrs = self
                    .current
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                value.map(|v| Delta::Inserted(vec![v], (!attrs.is_empty()).then(|| Box::new(attrs))))
            }
            Action::Retain => (self.retain > 0).then(|| {
                let attrs = (!self.attrs.is_empty()).then(|| Box::new(self.attrs.clone()));
                Delta::Retain(self.retain, attrs)
            }),
        };
        self.delete = 0;
        self.retain = 0;
        self.insert_text.clear();
        if let Some(op) = op {
            self.delta.push(op);
        }
    }
}
