use std::collections::BTreeMap;
use std::sync::Arc;

use crate::any::Any;
use crate::branch::BranchId;
use crate::transaction::{ReadTxn, Transaction};
use crate::types::{map_entries, map_get, map_insert, map_remove, SharedRef};
use crate::value::{In, Value};

/// A replicated map from string keys to values and nested types.
///
/// Concurrent writes to one key resolve to the same winner everywhere:
/// the value integrated last in the slot's item chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MapRef(pub(crate) BranchId);

impl SharedRef for MapRef {
    fn branch_id(&self) -> BranchId {
        return self.0;
    }
}

impl MapRef {
    /// Number of live entries.
    pub fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        let store = txn.store();
        return store
            .branch(self.0)
            .map
            .values()
            .filter(|id| store.item(id).is_some_and(|item| !item.is_deleted()))
            .count() as u32;
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        return self.len(txn) == 0;
    }

    pub fn insert<V: Into<In>>(&self, txn: &mut Transaction<'_>, key: &str, value: V) {
        map_insert(txn, self.0, key, value.into());
    }

    /// Remove `key`, returning the value it had.
    pub fn remove(&self, txn: &mut Transaction<'_>, key: &str) -> Option<Value> {
        return map_remove(txn, self.0, key);
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, key: &str) -> Option<Value> {
        return map_get(txn.store(), self.0, key);
    }

    pub fn contains_key<T: ReadTxn>(&self, txn: &T, key: &str) -> bool {
        return self.get(txn, key).is_some();
    }

    /// Live keys in ascending order.
    pub fn keys<T: ReadTxn>(&self, txn: &T) -> Vec<Arc<str>> {
        return self.iter(txn).map(|(key, _)| key).collect();
    }

    /// Live entries in ascending key order.
    pub fn iter<T: ReadTxn>(&self, txn: &T) -> impl Iterator<Item = (Arc<str>, Value)> {
        return map_entries(txn.store(), self.0).into_iter();
    }

    pub fn clear(&self, txn: &mut Transaction<'_>) {
        for key in self.keys(&*txn) {
            map_remove(txn, self.0, &key);
        }
    }

    pub fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        let map: BTreeMap<String, Any> = self
            .iter(txn)
            .map(|(key, value)| (key.to_string(), value.to_json(txn)))
            .collect();
        return Any::Map(Arc::new(map));
    }
}
