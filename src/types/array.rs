use std::sync::Arc;

use crate::any::Any;
use crate::branch::BranchId;
use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::transaction::{ReadTxn, Transaction};
use crate::types::{list_get, list_insert, list_remove, list_values, SharedRef};
use crate::value::{In, Value};

/// A replicated list of values and nested types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArrayRef(pub(crate) BranchId);

impl SharedRef for ArrayRef {
    fn branch_id(&self) -> BranchId {
        return self.0;
    }
}

impl ArrayRef {
    pub fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        return txn.store().branch(self.0).len();
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        return self.len(txn) == 0;
    }

    pub fn insert<V: Into<In>>(&self, txn: &mut Transaction<'_>, index: u32, value: V) -> Result<()> {
        return list_insert(txn, self.0, index, vec![value.into()]);
    }

    /// Insert several values at once. Consecutive plain values share one
    /// item.
    pub fn insert_range<I>(&self, txn: &mut Transaction<'_>, index: u32, values: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<In>,
    {
        let values: Vec<In> = values.into_iter().map(Into::into).collect();
        return list_insert(txn, self.0, index, values);
    }

    pub fn push_back<V: Into<In>>(&self, txn: &mut Transaction<'_>, value: V) {
        let len = self.len(&*txn);
        let inserted = list_insert(txn, self.0, len, vec![value.into()]);
        debug_assert!(inserted.is_ok(), "appending at the current length is in bounds");
    }

    pub fn push_front<V: Into<In>>(&self, txn: &mut Transaction<'_>, value: V) {
        let inserted = list_insert(txn, self.0, 0, vec![value.into()]);
        debug_assert!(inserted.is_ok(), "index 0 is always in bounds");
    }

    pub fn remove(&self, txn: &mut Transaction<'_>, index: u32) -> Result<()> {
        return list_remove(txn, self.0, index, 1);
    }

    pub fn remove_range(&self, txn: &mut Transaction<'_>, index: u32, len: u32) -> Result<()> {
        return list_remove(txn, self.0, index, len);
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<Value> {
        return list_get(txn.store(), self.0, index);
    }

    /// Like [`ArrayRef::get`], failing for indices past the end.
    pub fn try_get<T: ReadTxn>(&self, txn: &T, index: u32) -> Result<Value> {
        return self.get(txn, index).ok_or(Error::IndexOutOfBounds {
            index,
            len: self.len(txn),
        });
    }

    pub fn to_vec<T: ReadTxn>(&self, txn: &T) -> Vec<Value> {
        return list_values(txn.store(), self.0);
    }

    pub fn iter<T: ReadTxn>(&self, txn: &T) -> impl Iterator<Item = Value> {
        return self.to_vec(txn).into_iter();
    }

    pub fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        let values: Vec<Any> = self.iter(txn).map(|v| v.to_json(txn)).collect();
        return Any::Array(Arc::from(values));
    }

    /// The content as it was when `snapshot` was taken. Needs a document
    /// without garbage collection.
    pub fn to_vec_at<T: ReadTxn>(&self, txn: &T, snapshot: &Snapshot) -> Vec<Value> {
        let store = txn.store();
        let mut out = Vec::new();
        for item in store.iter_items(self.0).filter(|item| item.is_countable()) {
            for i in 0..item.len {
                if snapshot.is_visible(&item.id.offset(i)) {
                    out.extend(Value::content_at(store, &item.content, i));
                }
            }
        }
        return out;
    }
}

#[cfg(test)]
mod tests {
    use crate::any::Any;
    use crate::doc::Doc;
    use crate::error::Error;
    use crate::value::{In, Value};

    fn numbers(values: &[Value]) -> Vec<f64> {
        return values.iter().filter_map(|v| v.as_any()?.as_f64()).collect();
    }

    #[test]
    fn insert_and_remove() {
        let mut doc = Doc::new();
        let array = doc.get_or_insert_array("list").unwrap();
        doc.transact(|txn| {
            array.insert_range(txn, 0, [1.0, 2.0, 4.0]).unwrap();
            array.insert(txn, 2, 3.0).unwrap();
            array.push_front(txn, 0.0);
            array.push_back(txn, 5.0);
        });
        assert_eq!(numbers(&array.to_vec(&doc)), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        doc.transact(|txn| array.remove_range(txn, 1, 3).unwrap());
        assert_eq!(numbers(&array.to_vec(&doc)), vec![0.0, 4.0, 5.0]);
        assert_eq!(array.len(&doc), 3);
        assert_eq!(array.get(&doc, 1), Some(Value::Any(Any::Number(4.0))));
        assert_eq!(array.get(&doc, 3), None);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let mut doc = Doc::new();
        let array = doc.get_or_insert_array("list").unwrap();
        doc.transact(|txn| {
            array.push_back(txn, true);
            let err = array.insert(txn, 5, false).unwrap_err();
            assert!(matches!(err, Error::IndexOutOfBounds { index: 5, len: 1 }));
            let err = array.remove_range(txn, 0, 2).unwrap_err();
            assert!(matches!(err, Error::IndexOutOfBounds { .. }));
        });
        assert_eq!(array.len(&doc), 1);
    }

    #[test]
    fn nested_types_are_populated() {
        let mut doc = Doc::new();
        let array = doc.get_or_insert_array("list").unwrap();
        doc.transact(|txn| {
            array.push_back(txn, In::Text("hello".into()));
            array.push_back(txn, In::Array(vec![In::from(1.0), In::from("two")]));
        });
        let Some(Value::Text(text)) = array.get(&doc, 0) else {
            panic!("expected text");
        };
        assert_eq!(text.get_string(&doc), "hello");
        let json = array.to_json(&doc).to_json();
        assert_eq!(json, serde_json::json!(["hello", [1, "two"]]));
    }

    #[test]
    fn many_single_inserts_use_markers() {
        let mut doc = Doc::new();
        let array = doc.get_or_insert_array("list").unwrap();
        for i in 0..200u32 {
            doc.transact(|txn| {
                let at = i / 2;
                array.insert(txn, at, i).unwrap();
            });
        }
        assert_eq!(array.len(&doc), 200);
        doc.transact(|txn| array.remove_range(txn, 50, 100).unwrap());
        assert_eq!(array.len(&doc), 100);
        let values = array.to_vec(&doc);
        assert_eq!(values.len(), 100);
    }
}
