//! Values read from and written into shared types.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::any::Any;
use crate::branch::{BranchId, TypeRef};
use crate::content::{ItemContent, SubdocRef};
use crate::store::Store;
use crate::transaction::ReadTxn;
use crate::types::{ArrayRef, MapRef, TextRef, XmlRef};

/// A value stored in a shared type: plain data or a handle to a nested
/// shared type.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Any(Any),
    Text(TextRef),
    Array(ArrayRef),
    Map(MapRef),
    Xml(XmlRef),
    Doc(SubdocRef),
}

impl Value {
    /// Handle for the nested type living in `branch`.
    pub(crate) fn from_branch(store: &Store, branch: BranchId) -> Value {
        match store.branch(branch).type_ref {
            TypeRef::Text => Value::Text(TextRef(branch)),
            TypeRef::Array => Value::Array(ArrayRef(branch)),
            TypeRef::Map => Value::Map(MapRef(branch)),
            TypeRef::Undefined => Value::Any(Any::Undefined),
            _ => Value::Xml(XmlRef(branch)),
        }
    }

    /// The values an item's content contributes to its parent, in order.
    pub(crate) fn from_content(store: &Store, content: &ItemContent) -> Vec<Value> {
        match content {
            ItemContent::Any(values) | ItemContent::Json(values) => {
                values.iter().cloned().map(Value::Any).collect()
            }
            ItemContent::Binary(buf) => vec![Value::Any(Any::Buffer(buf.clone()))],
            ItemContent::Embed(value) => vec![Value::Any(value.clone())],
            ItemContent::String(s) => vec![Value::Any(Any::String(Arc::from(s.as_str())))],
            ItemContent::Type(t) => match t.branch {
                Some(branch) => vec![Value::from_branch(store, branch)],
                None => vec![Value::Any(Any::Undefined)],
            },
            ItemContent::Doc(doc) => vec![Value::Doc(doc.clone())],
            ItemContent::Format(..) | ItemContent::Deleted(_) => Vec::new(),
        }
    }

    /// The `i`-th value of an item's content.
    pub(crate) fn content_at(store: &Store, content: &ItemContent, i: u32) -> Option<Value> {
        match content {
            ItemContent::Any(values) | ItemContent::Json(values) => {
                values.get(i as usize).cloned().map(Value::Any)
            }
            ItemContent::String(s) => {
                let mut copy = s.clone();
                let mut tail = copy.split_off(i);
                let _ = tail.split_off(1);
                Some(Value::Any(Any::String(Arc::from(tail.as_str()))))
            }
            _ if i == 0 => Value::from_content(store, content).into_iter().next(),
            _ => None,
        }
    }

    pub fn as_any(&self) -> Option<&Any> {
        match self {
            Value::Any(any) => Some(any),
            _ => None,
        }
    }

    /// Plain data view; nested types are converted recursively.
    pub fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        match self {
            Value::Any(any) => any.clone(),
            Value::Text(text) => Any::String(Arc::from(text.get_string(txn))),
            Value::Array(array) => array.to_json(txn),
            Value::Map(map) => map.to_json(txn),
            Value::Xml(xml) => Any::String(Arc::from(xml.get_string(txn))),
            Value::Doc(doc) => Any::String(doc.guid.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Any(any) => write!(f, "{}", any),
            Value::Text(t) => write!(f, "<text {}>", t.0 .0),
            Value::Array(a) => write!(f, "<array {}>", a.0 .0),
            Value::Map(m) => write!(f, "<map {}>", m.0 .0),
            Value::Xml(x) => write!(f, "<xml {}>", x.0 .0),
            Value::Doc(d) => write!(f, "<doc {}>", d.guid),
        }
    }
}

impl From<Any> for Value {
    fn from(value: Any) -> Self {
        return Value::Any(value);
    }
}

/// A value to insert. Nested variants create a new shared type and fill
/// it right after it is integrated.
#[derive(Clone, Debug, PartialEq)]
pub enum In {
    Any(Any),
    Text(String),
    Array(Vec<In>),
    Map(BTreeMap<String, In>),
    XmlElement(String),
    XmlText(String),
    Doc(SubdocRef),
}

impl In {
    /// The shared type this value creates, if any.
    pub(crate) fn type_ref(&self) -> Option<TypeRef> {
        match self {
            In::Text(_) => Some(TypeRef::Text),
            In::Array(_) => Some(TypeRef::Array),
            In::Map(_) => Some(TypeRef::Map),
            In::XmlElement(name) => Some(TypeRef::XmlElement(Arc::from(name.as_str()))),
            In::XmlText(_) => Some(TypeRef::XmlText),
            In::Any(_) | In::Doc(_) => None,
        }
    }
}

impl From<Any> for In {
    fn from(value: Any) -> Self {
        return In::Any(value);
    }
}

macro_rules! in_from_any {
    ($($t:ty),*) => {
        $(impl From<$t> for In {
            fn from(value: $t) -> Self {
                return In::Any(Any::from(value));
            }
        })*
    };
}

in_from_any!(bool, f64, f32, i32, u32, i64, &str, Arc<str>, Vec<u8>, &[u8], serde_json::Value);

impl From<String> for In {
    fn from(value: String) -> Self {
        return In::Any(Any::from(value));
    }
}

impl From<Vec<In>> for In {
    fn from(value: Vec<In>) -> Self {
        return In::Array(value);
    }
}

impl From<BTreeMap<String, In>> for In {
    fn from(value: BTreeMap<String, In>) -> Self {
        return In::Map(value);
    }
}

impl From<HashMap<String, In>> for In {
    fn from(value: HashMap<String, In>) -> Self {
        return In::Map(value.into_iter().collect());
    }
}

impl From<SubdocRef> for In {
    fn from(value: SubdocRef) -> Self {
        return In::Doc(value);
    }
}
