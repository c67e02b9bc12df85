//! Xml nodes: elements, fragments, text nodes and hooks.
//!
//! All four share one handle. Elements and fragments hold an ordered list
//! of child nodes; elements and hooks also carry attributes (map slots).
//! Text nodes are rich text and can be edited through [`XmlRef::as_text`].

use std::fmt::Write as _;
use std::sync::Arc;

use crate::any::Any;
use crate::branch::{BranchId, TypePtr, TypeRef};
use crate::error::Result;
use crate::transaction::{ReadTxn, Transaction};
use crate::types::text::{Diff, TextRef};
use crate::types::{list_get, list_insert, list_remove, list_values, map_entries, map_get, map_insert, map_remove};
use crate::types::{out_of_bounds, SharedRef};
use crate::value::{In, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct XmlRef(pub(crate) BranchId);

impl SharedRef for XmlRef {
    fn branch_id(&self) -> BranchId {
        return self.0;
    }
}

impl XmlRef {
    pub fn type_ref<T: ReadTxn>(&self, txn: &T) -> TypeRef {
        return txn.store().branch(self.0).type_ref.clone();
    }

    /// Tag name of an element or hook.
    pub fn node_name<T: ReadTxn>(&self, txn: &T) -> Option<Arc<str>> {
        match self.type_ref(txn) {
            TypeRef::XmlElement(name) | TypeRef::XmlHook(name) => Some(name),
            _ => None,
        }
    }

    /// The rich text behind a text node.
    pub fn as_text<T: ReadTxn>(&self, txn: &T) -> Option<TextRef> {
        match self.type_ref(txn) {
            TypeRef::XmlText => Some(TextRef(self.0)),
            _ => None,
        }
    }

    /// The element or fragment this node is a child of.
    pub fn parent<T: ReadTxn>(&self, txn: &T) -> Option<XmlRef> {
        let store = txn.store();
        let anchor = store.branch(self.0).item.and_then(|id| store.item(&id))?;
        let TypePtr::Branch(parent) = anchor.parent else {
            return None;
        };
        return store.branch(parent).type_ref.is_xml().then_some(XmlRef(parent));
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn insert_attribute<V: Into<Any>>(&self, txn: &mut Transaction<'_>, name: &str, value: V) {
        map_insert(txn, self.0, name, In::Any(value.into()));
    }

    pub fn get_attribute<T: ReadTxn>(&self, txn: &T, name: &str) -> Option<Any> {
        match map_get(txn.store(), self.0, name)? {
            Value::Any(any) => Some(any),
            _ => None,
        }
    }

    pub fn remove_attribute(&self, txn: &mut Transaction<'_>, name: &str) -> Option<Any> {
        match map_remove(txn, self.0, name)? {
            Value::Any(any) => Some(any),
            _ => None,
        }
    }

    /// Attributes ordered by name.
    pub fn attributes<T: ReadTxn>(&self, txn: &T) -> Vec<(Arc<str>, Any)> {
        return map_entries(txn.store(), self.0)
            .into_iter()
            .filter_map(|(name, value)| Some((name, value.as_any()?.clone())))
            .collect();
    }

    // =========================================================================
    // Children
    // =========================================================================

    pub fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        return txn.store().branch(self.0).len();
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        return self.len(txn) == 0;
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<XmlRef> {
        match list_get(txn.store(), self.0, index)? {
            Value::Xml(node) => Some(node),
            _ => None,
        }
    }

    pub fn children<T: ReadTxn>(&self, txn: &T) -> Vec<XmlRef> {
        return list_values(txn.store(), self.0)
            .into_iter()
            .filter_map(|value| match value {
                Value::Xml(node) => Some(node),
                _ => None,
            })
            .collect();
    }

    /// Insert a new element `<name>` at `index` and return it.
    pub fn insert_element(&self, txn: &mut Transaction<'_>, index: u32, name: &str) -> Result<XmlRef> {
        return self.insert_node(txn, index, In::XmlElement(name.to_string()));
    }

    /// Insert a new text node holding `text` at `index` and return it.
    pub fn insert_text(&self, txn: &mut Transaction<'_>, index: u32, text: &str) -> Result<XmlRef> {
        return self.insert_node(txn, index, In::XmlText(text.to_string()));
    }

    pub fn push_element(&self, txn: &mut Transaction<'_>, name: &str) -> Result<XmlRef> {
        let len = self.len(&*txn);
        return self.insert_node(txn, len, In::XmlElement(name.to_string()));
    }

    pub fn remove_range(&self, txn: &mut Transaction<'_>, index: u32, len: u32) -> Result<()> {
        return list_remove(txn, self.0, index, len);
    }

    fn insert_node(&self, txn: &mut Transaction<'_>, index: u32, node: In) -> Result<XmlRef> {
        list_insert(txn, self.0, index, vec![node])?;
        return self.get(&*txn, index).ok_or(out_of_bounds(index, self.len(&*txn)));
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Xml markup of this node and everything below it.
    pub fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        let mut out = String::new();
        self.write_markup(txn, &mut out);
        return out;
    }

    fn write_markup<T: ReadTxn>(&self, txn: &T, out: &mut String) {
        match self.type_ref(txn) {
            TypeRef::XmlText => {
                for run in TextRef(self.0).diff(txn) {
                    write_text_run(&run, out);
                }
            }
            TypeRef::XmlElement(name) => {
                let _ = write!(out, "<{}", name);
                for (key, value) in self.attributes(txn) {
                    let _ = write!(out, " {}=\"{}\"", key, value);
                }
                out.push('>');
                for child in self.children(txn) {
                    child.write_markup(txn, out);
                }
                let _ = write!(out, "</{}>", name);
            }
            TypeRef::XmlFragment => {
                for child in self.children(txn) {
                    child.write_markup(txn, out);
                }
            }
            _ => {}
        }
    }
}

/// A formatted text run, with each attribute rendered as a wrapping tag.
fn write_text_run(run: &Diff, out: &mut String) {
    let mut tags: Vec<(&Arc<str>, &Any)> = run.attributes.iter().flat_map(|a| a.iter()).collect();
    tags.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in tags.iter() {
        let _ = write!(out, "<{}", name);
        if let Any::Map(attrs) = value {
            for (key, value) in attrs.iter() {
                let _ = write!(out, " {}=\"{}\"", key, value);
            }
        }
        out.push('>');
    }
    let _ = write!(out, "{}", run.insert);
    for (name, _) in tags.iter().rev() {
        let _ = write!(out, "</{}>", name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::any::Any;
    use crate::doc::Doc;
    use crate::event::Attrs;
    use crate::types::SharedRef;

    #[test]
    fn builds_markup() {
        let mut doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("xml").unwrap();
        doc.transact(|txn| {
            let p = root.insert_element(txn, 0, "p").unwrap();
            p.insert_attribute(txn, "class", "intro");
            let text = p.insert_text(txn, 0, "hello").unwrap();
            let rich = text.as_text(&*txn).unwrap();
            let mut bold = Attrs::new();
            bold.insert(Arc::from("b"), Any::Map(Default::default()));
            rich.format(txn, 0, 2, bold).unwrap();
            root.push_element(txn, "hr").unwrap();
        });
        assert_eq!(
            root.get_string(&doc),
            "<p class=\"intro\"><b>he</b>llo</p><hr></hr>"
        );
        let p = root.get(&doc, 0).unwrap();
        assert_eq!(p.node_name(&doc).as_deref(), Some("p"));
        assert_eq!(p.children(&doc).len(), 1);
        assert_eq!(p.children(&doc)[0].parent(&doc), Some(p));
        assert!(p.is_alive(&doc));
    }

    #[test]
    fn removing_children_and_attributes() {
        let mut doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("xml").unwrap();
        doc.transact(|txn| {
            let div = root.insert_element(txn, 0, "div").unwrap();
            div.insert_attribute(txn, "id", "a");
            root.insert_element(txn, 1, "span").unwrap();
        });
        let div = root.get(&doc, 0).unwrap();
        doc.transact(|txn| {
            assert_eq!(div.remove_attribute(txn, "id"), Some(Any::from("a")));
            root.remove_range(txn, 0, 1).unwrap();
        });
        assert_eq!(root.get_string(&doc), "<span></span>");
        assert!(!div.is_alive(&doc));
    }
}
