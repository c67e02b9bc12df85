//! The document: a store of shared types plus its subscriptions.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rand_core::{OsRng, RngCore};

use crate::any::Any;
use crate::block::Item;
use crate::branch::TypeRef;
use crate::content::{ItemContent, SubdocRef};
use crate::error::Result;
use crate::id::{random_client_id, ClientId};
use crate::observer::{DocObservers, SubdocsEvent, SubscriptionId, UpdateEvent};
use crate::snapshot::Snapshot;
use crate::state_vector::StateVector;
use crate::store::Store;
use crate::transaction::{Origin, Transaction};
use crate::types::{ArrayRef, MapRef, TextRef, XmlRef};
use crate::update::Update;

/// Decides whether a deleted item may be garbage collected.
pub type GcFilter = Arc<dyn Fn(&Item) -> bool + Send + Sync>;

/// Document configuration, fixed at construction.
#[derive(Clone)]
pub struct Options {
    pub client_id: ClientId,
    pub guid: Arc<str>,
    pub collection_id: Option<Arc<str>>,
    /// Reclaim the content of deleted items after each transaction.
    pub gc: bool,
    pub gc_filter: Option<GcFilter>,
    /// Load this document as soon as it is embedded in a parent.
    pub auto_load: bool,
    pub should_load: bool,
    pub meta: Option<Any>,
}

impl Default for Options {
    fn default() -> Self {
        return Options {
            client_id: random_client_id(),
            guid: random_guid(),
            collection_id: None,
            gc: true,
            gc_filter: None,
            auto_load: false,
            should_load: true,
            meta: None,
        };
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("Options")
            .field("client_id", &self.client_id)
            .field("guid", &self.guid)
            .field("collection_id", &self.collection_id)
            .field("gc", &self.gc)
            .field("gc_filter", &self.gc_filter.is_some())
            .field("auto_load", &self.auto_load)
            .field("should_load", &self.should_load)
            .field("meta", &self.meta)
            .finish();
    }
}

fn random_guid() -> Arc<str> {
    let (hi, lo) = (OsRng.next_u64(), OsRng.next_u64());
    return Arc::from(format!("{:016x}{:016x}", hi, lo));
}

pub struct Doc {
    pub(crate) store: Store,
    pub(crate) options: Options,
    pub(crate) observers: DocObservers,
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("Doc")
            .field("client_id", &self.store.client_id)
            .field("guid", &self.options.guid)
            .finish();
    }
}

impl Default for Doc {
    fn default() -> Self {
        return Doc::new();
    }
}

impl Doc {
    pub fn new() -> Doc {
        return Doc::with_options(Options::default());
    }

    pub fn with_client_id(client_id: ClientId) -> Doc {
        return Doc::with_options(Options {
            client_id,
            ..Options::default()
        });
    }

    pub fn with_options(options: Options) -> Doc {
        return Doc {
            store: Store::new(options.client_id),
            options,
            observers: DocObservers::default(),
        };
    }

    /// Current client id. May differ from the configured one after a
    /// collision was detected.
    pub fn client_id(&self) -> ClientId {
        return self.store.client_id;
    }

    pub fn guid(&self) -> &Arc<str> {
        return &self.options.guid;
    }

    pub fn options(&self) -> &Options {
        return &self.options;
    }

    // =========================================================================
    // Root types
    // =========================================================================

    pub fn get_or_insert_text(&mut self, name: &str) -> Result<TextRef> {
        return self.store.get_or_create_root(name, TypeRef::Text).map(TextRef);
    }

    pub fn get_or_insert_array(&mut self, name: &str) -> Result<ArrayRef> {
        return self.store.get_or_create_root(name, TypeRef::Array).map(ArrayRef);
    }

    pub fn get_or_insert_map(&mut self, name: &str) -> Result<MapRef> {
        return self.store.get_or_create_root(name, TypeRef::Map).map(MapRef);
    }

    pub fn get_or_insert_xml_fragment(&mut self, name: &str) -> Result<XmlRef> {
        return self.store.get_or_create_root(name, TypeRef::XmlFragment).map(XmlRef);
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Run `f` in a local transaction and commit it. A panic inside `f`
    /// still commits what was written before it, then resumes unwinding.
    pub fn transact<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Transaction<'_>) -> R,
    {
        return self.run(None, true, f);
    }

    /// Like [`Doc::transact`], tagging the transaction with `origin`.
    pub fn transact_with<R, F, O>(&mut self, origin: O, f: F) -> R
    where
        F: FnOnce(&mut Transaction<'_>) -> R,
        O: Into<Origin>,
    {
        return self.run(Some(origin.into()), true, f);
    }

    fn run<R, F>(&mut self, origin: Option<Origin>, local: bool, f: F) -> R
    where
        F: FnOnce(&mut Transaction<'_>) -> R,
    {
        let mut txn = Transaction::new(self, origin, local);
        txn.run_before_hooks();
        let result = catch_unwind(AssertUnwindSafe(|| f(&mut txn)));
        txn.commit();
        match result {
            Ok(value) => value,
            Err(panic) => resume_unwind(panic),
        }
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Integrate a remote update in its own transaction.
    pub fn apply_update(&mut self, update: Update) {
        self.run(None, false, |txn| txn.apply_update(update));
    }

    pub fn apply_update_with<O: Into<Origin>>(&mut self, update: Update, origin: O) {
        self.run(Some(origin.into()), false, |txn| txn.apply_update(update));
    }

    pub fn apply_update_v1(&mut self, update: &[u8]) -> Result<()> {
        self.apply_update(Update::decode_v1(update)?);
        return Ok(());
    }

    pub fn apply_update_v2(&mut self, update: &[u8]) -> Result<()> {
        self.apply_update(Update::decode_v2(update)?);
        return Ok(());
    }

    pub fn state_vector(&self) -> StateVector {
        return self.store.state_vector();
    }

    pub fn encode_state_vector_v1(&self) -> Vec<u8> {
        return self.store.state_vector().encode_v1();
    }

    /// Everything a peer at `sv` is missing, including buffered updates
    /// this document could not integrate yet.
    pub fn diff_update(&self, sv: &StateVector) -> Update {
        let mut parts = vec![self.store.diff(sv)];
        if let Some(ds) = &self.store.pending_ds {
            parts.push(Update::from_delete_set(ds.clone()));
        }
        if let Some(pending) = &self.store.pending {
            parts.push(pending.update.diff(sv));
        }
        if parts.len() == 1 {
            return parts.remove(0);
        }
        return Update::merge(parts);
    }

    pub fn encode_state_as_update_v1(&self, sv: &StateVector) -> Vec<u8> {
        return self.diff_update(sv).encode_v1();
    }

    pub fn encode_state_as_update_v2(&self, sv: &StateVector) -> Vec<u8> {
        return self.diff_update(sv).encode_v2();
    }

    /// Whether updates are buffered waiting for missing dependencies.
    pub fn has_pending(&self) -> bool {
        return self.store.pending.is_some() || self.store.pending_ds.is_some();
    }

    pub fn snapshot(&self) -> Snapshot {
        return Snapshot::new(self.store.state_vector(), self.store.delete_set());
    }

    // =========================================================================
    // Sub-documents
    // =========================================================================

    /// Reference for embedding this document in another one.
    pub fn as_subdoc(&self) -> SubdocRef {
        let mut opts = BTreeMap::new();
        if !self.options.gc {
            opts.insert("gc".to_string(), Any::Bool(false));
        }
        if self.options.auto_load {
            opts.insert("autoLoad".to_string(), Any::Bool(true));
        }
        if let Some(meta) = &self.options.meta {
            opts.insert("meta".to_string(), meta.clone());
        }
        return SubdocRef {
            guid: self.options.guid.clone(),
            opts: Any::Map(Arc::new(opts)),
        };
    }

    /// An empty document for the embedded reference `subdoc`.
    pub fn from_subdoc(subdoc: &SubdocRef) -> Doc {
        let flag = |name: &str| match &subdoc.opts {
            Any::Map(map) => map.get(name).cloned(),
            _ => None,
        };
        return Doc::with_options(Options {
            guid: subdoc.guid.clone(),
            gc: !matches!(flag("gc"), Some(Any::Bool(false))),
            auto_load: matches!(flag("autoLoad"), Some(Any::Bool(true))),
            should_load: subdoc.should_load(),
            meta: flag("meta"),
            ..Options::default()
        });
    }

    /// Live sub-documents embedded anywhere in this document.
    pub fn subdocs(&self) -> Vec<SubdocRef> {
        let mut out = Vec::new();
        for blocks in self.store.blocks.values() {
            for block in blocks.iter() {
                if let Some(item) = block.as_item() {
                    if let (false, ItemContent::Doc(doc)) = (item.is_deleted(), &item.content) {
                        out.push(doc.clone());
                    }
                }
            }
        }
        out.sort_by(|a, b| a.guid.cmp(&b.guid));
        return out;
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub fn observe_update_v1<F>(&mut self, f: F) -> SubscriptionId
    where
        F: FnMut(&UpdateEvent) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.update_v1.push(id, Box::new(f));
        return id;
    }

    pub fn observe_update_v2<F>(&mut self, f: F) -> SubscriptionId
    where
        F: FnMut(&UpdateEvent) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.update_v2.push(id, Box::new(f));
        return id;
    }

    pub fn observe_before_transaction<F>(&mut self, f: F) -> SubscriptionId
    where
        F: FnMut(&mut Transaction<'_>) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.before_transaction.push(id, Box::new(f));
        return id;
    }

    /// Called with the committing transaction after type observers ran and
    /// before garbage collection.
    pub fn observe_after_transaction<F>(&mut self, f: F) -> SubscriptionId
    where
        F: FnMut(&mut Transaction<'_>) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.after_transaction.push(id, Box::new(f));
        return id;
    }

    /// Called once the transaction and every follow-up caused by
    /// observers are committed.
    pub fn observe_after_all_transactions<F>(&mut self, f: F) -> SubscriptionId
    where
        F: FnMut(&Doc) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.after_all_transactions.push(id, Box::new(f));
        return id;
    }

    pub fn observe_subdocs<F>(&mut self, f: F) -> SubscriptionId
    where
        F: FnMut(&SubdocsEvent) + 'static,
    {
        let id = self.observers.next_id();
        self.observers.subdocs.push(id, Box::new(f));
        return id;
    }

    /// Drop a subscription made through any `observe*` method.
    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        return self.observers.remove(id);
    }
}
