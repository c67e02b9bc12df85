//! Callback registries for document and type subscriptions.

use std::panic::{catch_unwind, AssertUnwindSafe};

use rustc_hash::FxHashMap;
use tracing::error;

use crate::branch::BranchId;
use crate::content::SubdocRef;
use crate::doc::Doc;
use crate::event::Event;
use crate::transaction::{Origin, Transaction};

/// Handle returned by every `observe*` call, accepted by
/// [`Doc::unobserve`](crate::Doc::unobserve).
pub type SubscriptionId = u32;

pub type UpdateCallback = dyn FnMut(&UpdateEvent);
pub type TransactionCallback = dyn FnMut(&mut Transaction<'_>);
pub type DocCallback = dyn FnMut(&Doc);
pub type SubdocsCallback = dyn FnMut(&SubdocsEvent);
pub type EventCallback = dyn FnMut(&mut Transaction<'_>, &Event);
pub type DeepEventCallback = dyn FnMut(&mut Transaction<'_>, &[Event]);

/// An encoded update produced by a committed transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateEvent {
    pub update: Vec<u8>,
    pub origin: Option<Origin>,
}

/// Sub-documents attached, detached or marked for loading by a
/// transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubdocsEvent {
    pub added: Vec<SubdocRef>,
    pub removed: Vec<SubdocRef>,
    pub loaded: Vec<SubdocRef>,
}

impl SubdocsEvent {
    pub fn is_empty(&self) -> bool {
        return self.added.is_empty() && self.removed.is_empty() && self.loaded.is_empty();
    }
}

/// Ordered list of callbacks of one kind.
pub struct Handlers<F: ?Sized> {
    list: Vec<(SubscriptionId, Box<F>)>,
}

impl<F: ?Sized> Default for Handlers<F> {
    fn default() -> Self {
        return Handlers { list: Vec::new() };
    }
}

impl<F: ?Sized> Handlers<F> {
    pub fn push(&mut self, id: SubscriptionId, callback: Box<F>) {
        self.list.push((id, callback));
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.list.len();
        self.list.retain(|(sid, _)| *sid != id);
        return self.list.len() != before;
    }

    pub fn is_empty(&self) -> bool {
        return self.list.is_empty();
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<F>> {
        return self.list.iter_mut().map(|(_, f)| f);
    }

    /// Put back handlers that were taken out for dispatch, keeping any
    /// registered in the meantime behind them.
    pub fn restore(&mut self, mut taken: Handlers<F>) {
        taken.list.append(&mut self.list);
        self.list = taken.list;
    }
}

#[derive(Default)]
pub struct DocObservers {
    next_id: SubscriptionId,
    pub(crate) update_v1: Handlers<UpdateCallback>,
    pub(crate) update_v2: Handlers<UpdateCallback>,
    pub(crate) before_transaction: Handlers<TransactionCallback>,
    pub(crate) after_transaction: Handlers<TransactionCallback>,
    pub(crate) after_all_transactions: Handlers<DocCallback>,
    pub(crate) subdocs: Handlers<SubdocsCallback>,
    pub(crate) types: FxHashMap<BranchId, Handlers<EventCallback>>,
    pub(crate) deep: FxHashMap<BranchId, Handlers<DeepEventCallback>>,
}

impl DocObservers {
    pub(crate) fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        return self.next_id;
    }

    /// Drop a subscription of any kind.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let mut removed = self.update_v1.remove(id)
            | self.update_v2.remove(id)
            | self.before_transaction.remove(id)
            | self.after_transaction.remove(id)
            | self.after_all_transactions.remove(id)
            | self.subdocs.remove(id);
        for handlers in self.types.values_mut() {
            removed |= handlers.remove(id);
        }
        for handlers in self.deep.values_mut() {
            removed |= handlers.remove(id);
        }
        return removed;
    }
}

/// Run one callback, logging instead of propagating a panic.
pub(crate) fn guarded<F: FnOnce()>(kind: &'static str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(kind, %message, "observer panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_keeps_registration_order() {
        let mut handlers: Handlers<dyn FnMut() -> u32> = Handlers::default();
        handlers.push(1, Box::new(|| 1));
        let taken = std::mem::take(&mut handlers);
        handlers.push(2, Box::new(|| 2));
        handlers.restore(taken);
        let order: Vec<u32> = handlers.iter_mut().map(|f| f()).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn guarded_swallows_panics() {
        let mut ran = false;
        guarded("test", || panic!("boom"));
        guarded("test", || ran = true);
        assert!(ran);
    }
}
