//! Stitch - replicated shared documents that converge without coordination.
//!
//! A [`Doc`] holds named root types (text, arrays, maps and xml trees).
//! Every change runs inside a [`Transaction`] and produces a compact binary
//! update that any other replica can apply, in any order and any number of
//! times, to reach the same state.
//!
//! # Quick Start
//!
//! ```
//! use stitch::{Doc, StateVector};
//!
//! let mut alice = Doc::with_client_id(1);
//! let text = alice.get_or_insert_text("notes").unwrap();
//! alice.transact(|txn| text.insert(txn, 0, "Hello, World!").unwrap());
//!
//! let mut bob = Doc::with_client_id(2);
//! let update = alice.encode_state_as_update_v1(&StateVector::new());
//! bob.apply_update_v1(&update).unwrap();
//!
//! let text = bob.get_or_insert_text("notes").unwrap();
//! assert_eq!(text.get_string(&bob), "Hello, World!");
//! ```

pub mod any;
pub mod block;
pub mod branch;
pub mod content;
pub mod delete_set;
pub mod doc;
pub mod encoding;
pub mod error;
pub mod event;
mod gc;
pub mod id;
mod integrate;
pub mod lazy;
mod markers;
pub mod observer;
pub mod snapshot;
pub mod state_vector;
pub mod store;
pub mod transaction;
pub mod types;
pub mod undo;
pub mod update;
pub mod value;

pub use any::Any;
pub use delete_set::DeleteSet;
pub use doc::{Doc, Options};
pub use error::{Error, Result};
pub use event::{Attrs, Delta, EntryChange, Event, PathSegment};
pub use id::{ClientId, Clock, Id};
pub use lazy::{
    convert_update_v1_to_v2, convert_update_v2_to_v1, diff_updates_v1, diff_updates_v2,
    encode_state_vector_from_update_v1, encode_state_vector_from_update_v2, merge_updates_v1,
    merge_updates_v2,
};
pub use observer::{SubdocsEvent, SubscriptionId, UpdateEvent};
pub use snapshot::Snapshot;
pub use state_vector::StateVector;
pub use transaction::{Origin, ReadTxn, Transaction};
pub use types::{ArrayRef, MapRef, SharedRef, TextRef, XmlRef};
pub use undo::{UndoManager, UndoOptions};
pub use update::Update;
pub use value::{In, Value};
