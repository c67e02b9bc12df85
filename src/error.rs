//! Errors surfaced by decoding updates and by misuse of the document API.
//!
//! Broken internal invariants (a non-contiguous struct store, a split
//! request that lands on a garbage-collected range) are not represented
//! here: they indicate a corrupted store and abort with a panic.

use std::sync::Arc;

use crate::branch::TypeRef;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in a recoverable way.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The decoder ran past the end of its buffer.
    #[error("unexpected end of buffer")]
    EndOfBuffer,

    /// A variable-length integer used more bits than its target type holds.
    #[error("variable-length integer exceeds 64 bits")]
    VarIntOverflow,

    /// A string field did not contain valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// The content tag of an item is not one this codec knows.
    #[error("unknown content reference {0}")]
    UnknownContent(u8),

    /// The type reference of a nested shared type is not known.
    #[error("unknown type reference {0}")]
    UnknownTypeRef(u8),

    /// The tag byte of an `Any` value is not known.
    #[error("unknown value tag {0}")]
    UnknownAnyTag(u8),

    /// A v2 update announced a feature flag this codec cannot read.
    #[error("unsupported update feature flag {0}")]
    UnsupportedFeature(u64),

    /// An embedded JSON payload failed to (de)serialize.
    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A root type was requested with a different type than it already has.
    #[error("root type `{name}` is a {actual:?}, requested as {expected:?}")]
    TypeMismatch {
        name: Arc<str>,
        expected: TypeRef,
        actual: TypeRef,
    },

    /// A list or text index lies past the end of the sequence.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: u32, len: u32 },
}
