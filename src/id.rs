//! Identifier types for blocks and the replicas that create them.
//!
//! # Identifier Hierarchy
//!
//! - `ClientId`: the replica that produced an operation
//! - `Id`: one unit of an operation, `(client, clock)`
//! - `IdRange`: a run of consecutive clocks from one client
//!
//! Within a replica ids are ordered by clock. Across replicas they are
//! incomparable: only causality (origins) and the client id tie-break
//! used during integration relate them. For that reason `Id` implements
//! equality and hashing but not `Ord`.

use std::fmt;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

/// Process-unique identifier of a replica.
///
/// Generated ids stay within 32 bits; decoded ids may use up to 53 bits
/// for compatibility with other implementations of the wire format.
pub type ClientId = u64;

/// Per-replica logical clock.
pub type Clock = u32;

/// Generate a fresh random client id.
pub fn random_client_id() -> ClientId {
    return OsRng.next_u32() as ClientId;
}

/// A globally unique identifier of a single unit of content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    /// The replica that created this unit.
    pub client: ClientId,
    /// The clock of the unit within its replica.
    pub clock: Clock,
}

impl Id {
    /// Create a new id.
    #[inline]
    pub const fn new(client: ClientId, clock: Clock) -> Id {
        return Id { client, clock };
    }

    /// The id `offset` units further along the same client.
    #[inline]
    pub const fn offset(&self, offset: Clock) -> Id {
        return Id::new(self.client, self.clock + offset);
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "<{}#{}>", self.client, self.clock);
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{}#{}", self.client, self.clock);
    }
}

/// A half-open range of clocks `[start, end)` for a single client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IdRange {
    pub start: Clock,
    pub end: Clock,
}

impl IdRange {
    /// Create a range from a start clock and a length.
    #[inline]
    pub fn new(start: Clock, len: Clock) -> IdRange {
        return IdRange {
            start,
            end: start + len,
        };
    }

    /// Number of clocks covered.
    #[inline]
    pub fn len(&self) -> Clock {
        return self.end - self.start;
    }

    /// Check if the range is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        return self.end <= self.start;
    }

    /// Check if `clock` lies inside this range.
    #[inline]
    pub fn contains(&self, clock: Clock) -> bool {
        return clock >= self.start && clock < self.end;
    }

    /// Check if two ranges overlap or touch.
    #[inline]
    pub fn touches(&self, other: &IdRange) -> bool {
        return self.start <= other.end && other.start <= self.end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_offset() {
        let id = Id::new(7, 10);
        assert_eq!(id.offset(3), Id::new(7, 13));
        assert_eq!(id.offset(0), id);
    }

    #[test]
    fn id_formatting() {
        let id = Id::new(1, 2);
        assert_eq!(format!("{}", id), "1#2");
        assert_eq!(format!("{:?}", id), "<1#2>");
    }

    #[test]
    fn range_contains_and_touches() {
        let a = IdRange::new(0, 5);
        let b = IdRange::new(5, 2);
        let c = IdRange::new(8, 1);

        assert!(a.contains(4));
        assert!(!a.contains(5));
        assert!(a.touches(&b));
        assert!(!a.touches(&c));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn random_ids_fit_in_32_bits() {
        for _ in 0..16 {
            assert!(random_client_id() <= u32::MAX as u64);
        }
    }
}
