//! Primitive identifiers and local id allocation

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Kind of a primitive; orders nodes before ways before relations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrimitiveKind {
    Node,
    Way,
    Relation,
}

impl PrimitiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveKind::Node => "node",
            PrimitiveKind::Way => "way",
            PrimitiveKind::Relation => "relation",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a primitive: its kind plus its numeric id
///
/// Positive ids are known to the remote server, non-positive ids are local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PrimitiveId {
    pub kind: PrimitiveKind,
    pub id: i64,
}

impl PrimitiveId {
    pub const fn new(kind: PrimitiveKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub const fn node(id: i64) -> Self {
        Self::new(PrimitiveKind::Node, id)
    }

    pub const fn way(id: i64) -> Self {
        Self::new(PrimitiveKind::Way, id)
    }

    pub const fn relation(id: i64) -> Self {
        Self::new(PrimitiveKind::Relation, id)
    }

    /// Whether the id was allocated locally and is unknown to the server
    #[inline]
    pub fn is_new(&self) -> bool {
        self.id <= 0
    }
}

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Allocator of local (negative) ids
///
/// Each [`Dataset`](crate::Dataset) owns one; cloning shares the underlying counter, so
/// datasets created from the same generator never hand out the same local id.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    /// Last id handed out; 0 before the first allocation
    last: Arc<AtomicI64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next local id (-1, -2, ...)
    pub fn next_id(&self) -> i64 {
        self.last.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// The most recently allocated id, 0 if none
    pub fn current(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Make sure later allocations are strictly below `id`
    pub fn advance_past(&self, id: i64) {
        self.last.fetch_min(id, Ordering::SeqCst);
    }

    /// Whether both generators share the same counter
    pub fn shares_counter_with(&self, other: &IdGenerator) -> bool {
        Arc::ptr_eq(&self.last, &other.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_id_ordering() {
        let mut ids = vec![
            PrimitiveId::relation(1),
            PrimitiveId::node(5),
            PrimitiveId::way(-1),
            PrimitiveId::node(-3),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                PrimitiveId::node(-3),
                PrimitiveId::node(5),
                PrimitiveId::way(-1),
                PrimitiveId::relation(1),
            ]
        );
    }

    #[test]
    fn test_primitive_id_display() {
        assert_eq!(PrimitiveId::way(42).to_string(), "way 42");
        assert!(PrimitiveId::node(0).is_new());
        assert!(!PrimitiveId::node(1).is_new());
    }

    #[test]
    fn test_id_generator_decrements() {
        let ids = IdGenerator::new();
        assert_eq!(ids.current(), 0);
        assert_eq!(ids.next_id(), -1);
        assert_eq!(ids.next_id(), -2);
        assert_eq!(ids.current(), -2);
    }

    #[test]
    fn test_id_generator_shared_and_advanced() {
        let a = IdGenerator::new();
        let b = a.clone();
        assert!(a.shares_counter_with(&b));
        assert_eq!(a.next_id(), -1);
        assert_eq!(b.next_id(), -2);

        a.advance_past(-10);
        assert_eq!(b.next_id(), -11);
        // Never moves backwards
        a.advance_past(-5);
        assert_eq!(a.next_id(), -12);
    }
}
