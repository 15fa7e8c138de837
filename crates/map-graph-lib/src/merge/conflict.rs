//! Conflicts left over by a merge

use crate::{Primitive, PrimitiveId};
use std::collections::{HashMap, HashSet};

/// Differences between a target primitive and its source counterpart that need a decision
#[derive(Debug, Clone)]
pub struct Conflict {
    /// The primitive in the target dataset
    pub my: PrimitiveId,
    /// Detached copy of the source primitive
    pub their: Primitive,
    /// The target primitive was deleted and had to be undeleted because the merged data
    /// still refers to it
    pub my_deleted: bool,
}

impl Conflict {
    pub fn new(my: PrimitiveId, their: &Primitive, my_deleted: bool) -> Self {
        Self {
            my,
            their: their.detached_clone(),
            my_deleted,
        }
    }

    pub fn their_id(&self) -> PrimitiveId {
        self.their.primitive_id()
    }
}

/// Conflicts in insertion order, indexed by both sides
#[derive(Debug, Clone, Default)]
pub struct ConflictCollection {
    conflicts: Vec<Conflict>,
    by_my: HashMap<PrimitiveId, usize>,
    their: HashSet<PrimitiveId>,
}

impl ConflictCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a conflict; a second conflict for the same target primitive is ignored
    pub fn add(&mut self, conflict: Conflict) -> bool {
        if self.by_my.contains_key(&conflict.my) {
            return false;
        }
        self.by_my.insert(conflict.my, self.conflicts.len());
        self.their.insert(conflict.their_id());
        self.conflicts.push(conflict);
        true
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> + '_ {
        self.conflicts.iter()
    }

    pub fn has_conflict_for_my(&self, id: PrimitiveId) -> bool {
        self.by_my.contains_key(&id)
    }

    pub fn has_conflict_for_their(&self, id: PrimitiveId) -> bool {
        self.their.contains(&id)
    }

    pub fn get_for_my(&self, id: PrimitiveId) -> Option<&Conflict> {
        self.by_my.get(&id).map(|&i| &self.conflicts[i])
    }
}

impl<'a> IntoIterator for &'a ConflictCollection {
    type Item = &'a Conflict;
    type IntoIter = std::slice::Iter<'a, Conflict>;

    fn into_iter(self) -> Self::IntoIter {
        self.conflicts.iter()
    }
}
