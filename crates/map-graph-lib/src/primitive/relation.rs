use super::{IdGenerator, PrimitiveCommon, PrimitiveId, PrimitiveKind};
use crate::{BBox, Result};
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One entry of a relation's member list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RelationMember {
    pub role: String,
    pub member: PrimitiveId,
}

impl RelationMember {
    pub fn new(role: impl Into<String>, member: PrimitiveId) -> Self {
        Self {
            role: role.into(),
            member,
        }
    }

    pub fn has_role(&self) -> bool {
        !self.role.is_empty()
    }

    pub fn is_node(&self) -> bool {
        self.member.kind == PrimitiveKind::Node
    }

    pub fn is_way(&self) -> bool {
        self.member.kind == PrimitiveKind::Way
    }

    pub fn is_relation(&self) -> bool {
        self.member.kind == PrimitiveKind::Relation
    }
}

/// A group of primitives with roles
///
/// Members may be other relations, including the relation itself through a cycle.
#[derive(Debug, Clone)]
pub struct Relation {
    pub(crate) common: PrimitiveCommon,
    members: Vec<RelationMember>,
    bbox: BBox,
}

impl Relation {
    /// A new local relation with an id from `ids`
    pub fn new_local(ids: &IdGenerator) -> Self {
        Self::from_common(PrimitiveCommon::new_local(PrimitiveKind::Relation, ids))
    }

    /// A relation with a given id; a positive id with version 0 is incomplete
    pub fn with_id(id: i64, version: u32) -> Result<Self> {
        Ok(Self::from_common(PrimitiveCommon::new(
            PrimitiveKind::Relation,
            id,
            version,
        )?))
    }

    pub(crate) fn from_common(common: PrimitiveCommon) -> Self {
        Self {
            common,
            members: Vec::new(),
            bbox: BBox::empty(),
        }
    }

    /// Builder: set the member list, which also makes the relation complete
    pub fn with_members(mut self, members: impl IntoIterator<Item = RelationMember>) -> Self {
        self.members = members.into_iter().collect();
        self.common.set_incomplete(false);
        self
    }

    /// Builder: set a tag
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.common.put(key, Some(value));
        self
    }

    #[inline]
    pub fn members(&self) -> &[RelationMember] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, index: usize) -> Option<&RelationMember> {
        self.members.get(index)
    }

    pub fn first_member(&self) -> Option<&RelationMember> {
        self.members.first()
    }

    pub fn last_member(&self) -> Option<&RelationMember> {
        self.members.last()
    }

    /// Distinct member ids
    pub fn member_ids(&self) -> BTreeSet<PrimitiveId> {
        self.members.iter().map(|m| m.member).collect()
    }

    /// Distinct non-empty roles
    pub fn member_roles(&self) -> BTreeSet<String> {
        self.members
            .iter()
            .filter(|m| m.has_role())
            .map(|m| m.role.clone())
            .collect()
    }

    /// Members referring to `member`
    pub fn members_for(&self, member: PrimitiveId) -> Vec<&RelationMember> {
        self.members.iter().filter(|m| m.member == member).collect()
    }

    pub fn is_multipolygon(&self) -> bool {
        matches!(self.get("type").as_deref(), Some("multipolygon")) || self.is_boundary()
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self.get("type").as_deref(), Some("boundary"))
    }

    /// Replace the member list; the bounding box is stale until recomputed
    pub fn set_members(&mut self, members: Vec<RelationMember>) {
        self.members = members;
    }

    #[inline]
    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    pub(crate) fn set_bbox(&mut self, bbox: BBox) {
        self.bbox = bbox;
    }
}

impl Deref for Relation {
    type Target = PrimitiveCommon;

    fn deref(&self) -> &PrimitiveCommon {
        &self.common
    }
}

impl DerefMut for Relation {
    fn deref_mut(&mut self) -> &mut PrimitiveCommon {
        &mut self.common
    }
}
