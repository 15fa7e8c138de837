//! Detached primitive snapshots
//!
//! [`PrimitiveData`] is a plain value copy of a primitive's state with no back-references
//! and no dataset membership. It is what readers and writers outside the engine exchange
//! with it, and what [`DatasetContents::load`](crate::DatasetContents::load) applies.

use crate::primitive::{
    LatLon, Node, Primitive, PrimitiveCommon, PrimitiveFlags, PrimitiveId, PrimitiveKind,
    Relation, RelationMember, Way,
};
use crate::{MapDataError, Result, User, UserRegistry};
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Kind-specific part of a snapshot
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrimitivePayload {
    Node { coor: Option<LatLon> },
    Way { nodes: Vec<i64> },
    Relation { members: Vec<MemberData> },
}

/// A relation member inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemberData {
    pub role: String,
    pub id: i64,
    pub kind: PrimitiveKind,
}

impl From<&RelationMember> for MemberData {
    fn from(member: &RelationMember) -> Self {
        Self {
            role: member.role.clone(),
            id: member.member.id,
            kind: member.member.kind,
        }
    }
}

impl From<&MemberData> for RelationMember {
    fn from(data: &MemberData) -> Self {
        RelationMember::new(data.role.clone(), PrimitiveId::new(data.kind, data.id))
    }
}

/// Value snapshot of a primitive
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PrimitiveData {
    pub id: i64,
    pub version: u32,
    pub changeset_id: u32,
    pub timestamp: u32,
    pub user: Option<User>,
    pub visible: bool,
    pub deleted: bool,
    pub modified: bool,
    pub incomplete: bool,
    pub tags: BTreeMap<String, String>,
    pub payload: PrimitivePayload,
}

impl PrimitiveData {
    pub fn kind(&self) -> PrimitiveKind {
        match self.payload {
            PrimitivePayload::Node { .. } => PrimitiveKind::Node,
            PrimitivePayload::Way { .. } => PrimitiveKind::Way,
            PrimitivePayload::Relation { .. } => PrimitiveKind::Relation,
        }
    }

    pub fn primitive_id(&self) -> PrimitiveId {
        PrimitiveId::new(self.kind(), self.id)
    }

    /// Snapshot of a complete, visible primitive with no metadata
    pub fn new(id: i64, version: u32, payload: PrimitivePayload) -> Self {
        Self {
            id,
            version,
            changeset_id: 0,
            timestamp: 0,
            user: None,
            visible: true,
            deleted: false,
            modified: false,
            incomplete: false,
            tags: BTreeMap::new(),
            payload,
        }
    }

    pub(crate) fn flags(&self) -> PrimitiveFlags {
        let mut flags = PrimitiveFlags::empty();
        flags.set(PrimitiveFlags::VISIBLE, self.visible);
        flags.set(PrimitiveFlags::DELETED, self.deleted);
        flags.set(PrimitiveFlags::MODIFIED, self.modified);
        flags.set(PrimitiveFlags::INCOMPLETE, self.incomplete);
        flags
    }
}

impl Primitive {
    /// Snapshot of the current state
    pub fn save(&self) -> PrimitiveData {
        let payload = match self {
            Primitive::Node(n) => PrimitivePayload::Node { coor: n.coor() },
            Primitive::Way(w) => PrimitivePayload::Way {
                nodes: w.nodes().to_vec(),
            },
            Primitive::Relation(r) => PrimitivePayload::Relation {
                members: r.members().iter().map(MemberData::from).collect(),
            },
        };
        PrimitiveData {
            id: self.id(),
            version: self.version(),
            changeset_id: self.changeset_id(),
            timestamp: self.timestamp(),
            user: self.user().map(|u| u.as_ref().clone()),
            visible: self.is_visible(),
            deleted: self.is_deleted(),
            modified: self.is_modified(),
            incomplete: self.is_incomplete(),
            tags: self.tags().to_map(),
            payload,
        }
    }

    /// Build a detached primitive from a snapshot
    ///
    /// The id/version rules of the constructors apply; the snapshot's flags are then
    /// copied as they are.
    pub fn from_data(data: &PrimitiveData) -> Result<Primitive> {
        let kind = data.kind();
        let common = PrimitiveCommon::new(kind, data.id, data.version)?;
        let mut primitive = match kind {
            PrimitiveKind::Node => Primitive::Node(Node::from_common(common)),
            PrimitiveKind::Way => Primitive::Way(Way::from_common(common)),
            PrimitiveKind::Relation => Primitive::Relation(Relation::from_common(common)),
        };
        primitive.load_data(data)?;
        Ok(primitive)
    }

    /// Overwrite metadata, tags, flags and payload from a snapshot of the same kind
    ///
    /// Back-references and the bounding box are left to the dataset.
    pub(crate) fn load_data(&mut self, data: &PrimitiveData) -> Result<()> {
        if data.kind() != self.kind() {
            return Err(MapDataError::KindMismatch {
                expected: self.kind(),
                found: data.primitive_id(),
            });
        }
        if data.changeset_id > 0 && data.id <= 0 {
            return Err(MapDataError::InvalidChangesetId {
                id: data.primitive_id(),
                changeset_id: data.changeset_id,
            });
        }
        if !data.visible && data.id <= 0 {
            return Err(MapDataError::InvisibleNewPrimitive(
                data.primitive_id(),
            ));
        }

        let common = self.common_mut();
        common.set_id(data.id);
        common.set_version(data.version);
        common.set_timestamp(data.timestamp);
        common.set_user(
            data.user
                .as_ref()
                .map(|u| UserRegistry::global().intern(u)),
        );
        common.set_changeset_id(data.changeset_id)?;
        common.set_tags(data.tags.clone());
        common.set_flags(data.flags() | (common.flags() & !load_managed_flags()));

        match (self, &data.payload) {
            (Primitive::Node(n), PrimitivePayload::Node { coor }) => n.set_coor(*coor),
            (Primitive::Way(w), PrimitivePayload::Way { nodes }) => w.set_nodes(nodes.clone()),
            (Primitive::Relation(r), PrimitivePayload::Relation { members }) => {
                r.set_members(members.iter().map(RelationMember::from).collect())
            }
            _ => {}
        }
        Ok(())
    }
}

/// Flags a snapshot carries; everything else is local state
fn load_managed_flags() -> PrimitiveFlags {
    PrimitiveFlags::VISIBLE
        | PrimitiveFlags::DELETED
        | PrimitiveFlags::MODIFIED
        | PrimitiveFlags::INCOMPLETE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn way_data() -> PrimitiveData {
        let mut data = PrimitiveData::new(7, 3, PrimitivePayload::Way { nodes: vec![1, 2, 3] });
        data.changeset_id = 42;
        data.timestamp = 1_600_000_000;
        data.user = Some(User::new(5, "mapper"));
        data.modified = true;
        data.tags.insert("highway".into(), "service".into());
        data
    }

    #[test]
    fn test_from_data_restores_state() {
        let data = way_data();
        let primitive = Primitive::from_data(&data).unwrap();

        assert_eq!(primitive.primitive_id(), PrimitiveId::way(7));
        assert_eq!(primitive.version(), 3);
        assert_eq!(primitive.changeset_id(), 42);
        assert!(primitive.is_modified());
        assert!(primitive.is_tagged());
        assert_eq!(primitive.user().map(|u| u.name.as_str()), Some("mapper"));
        assert_eq!(primitive.as_way().unwrap().nodes(), &[1, 2, 3]);

        assert_eq!(primitive.save(), data);
    }

    #[test]
    fn test_from_data_local_primitive() {
        let data = PrimitiveData::new(
            -4,
            0,
            PrimitivePayload::Node {
                coor: Some(LatLon::new(1.0, 2.0)),
            },
        );
        let primitive = Primitive::from_data(&data).unwrap();
        assert!(primitive.is_new());
        assert_eq!(primitive.as_node().unwrap().coor(), Some(LatLon::new(1.0, 2.0)));
    }

    #[test]
    fn test_load_rejects_other_kind() {
        let mut node = Primitive::from(Node::with_id(7, 1).unwrap());
        assert!(matches!(
            node.load_data(&way_data()),
            Err(MapDataError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_load_rejects_invisible_new() {
        let mut data = PrimitiveData::new(-1, 0, PrimitivePayload::Node { coor: None });
        data.visible = false;
        assert!(matches!(
            Primitive::from_data(&data),
            Err(MapDataError::InvisibleNewPrimitive(_))
        ));
    }

    #[test]
    fn test_local_flags_survive_load() {
        let mut node = Primitive::from(Node::with_id(3, 1).unwrap());
        node.set_highlighted(true);
        let data = PrimitiveData::new(3, 2, PrimitivePayload::Node { coor: None });
        node.load_data(&data).unwrap();
        assert!(node.is_highlighted());
        assert_eq!(node.version(), 2);
    }
}
