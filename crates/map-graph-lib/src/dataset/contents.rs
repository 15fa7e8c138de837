//! The data guarded by a dataset's lock
//!
//! [`DatasetContents`] owns the primitives, the spatial indices and the selection. Every
//! mutation keeps three things consistent: back-references of the touched children, the
//! cached bounding boxes (and index positions) of everything whose geometry depends on the
//! change, and the queue of events delivered when the transaction closes.

use super::DatasetId;
use super::events::DatasetEvent;
use super::selection::{Selection, SelectionChangeEvent};
use crate::data::{PrimitiveData, PrimitivePayload};
use crate::identity::{HashStrategy, IdentityStore};
use crate::primitive::{
    IdGenerator, LatLon, Node, Primitive, PrimitiveId, PrimitiveKind, Relation, RelationMember,
    Way,
};
use crate::{BBox, Config, MapDataError, QuadBuckets, Result, User};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Identity of primitives inside a dataset: kind plus id
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ById;

#[inline]
fn hash_primitive_id(id: &PrimitiveId) -> u64 {
    (id.id as u64) ^ ((id.kind as u64) << 61)
}

impl HashStrategy<Primitive, Primitive> for ById {
    fn hash(&self, key: &Primitive) -> u64 {
        hash_primitive_id(&key.primitive_id())
    }

    fn equals(&self, key: &Primitive, item: &Primitive) -> bool {
        key.primitive_id() == item.primitive_id()
    }
}

impl HashStrategy<PrimitiveId, Primitive> for ById {
    fn hash(&self, key: &PrimitiveId) -> u64 {
        hash_primitive_id(key)
    }

    fn equals(&self, key: &PrimitiveId, item: &Primitive) -> bool {
        *key == item.primitive_id()
    }
}

/// Ids in first-occurrence order without repetitions
fn distinct(ids: impl IntoIterator<Item = PrimitiveId>) -> Vec<PrimitiveId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// Primitives, indices and selection of a [`Dataset`](crate::Dataset)
///
/// Obtained through [`Dataset::read`](crate::Dataset::read) for queries and through a
/// [`Transaction`](crate::Transaction) for mutations.
#[derive(Debug)]
pub struct DatasetContents {
    id: DatasetId,
    config: Config,
    ids: IdGenerator,
    primitives: IdentityStore<Primitive, ById>,
    nodes: QuadBuckets<PrimitiveId>,
    ways: QuadBuckets<PrimitiveId>,
    relations: BTreeSet<PrimitiveId>,
    selection: Selection,
    changeset_tags: BTreeMap<String, String>,
    /// API version the data was obtained from
    version: Option<String>,
    /// Number of open nested transactions
    pub(super) update_depth: usize,
    pub(super) pending_events: Vec<DatasetEvent>,
    pub(super) pending_selection: Vec<SelectionChangeEvent>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl DatasetContents {
    pub(super) fn new(id: DatasetId, config: Config, ids: IdGenerator) -> Self {
        Self {
            id,
            nodes: QuadBuckets::with_config(&config),
            ways: QuadBuckets::with_config(&config),
            config,
            ids,
            primitives: IdentityStore::with_strategy(ById),
            relations: BTreeSet::new(),
            selection: Selection::default(),
            changeset_tags: BTreeMap::new(),
            version: None,
            update_depth: 0,
            pending_events: Vec::new(),
            pending_selection: Vec::new(),
        }
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Allocator of local ids used by this dataset
    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    // ---------------------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn contains(&self, id: PrimitiveId) -> bool {
        self.primitives.foreign_key(ById).contains_key(&id)
    }

    pub fn primitive(&self, id: PrimitiveId) -> Option<&Primitive> {
        self.primitives.foreign_key(ById).get(&id)
    }

    pub fn node(&self, id: i64) -> Option<&Node> {
        self.primitive(PrimitiveId::node(id))
            .and_then(Primitive::as_node)
    }

    pub fn way(&self, id: i64) -> Option<&Way> {
        self.primitive(PrimitiveId::way(id))
            .and_then(Primitive::as_way)
    }

    pub fn relation(&self, id: i64) -> Option<&Relation> {
        self.primitive(PrimitiveId::relation(id))
            .and_then(Primitive::as_relation)
    }

    /// All primitives in storage order
    pub fn primitives(&self) -> impl Iterator<Item = &Primitive> + '_ {
        self.primitives.iter()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.primitives.iter().filter_map(Primitive::as_node)
    }

    pub fn ways(&self) -> impl Iterator<Item = &Way> + '_ {
        self.primitives.iter().filter_map(Primitive::as_way)
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> + '_ {
        self.relations.iter().filter_map(|id| self.relation(id.id))
    }

    /// Ids of one kind, ascending
    pub fn sorted_ids(&self, kind: PrimitiveKind) -> Vec<PrimitiveId> {
        let mut ids: Vec<PrimitiveId> = self
            .primitives
            .iter()
            .map(|p| p.primitive_id())
            .filter(|id| id.kind == kind)
            .collect();
        ids.sort();
        ids
    }

    /// Nodes whose position lies inside `bbox`
    pub fn search_nodes(&self, bbox: &BBox) -> Vec<&Node> {
        self.nodes
            .search(bbox)
            .into_iter()
            .filter_map(|id| self.node(id.id))
            .collect()
    }

    /// Ways whose bounding box intersects `bbox`
    pub fn search_ways(&self, bbox: &BBox) -> Vec<&Way> {
        self.ways
            .search(bbox)
            .into_iter()
            .filter_map(|id| self.way(id.id))
            .collect()
    }

    /// Relations whose bounding box intersects `bbox`
    pub fn search_relations(&self, bbox: &BBox) -> Vec<&Relation> {
        self.relations()
            .filter(|r| r.bbox().intersects(bbox))
            .collect()
    }

    pub fn filtered(&self, predicate: impl Fn(&Primitive) -> bool) -> Vec<&Primitive> {
        self.primitives.iter().filter(|p| predicate(p)).collect()
    }

    pub fn all_non_deleted(&self) -> Vec<&Primitive> {
        self.filtered(|p| !p.is_deleted())
    }

    /// Primitives that need to be uploaded
    pub fn all_modified(&self) -> Vec<&Primitive> {
        self.filtered(|p| p.is_modified() || p.is_new_or_undeleted())
    }

    pub fn is_modified(&self) -> bool {
        self.primitives.iter().any(|p| p.is_modified())
    }

    /// Referrers of `id` that belong to this dataset
    pub fn referrers(&self, id: PrimitiveId) -> Vec<&Primitive> {
        self.live_referrers(id)
            .into_iter()
            .filter_map(|r| self.primitive(r))
            .collect()
    }

    /// Ways in this dataset containing the node
    pub fn parent_ways(&self, node: i64) -> Vec<&Way> {
        self.live_referrers(PrimitiveId::node(node))
            .into_iter()
            .filter_map(|r| self.way(r.id))
            .collect()
    }

    /// Members of a relation that are incomplete or missing
    pub fn incomplete_members(&self, relation: i64) -> Vec<PrimitiveId> {
        let Some(r) = self.relation(relation) else {
            return Vec::new();
        };
        distinct(
            r.members()
                .iter()
                .map(|m| m.member)
                .filter(|m| self.primitive(*m).is_none_or(|p| p.is_incomplete())),
        )
    }

    pub fn selected(&self) -> Arc<[PrimitiveId]> {
        self.selection.snapshot()
    }

    pub fn is_selected(&self, id: PrimitiveId) -> bool {
        self.selection.contains(&id)
    }

    pub fn selected_primitives(&self) -> Vec<&Primitive> {
        self.selection
            .snapshot()
            .iter()
            .filter_map(|id| self.primitive(*id))
            .collect()
    }

    pub fn changeset_tags(&self) -> &BTreeMap<String, String> {
        &self.changeset_tags
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Union of all node positions
    pub fn data_source_bounds(&self) -> BBox {
        self.nodes().fold(BBox::empty(), |bbox, n| bbox.union(&n.bbox()))
    }

    /// Snapshots of all primitives, ordered by id
    pub fn export(&self) -> Vec<PrimitiveData> {
        #[cfg(feature = "profiling")]
        profiling::scope!("dataset::export");

        let all: Vec<&Primitive> = self.primitives.iter().collect();
        let mut data: Vec<PrimitiveData> = all.par_iter().map(|p| p.save()).collect();
        data.sort_by_key(|d| d.primitive_id());
        data
    }

    // ---------------------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------------------

    /// Add a detached primitive
    ///
    /// Way nodes and relation members must already be part of this dataset.
    pub fn add_primitive(&mut self, primitive: impl Into<Primitive>) -> Result<PrimitiveId> {
        let mut primitive = primitive.into();
        let id = primitive.primitive_id();
        if self.contains(id) {
            return Err(MapDataError::DuplicatePrimitive(id));
        }
        if primitive.dataset().is_some() {
            return Err(MapDataError::AlreadyInDataset(id));
        }
        let deleted = primitive.is_deleted();
        match &primitive {
            Primitive::Node(_) => {}
            Primitive::Way(w) => self.check_way_nodes(id, deleted, w.nodes())?,
            Primitive::Relation(r) => self.check_members(id, deleted, r.members())?,
        }

        primitive.set_dataset(Some(self.id));
        let children = primitive.children();
        self.primitives.add(primitive);
        if !deleted {
            self.link_children(id, &children);
        }
        self.index(id);

        self.queue(DatasetEvent::PrimitivesAdded {
            primitives: vec![id],
            was_incomplete: false,
        });
        Ok(id)
    }

    /// Build a primitive from a snapshot and add it
    pub fn add_primitive_data(&mut self, data: &PrimitiveData) -> Result<PrimitiveId> {
        let primitive = Primitive::from_data(data)?;
        self.add_primitive(primitive)
    }

    /// Detach a primitive and return it
    ///
    /// Back-references held by its children and references held by its parents are left
    /// untouched.
    pub fn remove_primitive(&mut self, id: PrimitiveId) -> Result<Primitive> {
        let mut primitive = self
            .primitives
            .foreign_key_mut(ById)
            .remove(&id)
            .ok_or(MapDataError::NotInDataset(id))?;
        self.unindex(&primitive);
        self.change_selection(|s| {
            s.remove(&id);
        });
        primitive.set_dataset(None);
        self.queue(DatasetEvent::PrimitivesRemoved {
            primitives: vec![id],
        });
        Ok(primitive)
    }

    /// Remove every primitive that is deleted and either new or invisible
    ///
    /// Returns whether anything was removed.
    pub fn cleanup_deleted_primitives(&mut self) -> bool {
        let snapshot = self.primitives.snapshot();
        let mut removed = false;
        for primitive in snapshot
            .iter()
            .filter(|p| p.is_deleted() && (p.is_new() || !p.is_visible()))
        {
            removed |= self.remove_primitive(primitive.primitive_id()).is_ok();
        }
        removed
    }

    // ---------------------------------------------------------------------------------
    // Geometry
    // ---------------------------------------------------------------------------------

    /// Move a node; `None` makes its position unknown
    pub fn set_coor(&mut self, node: i64, coor: Option<LatLon>) -> Result<()> {
        let id = PrimitiveId::node(node);
        self.ensure_complete(id)?;
        let n = self.node_mut(node)?;
        if n.coor() == coor {
            return Ok(());
        }
        let old = n.bbox();
        n.set_coor(coor);
        let new = n.bbox();

        self.nodes.remove(&id, &old);
        self.nodes.add(id, new);
        self.queue(DatasetEvent::NodeMoved { node: id });
        self.propagate_geometry_change(id);
        Ok(())
    }

    /// Replace the node list of a way
    pub fn set_way_nodes(&mut self, way: i64, nodes: Vec<i64>) -> Result<()> {
        let id = PrimitiveId::way(way);
        self.ensure_complete(id)?;
        let w = self.way(way).ok_or(MapDataError::NotInDataset(id))?;
        let deleted = w.is_deleted();
        let old_children = distinct(w.node_ids());
        self.check_way_nodes(id, deleted, &nodes)?;

        let new_children = distinct(nodes.iter().map(|&n| PrimitiveId::node(n)));
        self.way_mut(way)?.set_nodes(nodes);
        if !deleted {
            self.relink_children(id, &old_children, &new_children);
        }
        self.queue(DatasetEvent::WayNodesChanged { way: id });
        self.propagate_geometry_change(id);
        Ok(())
    }

    /// Append a node to a way
    pub fn add_way_node(&mut self, way: i64, node: i64) -> Result<()> {
        let len = self.way(way).map_or(0, |w| w.node_count());
        self.insert_way_node(way, len, node)
    }

    /// Insert a node at `index` of a way
    pub fn insert_way_node(&mut self, way: i64, index: usize, node: i64) -> Result<()> {
        let id = PrimitiveId::way(way);
        self.ensure_complete(id)?;
        let mut nodes = self
            .way(way)
            .ok_or(MapDataError::NotInDataset(id))?
            .nodes()
            .to_vec();
        if index > nodes.len() {
            return Err(MapDataError::IndexOutOfBounds {
                id,
                index,
                len: nodes.len(),
            });
        }
        nodes.insert(index, node);
        self.set_way_nodes(way, nodes)
    }

    /// Remove every occurrence of a node from a way; returns whether the way contained it
    pub fn remove_way_node(&mut self, way: i64, node: i64) -> Result<bool> {
        let id = PrimitiveId::way(way);
        let w = self.way(way).ok_or(MapDataError::NotInDataset(id))?;
        if !w.contains_node(node) {
            return Ok(false);
        }
        let nodes = w.nodes_without(node);
        self.set_way_nodes(way, nodes)?;
        Ok(true)
    }

    /// Replace the member list of a relation
    pub fn set_members(&mut self, relation: i64, members: Vec<RelationMember>) -> Result<()> {
        let id = PrimitiveId::relation(relation);
        self.ensure_complete(id)?;
        let r = self
            .relation(relation)
            .ok_or(MapDataError::NotInDataset(id))?;
        let deleted = r.is_deleted();
        let old_children = distinct(r.members().iter().map(|m| m.member));
        self.check_members(id, deleted, &members)?;

        let new_children = distinct(members.iter().map(|m| m.member));
        self.relation_mut(relation)?.set_members(members);
        if !deleted {
            self.relink_children(id, &old_children, &new_children);
        }
        self.queue(DatasetEvent::RelationMembersChanged { relation: id });
        self.propagate_geometry_change(id);
        Ok(())
    }

    /// Append a member to a relation
    pub fn add_member(&mut self, relation: i64, member: RelationMember) -> Result<()> {
        let id = PrimitiveId::relation(relation);
        self.ensure_complete(id)?;
        let mut members = self
            .relation(relation)
            .ok_or(MapDataError::NotInDataset(id))?
            .members()
            .to_vec();
        members.push(member);
        self.set_members(relation, members)
    }

    /// Remove the member at `index`
    pub fn remove_member(&mut self, relation: i64, index: usize) -> Result<RelationMember> {
        let id = PrimitiveId::relation(relation);
        self.ensure_complete(id)?;
        let mut members = self
            .relation(relation)
            .ok_or(MapDataError::NotInDataset(id))?
            .members()
            .to_vec();
        if index >= members.len() {
            return Err(MapDataError::IndexOutOfBounds {
                id,
                index,
                len: members.len(),
            });
        }
        let removed = members.remove(index);
        self.set_members(relation, members)?;
        Ok(removed)
    }

    /// Remove every membership of `member`; returns whether there was one
    pub fn remove_members_for(&mut self, relation: i64, member: PrimitiveId) -> Result<bool> {
        let id = PrimitiveId::relation(relation);
        let r = self
            .relation(relation)
            .ok_or(MapDataError::NotInDataset(id))?;
        if r.members_for(member).is_empty() {
            return Ok(false);
        }
        let members: Vec<RelationMember> = r
            .members()
            .iter()
            .filter(|m| m.member != member)
            .cloned()
            .collect();
        self.set_members(relation, members)?;
        Ok(true)
    }

    // ---------------------------------------------------------------------------------
    // Tags
    // ---------------------------------------------------------------------------------

    /// Set or remove (`None`) a tag; returns whether the tags changed
    pub fn put_tag(&mut self, id: PrimitiveId, key: &str, value: Option<&str>) -> Result<bool> {
        self.ensure_complete(id)?;
        let p = self.primitive_mut(id)?;
        let original = p.tags().to_map();
        let changed = p.put(key, value);
        if changed {
            self.queue(DatasetEvent::TagsChanged {
                primitive: id,
                original,
            });
        }
        Ok(changed)
    }

    pub fn remove_tag(&mut self, id: PrimitiveId, key: &str) -> Result<bool> {
        self.put_tag(id, key, None)
    }

    /// Replace all tags
    pub fn set_tags(&mut self, id: PrimitiveId, tags: BTreeMap<String, String>) -> Result<()> {
        self.ensure_complete(id)?;
        let p = self.primitive_mut(id)?;
        let original = p.tags().to_map();
        if original == tags {
            return Ok(());
        }
        p.set_tags(tags);
        self.queue(DatasetEvent::TagsChanged {
            primitive: id,
            original,
        });
        Ok(())
    }

    pub fn remove_all_tags(&mut self, id: PrimitiveId) -> Result<bool> {
        let p = self.primitive_mut(id)?;
        let original = p.tags().to_map();
        let changed = p.remove_all_tags();
        if changed {
            self.queue(DatasetEvent::TagsChanged {
                primitive: id,
                original,
            });
        }
        Ok(changed)
    }

    // ---------------------------------------------------------------------------------
    // Flags and metadata
    // ---------------------------------------------------------------------------------

    /// Delete or undelete a primitive
    ///
    /// A deleted way or relation no longer counts as a referrer of its children.
    pub fn set_deleted(&mut self, id: PrimitiveId, deleted: bool) -> Result<()> {
        let p = self.primitive(id).ok_or(MapDataError::NotInDataset(id))?;
        if p.is_deleted() == deleted {
            return Ok(());
        }
        if !deleted {
            match p {
                Primitive::Node(_) => {}
                Primitive::Way(w) => self.check_way_nodes(id, false, w.nodes())?,
                Primitive::Relation(r) => self.check_members(id, false, r.members())?,
            }
        }
        let children = p.children();

        self.primitive_mut(id)?.set_deleted(deleted);
        if deleted {
            self.unlink_children(id, &children);
        } else {
            self.link_children(id, &children);
        }
        self.queue(DatasetEvent::PrimitiveFlagsChanged { primitive: id });
        Ok(())
    }

    pub fn set_modified(&mut self, id: PrimitiveId, modified: bool) -> Result<()> {
        let p = self.primitive_mut(id)?;
        if p.is_modified() == modified {
            return Ok(());
        }
        p.set_modified(modified);
        self.queue(DatasetEvent::PrimitiveFlagsChanged { primitive: id });
        Ok(())
    }

    pub fn set_visible(&mut self, id: PrimitiveId, visible: bool) -> Result<()> {
        let p = self.primitive_mut(id)?;
        if p.is_visible() == visible {
            return Ok(());
        }
        p.set_visible(visible)?;
        self.queue(DatasetEvent::PrimitiveFlagsChanged { primitive: id });
        Ok(())
    }

    pub fn set_changeset_id(&mut self, id: PrimitiveId, changeset_id: u32) -> Result<()> {
        let p = self.primitive_mut(id)?;
        let old = p.changeset_id();
        if old == changeset_id {
            return Ok(());
        }
        p.set_changeset_id(changeset_id)?;
        self.queue(DatasetEvent::ChangesetIdChanged {
            primitive: id,
            old,
            new: changeset_id,
        });
        Ok(())
    }

    pub fn set_user(&mut self, id: PrimitiveId, user: Option<Arc<User>>) -> Result<()> {
        self.primitive_mut(id)?.set_user(user);
        Ok(())
    }

    pub fn set_timestamp(&mut self, id: PrimitiveId, timestamp: u32) -> Result<()> {
        self.primitive_mut(id)?.set_timestamp(timestamp);
        Ok(())
    }

    /// Mark as disabled by a filter; returns whether the state changed
    pub fn set_disabled_state(&mut self, id: PrimitiveId, hidden: bool) -> Result<bool> {
        let changed = self.primitive_mut(id)?.set_disabled_state(hidden);
        if changed {
            self.queue(DatasetEvent::PrimitiveFlagsChanged { primitive: id });
        }
        Ok(changed)
    }

    pub fn unset_disabled_state(&mut self, id: PrimitiveId) -> Result<bool> {
        let changed = self.primitive_mut(id)?.unset_disabled_state();
        if changed {
            self.queue(DatasetEvent::PrimitiveFlagsChanged { primitive: id });
        }
        Ok(changed)
    }

    pub fn set_highlighted(&mut self, id: PrimitiveId, highlighted: bool) -> Result<bool> {
        let changed = self.primitive_mut(id)?.set_highlighted(highlighted);
        if changed {
            self.queue(DatasetEvent::PrimitiveFlagsChanged { primitive: id });
        }
        Ok(changed)
    }

    pub fn set_preserved(&mut self, id: PrimitiveId, preserved: bool) -> Result<()> {
        let p = self.primitive_mut(id)?;
        if p.is_preserved() == preserved {
            return Ok(());
        }
        p.set_preserved(preserved);
        self.queue(DatasetEvent::PrimitiveFlagsChanged { primitive: id });
        Ok(())
    }

    /// Give a primitive its server id and version, re-keying it if the id changes
    pub fn set_osm_id(&mut self, id: PrimitiveId, new_id: i64, version: u32) -> Result<PrimitiveId> {
        self.reassign_id(id, |p| p.set_osm_id(new_id, version))
    }

    /// Turn a primitive into a new local one with a fresh id and no server metadata
    pub fn clear_osm_metadata(&mut self, id: PrimitiveId) -> Result<PrimitiveId> {
        let ids = self.ids.clone();
        self.reassign_id(id, |p| {
            p.clear_osm_metadata(&ids);
            Ok(())
        })
    }

    /// Apply a snapshot to the primitive with the same id
    ///
    /// Loading complete data into an incomplete primitive reports it as added.
    pub fn load(&mut self, data: &PrimitiveData) -> Result<()> {
        let id = data.primitive_id();
        let current = self.primitive(id).ok_or(MapDataError::NotInDataset(id))?;
        match &data.payload {
            PrimitivePayload::Node { .. } => {}
            PrimitivePayload::Way { nodes } => self.check_way_nodes(id, data.deleted, nodes)?,
            PrimitivePayload::Relation { members } => {
                let members: Vec<RelationMember> = members.iter().map(Into::into).collect();
                self.check_members(id, data.deleted, &members)?
            }
        }

        let was_incomplete = current.is_incomplete();
        let old_deleted = current.is_deleted();
        let old_children = current.children();
        let old_bbox = current.bbox();
        let old = current.save();

        let mut updated = current.clone();
        updated.load_data(data)?;
        let new_children = updated.children();

        if let Some(p) = self.primitives.find_mut(&ById, &id) {
            *p = updated;
        }
        if !old_deleted {
            self.unlink_children(id, &old_children);
        }
        if !data.deleted {
            self.link_children(id, &new_children);
        }
        if id.kind == PrimitiveKind::Node {
            let new_bbox = self.node(id.id).map(Node::bbox).unwrap_or_default();
            if new_bbox != old_bbox {
                self.nodes.remove(&id, &old_bbox);
                self.nodes.add(id, new_bbox);
            }
        }
        self.propagate_geometry_change(id);

        if was_incomplete && !data.incomplete {
            self.queue(DatasetEvent::PrimitivesAdded {
                primitives: vec![id],
                was_incomplete: true,
            });
            return Ok(());
        }
        if old.tags != data.tags {
            self.queue(DatasetEvent::TagsChanged {
                primitive: id,
                original: old.tags.clone(),
            });
        }
        if old.payload != data.payload {
            self.queue(match id.kind {
                PrimitiveKind::Node => DatasetEvent::NodeMoved { node: id },
                PrimitiveKind::Way => DatasetEvent::WayNodesChanged { way: id },
                PrimitiveKind::Relation => DatasetEvent::RelationMembersChanged { relation: id },
            });
        }
        if old.changeset_id != data.changeset_id {
            self.queue(DatasetEvent::ChangesetIdChanged {
                primitive: id,
                old: old.changeset_id,
                new: data.changeset_id,
            });
        }
        if (old.visible, old.deleted, old.modified, old.incomplete)
            != (data.visible, data.deleted, data.modified, data.incomplete)
        {
            self.queue(DatasetEvent::PrimitiveFlagsChanged { primitive: id });
        }
        Ok(())
    }

    pub fn set_version(&mut self, version: Option<String>) {
        self.version = version;
    }

    pub fn put_changeset_tag(&mut self, key: &str, value: &str) {
        self.changeset_tags
            .insert(key.to_string(), value.to_string());
    }

    // ---------------------------------------------------------------------------------
    // Unlinking
    // ---------------------------------------------------------------------------------

    /// Remove a node from every way containing it
    ///
    /// Ways are marked modified; a way left with fewer than 2 nodes is deleted instead.
    pub fn unlink_node_from_ways(&mut self, node: i64) -> Result<()> {
        let id = PrimitiveId::node(node);
        if !self.contains(id) {
            return Err(MapDataError::NotInDataset(id));
        }
        for way in self.parent_way_ids(node) {
            let Some(w) = self.way(way.id) else {
                continue;
            };
            let remaining = w.nodes_without(node);
            if remaining.len() < 2 {
                self.set_deleted(way, true)?;
            } else {
                self.set_way_nodes(way.id, remaining)?;
                self.set_modified(way, true)?;
            }
        }
        Ok(())
    }

    /// Remove every membership of `id` from the relations referring to it
    pub fn unlink_primitive_from_relations(&mut self, id: PrimitiveId) -> Result<()> {
        if !self.contains(id) {
            return Err(MapDataError::NotInDataset(id));
        }
        let relations: Vec<PrimitiveId> = self
            .live_referrers(id)
            .into_iter()
            .filter(|r| r.kind == PrimitiveKind::Relation)
            .collect();
        for relation in relations {
            if self.remove_members_for(relation.id, id)? {
                self.set_modified(relation, true)?;
            }
        }
        Ok(())
    }

    /// Remove `id` from every way and relation referring to it
    pub fn unlink_references_to_primitive(&mut self, id: PrimitiveId) -> Result<()> {
        if id.kind == PrimitiveKind::Node {
            self.unlink_node_from_ways(id.id)?;
        }
        self.unlink_primitive_from_relations(id)
    }

    // ---------------------------------------------------------------------------------
    // Selection
    // ---------------------------------------------------------------------------------

    /// Replace the selection; ids not in this dataset are ignored
    pub fn set_selected(&mut self, ids: impl IntoIterator<Item = PrimitiveId>) {
        let ids = self.known(ids);
        self.change_selection(|s| {
            s.clear();
            for id in ids {
                s.insert(id);
            }
        });
    }

    pub fn add_selected(&mut self, ids: impl IntoIterator<Item = PrimitiveId>) {
        let ids = self.known(ids);
        self.change_selection(|s| {
            for id in ids {
                s.insert(id);
            }
        });
    }

    /// Deselect the given ids
    pub fn clear_selection(&mut self, ids: impl IntoIterator<Item = PrimitiveId>) {
        let ids: Vec<PrimitiveId> = ids.into_iter().collect();
        self.change_selection(|s| {
            for id in &ids {
                s.remove(id);
            }
        });
    }

    pub fn toggle_selected(&mut self, ids: impl IntoIterator<Item = PrimitiveId>) {
        let ids = self.known(ids);
        self.change_selection(|s| {
            for id in ids {
                if !s.remove(&id) {
                    s.insert(id);
                }
            }
        });
    }

    pub fn clear_all_selection(&mut self) {
        self.change_selection(Selection::clear);
    }

    fn known(&self, ids: impl IntoIterator<Item = PrimitiveId>) -> Vec<PrimitiveId> {
        ids.into_iter().filter(|id| self.contains(*id)).collect()
    }

    fn change_selection(&mut self, apply: impl FnOnce(&mut Selection)) {
        let old = self.selection.snapshot();
        apply(&mut self.selection);
        let new = self.selection.snapshot();
        if old == new {
            return;
        }
        let old_set: HashSet<&PrimitiveId> = old.iter().collect();
        let new_set: HashSet<&PrimitiveId> = new.iter().collect();
        let added = new.iter().filter(|id| !old_set.contains(id)).copied().collect();
        let removed = old.iter().filter(|id| !new_set.contains(id)).copied().collect();
        self.pending_selection.push(SelectionChangeEvent {
            dataset: self.id,
            old,
            new,
            added,
            removed,
        });
    }

    // ---------------------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------------------

    fn queue(&mut self, event: DatasetEvent) {
        self.pending_events.push(event);
    }

    pub(crate) fn primitive_mut(&mut self, id: PrimitiveId) -> Result<&mut Primitive> {
        self.primitives
            .find_mut(&ById, &id)
            .ok_or(MapDataError::NotInDataset(id))
    }

    fn node_mut(&mut self, id: i64) -> Result<&mut Node> {
        let pid = PrimitiveId::node(id);
        self.primitive_mut(pid)?
            .as_node_mut()
            .ok_or(MapDataError::KindMismatch {
                expected: PrimitiveKind::Node,
                found: pid,
            })
    }

    fn way_mut(&mut self, id: i64) -> Result<&mut Way> {
        let pid = PrimitiveId::way(id);
        self.primitive_mut(pid)?
            .as_way_mut()
            .ok_or(MapDataError::KindMismatch {
                expected: PrimitiveKind::Way,
                found: pid,
            })
    }

    fn relation_mut(&mut self, id: i64) -> Result<&mut Relation> {
        let pid = PrimitiveId::relation(id);
        self.primitive_mut(pid)?
            .as_relation_mut()
            .ok_or(MapDataError::KindMismatch {
                expected: PrimitiveKind::Relation,
                found: pid,
            })
    }

    /// Referrers of `id` that are part of this dataset
    /// Referrers that are still live members of this dataset and still list `id`
    ///
    /// Entries left behind by `remove_primitive` may name a primitive that was later
    /// replaced by another one with the same id.
    fn live_referrers(&self, id: PrimitiveId) -> Vec<PrimitiveId> {
        self.primitive(id)
            .map(|p| {
                p.referrers()
                    .iter()
                    .copied()
                    .filter(|&r| {
                        self.primitive(r)
                            .is_some_and(|parent| !parent.is_deleted() && parent.refers_to(id))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Incomplete primitives only change through [`Self::load`]
    fn ensure_complete(&self, id: PrimitiveId) -> Result<()> {
        match self.primitive(id) {
            None => Err(MapDataError::NotInDataset(id)),
            Some(p) if p.is_incomplete() => Err(MapDataError::IncompletePrimitive(id)),
            Some(_) => Ok(()),
        }
    }

    fn parent_way_ids(&self, node: i64) -> Vec<PrimitiveId> {
        self.live_referrers(PrimitiveId::node(node))
            .into_iter()
            .filter(|r| r.kind == PrimitiveKind::Way)
            .collect()
    }

    fn check_way_nodes(&self, way: PrimitiveId, way_deleted: bool, nodes: &[i64]) -> Result<()> {
        for &node in nodes {
            let Some(n) = self.node(node) else {
                return Err(MapDataError::DataIntegrity(format!(
                    "{way} references node {node}, which is not part of the dataset"
                )));
            };
            if n.is_visible() && !n.is_incomplete() && !n.is_latlon_known() {
                return Err(MapDataError::DataIntegrity(format!(
                    "Complete node {node} with unknown coordinates in {way}"
                )));
            }
            if !way_deleted && n.is_deleted() {
                return Err(MapDataError::DataIntegrity(format!(
                    "Deleted node {node} referenced by {way}"
                )));
            }
        }
        Ok(())
    }

    fn check_members(
        &self,
        relation: PrimitiveId,
        relation_deleted: bool,
        members: &[RelationMember],
    ) -> Result<()> {
        for member in members.iter().filter(|m| m.member != relation) {
            let Some(p) = self.primitive(member.member) else {
                return Err(MapDataError::DataIntegrity(format!(
                    "{relation} references {}, which is not part of the dataset",
                    member.member
                )));
            };
            if !relation_deleted && p.is_deleted() {
                return Err(MapDataError::DataIntegrity(format!(
                    "Deleted member {} referenced by {relation}",
                    member.member
                )));
            }
        }
        Ok(())
    }

    fn link_children(&mut self, parent: PrimitiveId, children: &[PrimitiveId]) {
        for child in children {
            if let Some(c) = self.primitives.find_mut(&ById, child) {
                c.add_referrer(parent);
            }
        }
    }

    fn unlink_children(&mut self, parent: PrimitiveId, children: &[PrimitiveId]) {
        for child in children {
            if let Some(c) = self.primitives.find_mut(&ById, child) {
                c.remove_referrer(parent);
            }
        }
    }

    fn relink_children(&mut self, parent: PrimitiveId, old: &[PrimitiveId], new: &[PrimitiveId]) {
        let gone: Vec<PrimitiveId> = old.iter().filter(|c| !new.contains(c)).copied().collect();
        let added: Vec<PrimitiveId> = new.iter().filter(|c| !old.contains(c)).copied().collect();
        self.unlink_children(parent, &gone);
        self.link_children(parent, &added);
    }

    fn compute_way_bbox(&self, way: &Way) -> BBox {
        way.nodes()
            .iter()
            .filter_map(|&n| self.node(n))
            .fold(BBox::empty(), |bbox, n| bbox.union(&n.bbox()))
    }

    /// Union of every node reachable from the relation; ways contribute their cached box
    fn compute_relation_bbox(&self, relation: PrimitiveId) -> BBox {
        let mut bbox = BBox::empty();
        let mut visited = HashSet::from([relation]);
        let mut stack = vec![relation];
        while let Some(current) = stack.pop() {
            match self.primitive(current) {
                Some(Primitive::Node(n)) => bbox.add(&n.bbox()),
                Some(Primitive::Way(w)) => bbox.add(&w.bbox()),
                Some(Primitive::Relation(r)) => {
                    for member in r.members() {
                        if visited.insert(member.member) {
                            stack.push(member.member);
                        }
                    }
                }
                None => {}
            }
        }
        bbox
    }

    /// Put a freshly stored primitive into its index, computing its box
    fn index(&mut self, id: PrimitiveId) {
        match id.kind {
            PrimitiveKind::Node => {
                if let Some(n) = self.node(id.id) {
                    let bbox = n.bbox();
                    self.nodes.add(id, bbox);
                }
            }
            PrimitiveKind::Way => {
                let Some(w) = self.way(id.id) else {
                    return;
                };
                let bbox = self.compute_way_bbox(w);
                if let Ok(w) = self.way_mut(id.id) {
                    w.set_bbox(bbox);
                }
                self.ways.add(id, bbox);
            }
            PrimitiveKind::Relation => {
                let bbox = self.compute_relation_bbox(id);
                if let Ok(r) = self.relation_mut(id.id) {
                    r.set_bbox(bbox);
                }
                self.relations.insert(id);
            }
        }
    }

    fn unindex(&mut self, primitive: &Primitive) {
        let id = primitive.primitive_id();
        match primitive {
            Primitive::Node(n) => {
                self.nodes.remove(&id, &n.bbox());
            }
            Primitive::Way(w) => {
                self.ways.remove(&id, &w.bbox());
            }
            Primitive::Relation(_) => {
                self.relations.remove(&id);
            }
        }
    }

    /// Recompute the cached box of a way or relation; returns whether it changed
    fn refresh_bbox(&mut self, id: PrimitiveId) -> bool {
        match id.kind {
            PrimitiveKind::Node => false,
            PrimitiveKind::Way => {
                let Some(w) = self.way(id.id) else {
                    return false;
                };
                let old = w.bbox();
                let new = self.compute_way_bbox(w);
                if old == new {
                    return false;
                }
                self.ways.remove(&id, &old);
                self.ways.add(id, new);
                if let Ok(w) = self.way_mut(id.id) {
                    w.set_bbox(new);
                }
                true
            }
            PrimitiveKind::Relation => {
                let Some(r) = self.relation(id.id) else {
                    return false;
                };
                let old = r.bbox();
                let new = self.compute_relation_bbox(id);
                if old == new {
                    return false;
                }
                if let Ok(r) = self.relation_mut(id.id) {
                    r.set_bbox(new);
                }
                true
            }
        }
    }

    /// Refresh the boxes of everything whose geometry depends on `changed`
    ///
    /// Ways are refreshed before relations so that relations read up-to-date way boxes.
    /// Propagation stops at boxes that did not change.
    fn propagate_geometry_change(&mut self, changed: PrimitiveId) {
        let mut relations: Vec<PrimitiveId> = Vec::new();
        match changed.kind {
            PrimitiveKind::Node => {
                for parent in self.live_referrers(changed) {
                    match parent.kind {
                        PrimitiveKind::Way => {
                            if self.refresh_bbox(parent) {
                                relations.extend(self.live_referrers(parent));
                            }
                        }
                        PrimitiveKind::Relation => relations.push(parent),
                        PrimitiveKind::Node => {}
                    }
                }
            }
            PrimitiveKind::Way => {
                if self.refresh_bbox(changed) {
                    relations.extend(self.live_referrers(changed));
                }
            }
            PrimitiveKind::Relation => relations.push(changed),
        }

        let mut visited = HashSet::new();
        while let Some(relation) = relations.pop() {
            if relation.kind != PrimitiveKind::Relation || !visited.insert(relation) {
                continue;
            }
            if self.refresh_bbox(relation) {
                relations.extend(self.live_referrers(relation));
            }
        }
    }

    /// Re-key a primitive after `apply` changed its id, rewriting every reference to it
    fn reassign_id(
        &mut self,
        old: PrimitiveId,
        apply: impl FnOnce(&mut Primitive) -> Result<()>,
    ) -> Result<PrimitiveId> {
        let mut candidate = self
            .primitive(old)
            .ok_or(MapDataError::NotInDataset(old))?
            .clone();
        apply(&mut candidate)?;
        let new = candidate.primitive_id();
        if new == old {
            if let Some(p) = self.primitives.find_mut(&ById, &old) {
                *p = candidate;
            }
            return Ok(old);
        }
        if self.contains(new) {
            return Err(MapDataError::DuplicatePrimitive(new));
        }

        let rename = |id: PrimitiveId| if id == old { new } else { id };
        let referrers: Vec<PrimitiveId> = candidate.referrers().iter().copied().map(rename).collect();
        let children: Vec<PrimitiveId> = candidate.children().into_iter().map(rename).collect();

        if let Some(previous) = self.primitives.foreign_key_mut(ById).remove(&old) {
            self.unindex(&previous);
        }
        self.primitives.add(candidate);

        for parent in referrers {
            if let Ok(p) = self.primitive_mut(parent) {
                match p {
                    Primitive::Way(w) if old.kind == PrimitiveKind::Node => {
                        let nodes = w
                            .nodes()
                            .iter()
                            .map(|&n| if n == old.id { new.id } else { n })
                            .collect();
                        w.set_nodes(nodes);
                    }
                    Primitive::Relation(r) => {
                        let members = r
                            .members()
                            .iter()
                            .map(|m| RelationMember::new(m.role.clone(), rename(m.member)))
                            .collect();
                        r.set_members(members);
                    }
                    _ => {}
                }
            }
        }
        for child in children {
            if let Ok(c) = self.primitive_mut(child) {
                c.replace_referrer(old, new);
            }
        }
        self.index(new);
        self.change_selection(|s| s.replace(&old, new));

        self.queue(DatasetEvent::PrimitivesRemoved {
            primitives: vec![old],
        });
        self.queue(DatasetEvent::PrimitivesAdded {
            primitives: vec![new],
            was_incomplete: false,
        });
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::PrimitiveFlags;

    fn contents() -> DatasetContents {
        DatasetContents::new(DatasetId::next(), Config::default(), IdGenerator::default())
    }

    fn node(id: i64, lat: f64, lon: f64) -> Node {
        Node::with_id(id, 1).unwrap().with_coor(LatLon::new(lat, lon))
    }

    fn way(id: i64, nodes: &[i64]) -> Way {
        Way::with_id(id, 1).unwrap().with_nodes(nodes.iter().copied())
    }

    fn member(role: &str, id: PrimitiveId) -> RelationMember {
        RelationMember::new(role, id)
    }

    /// Nodes 1..=3 along the equator and way 10 through them
    fn line() -> DatasetContents {
        let mut ds = contents();
        ds.add_primitive(node(1, 0.0, 0.0)).unwrap();
        ds.add_primitive(node(2, 0.0, 1.0)).unwrap();
        ds.add_primitive(node(3, 0.0, 2.0)).unwrap();
        ds.add_primitive(way(10, &[1, 2, 3])).unwrap();
        ds.pending_events.clear();
        ds
    }

    #[test]
    fn test_add_and_query() {
        let ds = line();
        assert_eq!(ds.len(), 4);
        assert!(ds.contains(PrimitiveId::way(10)));
        assert_eq!(ds.node(2).and_then(|n| n.coor()), Some(LatLon::new(0.0, 1.0)));
        assert_eq!(ds.way(10).unwrap().bbox(), BBox::new(0.0, 0.0, 2.0, 0.0));
        assert_eq!(ds.node(1).unwrap().dataset(), Some(ds.id()));

        let parents: Vec<i64> = ds.parent_ways(2).iter().map(|w| w.id()).collect();
        assert_eq!(parents, vec![10]);
        assert_eq!(ds.sorted_ids(PrimitiveKind::Node).len(), 3);
    }

    #[test]
    fn test_duplicate_add_fails_without_mutation() {
        let mut ds = line();
        let before = ds.export();
        let err = ds.add_primitive(node(2, 5.0, 5.0)).unwrap_err();
        assert!(matches!(err, MapDataError::DuplicatePrimitive(id) if id == PrimitiveId::node(2)));
        assert!(!err.is_integrity_problem());
        assert_eq!(ds.export(), before);
        assert!(ds.pending_events.is_empty());
        assert_eq!(ds.search_nodes(&BBox::new(4.0, 4.0, 6.0, 6.0)).len(), 0);
    }

    #[test]
    fn test_attached_primitive_rejected() {
        let mut a = contents();
        a.add_primitive(node(1, 0.0, 0.0)).unwrap();
        let attached = a.primitive(PrimitiveId::node(1)).unwrap().clone();

        let mut b = contents();
        assert!(matches!(
            b.add_primitive(attached),
            Err(MapDataError::AlreadyInDataset(_))
        ));
    }

    #[test]
    fn test_integrity_errors() {
        let mut ds = line();

        let dangling = ds.add_primitive(way(11, &[1, 99])).unwrap_err();
        assert!(dangling.is_integrity_problem());

        let unknown = Node::with_id(4, 1).unwrap().with_tag("name", "x");
        ds.add_primitive(unknown).unwrap();
        assert!(ds.add_primitive(way(12, &[1, 4])).unwrap_err().is_integrity_problem());

        ds.set_deleted(PrimitiveId::node(3), true).unwrap();
        let err = ds.add_primitive(way(13, &[1, 3])).unwrap_err();
        assert!(err.is_integrity_problem());

        // A deleted way may reference deleted nodes
        let mut deleted_way = way(14, &[1, 3]);
        deleted_way.set_deleted(true);
        ds.add_primitive(deleted_way).unwrap();

        let relation = Relation::with_id(20, 1)
            .unwrap()
            .with_members([member("", PrimitiveId::way(99))]);
        assert!(ds.add_primitive(relation).unwrap_err().is_integrity_problem());
    }

    #[test]
    fn test_incomplete_node_without_coordinates_is_allowed() {
        let mut ds = contents();
        ds.add_primitive(Node::with_id(1, 0).unwrap()).unwrap();
        ds.add_primitive(node(2, 1.0, 1.0)).unwrap();
        ds.add_primitive(way(10, &[1, 2])).unwrap();
        assert_eq!(ds.way(10).unwrap().bbox(), BBox::from_point(1.0, 1.0));
    }

    #[test]
    fn test_remove_primitive_keeps_back_references() {
        let mut ds = line();
        ds.set_selected([PrimitiveId::way(10)]);
        let removed = ds.remove_primitive(PrimitiveId::way(10)).unwrap();
        assert_eq!(removed.dataset(), None);
        assert!(!ds.is_selected(PrimitiveId::way(10)));
        assert!(ds.search_ways(&BBox::world()).is_empty());

        // The node still lists the way, but queries only report live referrers
        let n = ds.node(2).unwrap();
        assert_eq!(n.referrers(), &[PrimitiveId::way(10)]);
        assert!(ds.referrers(PrimitiveId::node(2)).is_empty());
        assert!(matches!(
            ds.pending_events.last(),
            Some(DatasetEvent::PrimitivesRemoved { primitives }) if primitives == &[PrimitiveId::way(10)]
        ));

        assert!(matches!(
            ds.remove_primitive(PrimitiveId::way(10)),
            Err(MapDataError::NotInDataset(_))
        ));
    }

    #[test]
    fn test_move_node_updates_indices() {
        let mut ds = line();
        let relation = Relation::with_id(20, 1)
            .unwrap()
            .with_members([member("outer", PrimitiveId::way(10))]);
        ds.add_primitive(relation).unwrap();
        assert_eq!(ds.relation(20).unwrap().bbox(), BBox::new(0.0, 0.0, 2.0, 0.0));

        ds.set_coor(3, Some(LatLon::new(1.0, 3.0))).unwrap();

        let expected = BBox::new(0.0, 0.0, 3.0, 1.0);
        assert_eq!(ds.way(10).unwrap().bbox(), expected);
        assert_eq!(ds.relation(20).unwrap().bbox(), expected);
        assert_eq!(ds.search_nodes(&BBox::new(2.9, 0.9, 3.1, 1.1)).len(), 1);
        assert!(ds.search_nodes(&BBox::new(1.9, -0.1, 2.1, 0.1)).is_empty());
        assert_eq!(ds.search_ways(&BBox::new(2.9, 0.9, 3.1, 1.1)).len(), 1);
        assert_eq!(ds.search_relations(&BBox::new(2.9, 0.9, 3.1, 1.1)).len(), 1);
        assert!(ds
            .pending_events
            .contains(&DatasetEvent::NodeMoved { node: PrimitiveId::node(3) }));
    }

    #[test]
    fn test_relation_cycle_terminates() {
        let mut ds = line();
        let a = Relation::with_id(20, 1)
            .unwrap()
            .with_members([member("", PrimitiveId::node(1))]);
        ds.add_primitive(a).unwrap();
        let b = Relation::with_id(21, 1).unwrap().with_members([
            member("", PrimitiveId::relation(20)),
            member("", PrimitiveId::node(3)),
        ]);
        ds.add_primitive(b).unwrap();
        // Close the cycle 20 -> 21 -> 20
        ds.add_member(20, member("", PrimitiveId::relation(21))).unwrap();

        let both = BBox::new(0.0, 0.0, 2.0, 0.0);
        assert_eq!(ds.relation(20).unwrap().bbox(), both);
        assert_eq!(ds.relation(21).unwrap().bbox(), both);

        ds.set_coor(1, Some(LatLon::new(-1.0, -1.0))).unwrap();
        let moved = BBox::new(-1.0, -1.0, 2.0, 0.0);
        assert_eq!(ds.relation(20).unwrap().bbox(), moved);
        assert_eq!(ds.relation(21).unwrap().bbox(), moved);

        // A relation may contain itself
        ds.add_member(21, member("", PrimitiveId::relation(21))).unwrap();
        assert_eq!(ds.relation(21).unwrap().bbox(), moved);
    }

    #[test]
    fn test_way_node_operations() {
        let mut ds = line();
        ds.add_primitive(node(4, 1.0, 1.0)).unwrap();

        ds.insert_way_node(10, 1, 4).unwrap();
        assert_eq!(ds.way(10).unwrap().nodes(), &[1, 4, 2, 3]);
        assert_eq!(ds.node(4).unwrap().referrers(), &[PrimitiveId::way(10)]);
        assert_eq!(ds.way(10).unwrap().bbox(), BBox::new(0.0, 0.0, 2.0, 1.0));

        assert!(matches!(
            ds.insert_way_node(10, 9, 4),
            Err(MapDataError::IndexOutOfBounds { index: 9, len: 4, .. })
        ));

        assert!(ds.remove_way_node(10, 4).unwrap());
        assert!(!ds.remove_way_node(10, 4).unwrap());
        assert!(ds.node(4).unwrap().referrers().is_empty());
        assert_eq!(ds.way(10).unwrap().bbox(), BBox::new(0.0, 0.0, 2.0, 0.0));

        ds.add_way_node(10, 1).unwrap();
        assert!(ds.way(10).unwrap().is_closed());
        // Node 1 appears twice but refers back once
        assert_eq!(ds.node(1).unwrap().referrers(), &[PrimitiveId::way(10)]);
    }

    #[test]
    fn test_member_operations() {
        let mut ds = line();
        let relation = Relation::with_id(20, 1).unwrap().with_members([
            member("from", PrimitiveId::node(1)),
            member("via", PrimitiveId::node(2)),
            member("to", PrimitiveId::node(1)),
        ]);
        ds.add_primitive(relation).unwrap();

        let removed = ds.remove_member(20, 1).unwrap();
        assert_eq!(removed.role, "via");
        assert!(ds.node(2).unwrap().referrers().iter().all(|r| r.kind == PrimitiveKind::Way));
        assert!(matches!(
            ds.remove_member(20, 5),
            Err(MapDataError::IndexOutOfBounds { .. })
        ));

        assert!(ds.remove_members_for(20, PrimitiveId::node(1)).unwrap());
        assert_eq!(ds.relation(20).unwrap().member_count(), 0);
        assert!(ds.relation(20).unwrap().bbox().is_empty());
        assert!(!ds.remove_members_for(20, PrimitiveId::node(1)).unwrap());
    }

    #[test]
    fn test_unlink_node_shortens_way() {
        let mut ds = line();
        ds.unlink_node_from_ways(2).unwrap();
        let w = ds.way(10).unwrap();
        assert_eq!(w.nodes(), &[1, 3]);
        assert!(w.is_modified());
        assert!(!w.is_deleted());
    }

    #[test]
    fn test_unlink_node_deletes_degenerate_way() {
        let mut ds = contents();
        ds.add_primitive(node(1, 0.0, 0.0)).unwrap();
        ds.add_primitive(node(2, 0.0, 1.0)).unwrap();
        ds.add_primitive(way(10, &[1, 2])).unwrap();

        ds.unlink_node_from_ways(2).unwrap();
        let w = ds.way(10).unwrap();
        assert!(w.is_deleted());
        assert_eq!(w.nodes(), &[1, 2]);
        // Deleted ways no longer count as referrers
        assert!(ds.node(1).unwrap().referrers().is_empty());
    }

    #[test]
    fn test_unlink_references_to_primitive() {
        let mut ds = line();
        let relation = Relation::with_id(20, 1).unwrap().with_members([
            member("", PrimitiveId::node(2)),
            member("", PrimitiveId::way(10)),
        ]);
        ds.add_primitive(relation).unwrap();

        ds.unlink_references_to_primitive(PrimitiveId::node(2)).unwrap();
        assert_eq!(ds.way(10).unwrap().nodes(), &[1, 3]);
        let r = ds.relation(20).unwrap();
        assert_eq!(r.member_ids().len(), 1);
        assert!(r.is_modified());
        assert!(ds.node(2).unwrap().referrers().is_empty());
    }

    #[test]
    fn test_delete_and_undelete() {
        let mut ds = line();
        ds.set_deleted(PrimitiveId::way(10), true).unwrap();
        assert!(ds.parent_ways(1).is_empty());
        assert!(ds.pending_events.contains(&DatasetEvent::PrimitiveFlagsChanged {
            primitive: PrimitiveId::way(10)
        }));

        ds.set_deleted(PrimitiveId::node(1), true).unwrap();
        let err = ds.set_deleted(PrimitiveId::way(10), false).unwrap_err();
        assert!(err.is_integrity_problem());

        ds.set_deleted(PrimitiveId::node(1), false).unwrap();
        ds.set_deleted(PrimitiveId::way(10), false).unwrap();
        assert_eq!(ds.parent_ways(1).len(), 1);
    }

    #[test]
    fn test_tag_events_carry_original() {
        let mut ds = line();
        let id = PrimitiveId::way(10);
        assert!(ds.put_tag(id, "highway", Some("residential")).unwrap());
        assert!(!ds.put_tag(id, "highway", Some("residential")).unwrap());
        assert!(ds.put_tag(id, "highway", Some("service")).unwrap());

        let originals: Vec<_> = ds
            .pending_events
            .iter()
            .filter_map(|e| match e {
                DatasetEvent::TagsChanged { original, .. } => original.get("highway").cloned(),
                _ => None,
            })
            .collect();
        assert_eq!(originals, vec!["residential".to_string()]);
        assert!(ds.way(10).unwrap().is_tagged());

        assert!(ds.remove_all_tags(id).unwrap());
        assert!(!ds.way(10).unwrap().has_keys());
    }

    #[test]
    fn test_flags_and_metadata() {
        let mut ds = line();
        let id = PrimitiveId::node(1);

        ds.set_changeset_id(id, 42).unwrap();
        assert!(ds.pending_events.contains(&DatasetEvent::ChangesetIdChanged {
            primitive: id,
            old: 0,
            new: 42
        }));

        assert!(ds.set_disabled_state(id, true).unwrap());
        assert!(ds.node(1).unwrap().is_disabled_and_hidden());
        assert!(ds.unset_disabled_state(id).unwrap());
        assert!(ds.set_highlighted(id, true).unwrap());
        ds.set_preserved(id, true).unwrap();
        assert!(ds.node(1).unwrap().flags().contains(PrimitiveFlags::PRESERVED));

        ds.set_modified(id, true).unwrap();
        assert!(ds.is_modified());
        assert_eq!(ds.all_modified().len(), 1);

        ds.set_timestamp(id, 1_700_000_000).unwrap();
        assert_eq!(ds.node(1).unwrap().timestamp(), 1_700_000_000);

        let local = ds.add_primitive(Node::new_local(ds.id_generator())).unwrap();
        assert!(matches!(
            ds.set_visible(local, false),
            Err(MapDataError::InvisibleNewPrimitive(_))
        ));
    }

    #[test]
    fn test_set_osm_id_rewrites_references() {
        let mut ds = contents();
        let a = ds
            .add_primitive(Node::new_local(ds.id_generator()).with_coor(LatLon::new(0.0, 0.0)))
            .unwrap();
        ds.add_primitive(node(2, 1.0, 1.0)).unwrap();
        let w = ds
            .add_primitive(Way::new_local(ds.id_generator()).with_nodes([a.id, 2]))
            .unwrap();
        ds.set_selected([a]);

        let new = ds.set_osm_id(a, 100, 1).unwrap();
        assert_eq!(new, PrimitiveId::node(100));
        assert!(!ds.contains(a));
        assert_eq!(ds.way(w.id).unwrap().nodes(), &[100, 2]);
        assert_eq!(ds.node(100).unwrap().referrers(), &[w]);
        assert!(ds.is_selected(new));
        assert_eq!(ds.search_nodes(&BBox::from_point(0.0, 0.0)).len(), 1);
        assert_eq!(ds.search_nodes(&BBox::from_point(0.0, 0.0))[0].id(), 100);

        let local = ds.clear_osm_metadata(new).unwrap();
        assert!(local.is_new());
        assert_eq!(ds.way(w.id).unwrap().nodes(), &[local.id, 2]);
        assert_eq!(ds.node(local.id).unwrap().version(), 0);
    }

    #[test]
    fn test_cleanup_deleted_primitives() {
        let mut ds = line();
        let local = ds
            .add_primitive(Node::new_local(ds.id_generator()).with_coor(LatLon::new(5.0, 5.0)))
            .unwrap();
        assert!(!ds.cleanup_deleted_primitives());

        ds.set_deleted(local, true).unwrap();
        ds.set_deleted(PrimitiveId::way(10), true).unwrap();
        ds.set_visible(PrimitiveId::way(10), false).unwrap();
        ds.set_deleted(PrimitiveId::node(3), true).unwrap();

        assert!(ds.cleanup_deleted_primitives());
        assert!(!ds.contains(local));
        assert!(!ds.contains(PrimitiveId::way(10)));
        // Deleted but visible server data stays until uploaded
        assert!(ds.contains(PrimitiveId::node(3)));
    }

    #[test]
    fn test_load_completes_incomplete_way() {
        let mut ds = contents();
        ds.add_primitive(node(1, 0.0, 0.0)).unwrap();
        ds.add_primitive(node(2, 1.0, 1.0)).unwrap();
        ds.add_primitive(Way::with_id(10, 0).unwrap()).unwrap();
        assert!(ds.way(10).unwrap().is_incomplete());
        ds.pending_events.clear();

        let data = PrimitiveData::new(10, 3, PrimitivePayload::Way { nodes: vec![1, 2] });
        ds.load(&data).unwrap();

        let w = ds.way(10).unwrap();
        assert!(!w.is_incomplete());
        assert_eq!(w.version(), 3);
        assert_eq!(w.bbox(), BBox::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(ds.parent_ways(1).len(), 1);
        assert_eq!(ds.search_ways(&BBox::from_point(1.0, 1.0)).len(), 1);
        assert_eq!(
            ds.pending_events,
            vec![DatasetEvent::PrimitivesAdded {
                primitives: vec![PrimitiveId::way(10)],
                was_incomplete: true
            }]
        );

        let mut moved = ds.primitive(PrimitiveId::node(2)).unwrap().save();
        moved.payload = PrimitivePayload::Node {
            coor: Some(LatLon::new(2.0, 2.0)),
        };
        ds.load(&moved).unwrap();
        assert_eq!(ds.way(10).unwrap().bbox(), BBox::new(0.0, 0.0, 2.0, 2.0));
        assert!(matches!(ds.pending_events.last(), Some(DatasetEvent::NodeMoved { .. })));
    }

    #[test]
    fn test_selection_operations() {
        let mut ds = line();
        ds.set_selected([PrimitiveId::node(1), PrimitiveId::node(42)]);
        assert_eq!(&*ds.selected(), &[PrimitiveId::node(1)]);

        ds.toggle_selected([PrimitiveId::node(1), PrimitiveId::node(2)]);
        assert_eq!(&*ds.selected(), &[PrimitiveId::node(2)]);

        ds.add_selected([PrimitiveId::way(10)]);
        assert_eq!(ds.selected_primitives().len(), 2);

        ds.clear_selection([PrimitiveId::node(2)]);
        assert_eq!(&*ds.selected(), &[PrimitiveId::way(10)]);

        ds.clear_all_selection();
        assert!(ds.selected().is_empty());
        // No change, no event
        ds.clear_all_selection();
        assert_eq!(ds.pending_selection.len(), 5);
        let toggled = &ds.pending_selection[1];
        assert_eq!(toggled.added, vec![PrimitiveId::node(2)]);
        assert_eq!(toggled.removed, vec![PrimitiveId::node(1)]);
    }

    #[test]
    fn test_export_sorted_and_bounds() {
        let ds = line();
        let ids: Vec<PrimitiveId> = ds.export().iter().map(|d| d.primitive_id()).collect();
        assert_eq!(
            ids,
            vec![
                PrimitiveId::node(1),
                PrimitiveId::node(2),
                PrimitiveId::node(3),
                PrimitiveId::way(10)
            ]
        );
        assert_eq!(ds.data_source_bounds(), BBox::new(0.0, 0.0, 2.0, 0.0));
    }

    #[test]
    fn test_incomplete_members() {
        let mut ds = line();
        ds.add_primitive(Way::with_id(11, 0).unwrap()).unwrap();
        let relation = Relation::with_id(20, 1).unwrap().with_members([
            member("", PrimitiveId::way(10)),
            member("", PrimitiveId::way(11)),
        ]);
        ds.add_primitive(relation).unwrap();
        assert_eq!(ds.incomplete_members(20), vec![PrimitiveId::way(11)]);
    }

    #[test]
    fn test_incomplete_primitives_reject_edits() {
        let mut ds = contents();
        ds.add_primitive(node(1, 0.0, 0.0)).unwrap();
        ds.add_primitive(node(2, 1.0, 1.0)).unwrap();
        ds.add_primitive(Node::with_id(5, 0).unwrap()).unwrap();
        ds.add_primitive(Way::with_id(10, 0).unwrap()).unwrap();
        ds.add_primitive(Relation::with_id(20, 0).unwrap()).unwrap();
        ds.pending_events.clear();

        let incomplete = |result: Result<()>, expected: PrimitiveId| {
            let err = result.unwrap_err();
            assert!(!err.is_integrity_problem());
            assert!(matches!(err, MapDataError::IncompletePrimitive(id) if id == expected));
        };
        let (n, w, r) = (
            PrimitiveId::node(5),
            PrimitiveId::way(10),
            PrimitiveId::relation(20),
        );

        incomplete(ds.add_way_node(10, 1), w);
        incomplete(ds.insert_way_node(10, 0, 1), w);
        incomplete(ds.set_way_nodes(10, vec![1, 2]), w);
        incomplete(ds.set_coor(5, Some(LatLon::new(3.0, 3.0))), n);
        incomplete(ds.put_tag(n, "name", Some("x")).map(|_| ()), n);
        incomplete(
            ds.set_tags(w, BTreeMap::from([("highway".into(), "path".into())])),
            w,
        );
        incomplete(ds.add_member(20, member("", PrimitiveId::node(1))), r);
        incomplete(ds.set_members(20, vec![member("", PrimitiveId::node(2))]), r);
        incomplete(ds.remove_member(20, 0).map(|_| ()), r);

        assert!(ds.way(10).unwrap().is_incomplete());
        assert!(ds.way(10).unwrap().nodes().is_empty());
        assert!(ds.parent_ways(1).is_empty());
        assert_eq!(ds.node(5).unwrap().coor(), None);
        assert!(ds.primitive(n).unwrap().tags().is_empty());
        assert!(ds.relation(20).unwrap().members().is_empty());
        assert!(ds.pending_events.is_empty());

        // Completion goes through load; edits work afterwards
        ds.load(&PrimitiveData::new(10, 2, PrimitivePayload::Way { nodes: vec![1] }))
            .unwrap();
        ds.add_way_node(10, 2).unwrap();
        assert_eq!(ds.way(10).unwrap().nodes(), &[1, 2]);
    }

    #[test]
    fn test_reused_id_does_not_revive_stale_referrer() {
        let mut ds = line();
        ds.remove_primitive(PrimitiveId::way(10)).unwrap();
        ds.add_primitive(way(10, &[1, 3])).unwrap();

        // Node 2 still carries the entry of the removed way 10
        assert_eq!(ds.node(2).unwrap().referrers(), &[PrimitiveId::way(10)]);
        assert!(ds.referrers(PrimitiveId::node(2)).is_empty());
        assert!(ds.parent_ways(2).is_empty());
        assert_eq!(ds.parent_ways(1).len(), 1);
        assert_eq!(ds.node(1).unwrap().referrers(), &[PrimitiveId::way(10)]);

        ds.unlink_node_from_ways(2).unwrap();
        let w = ds.way(10).unwrap();
        assert_eq!(w.nodes(), &[1, 3]);
        assert!(!w.is_modified());
        assert!(!w.is_deleted());
    }
}
