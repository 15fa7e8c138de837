//! The node/way/relation model
//!
//! Every primitive shares a [`PrimitiveCommon`] part (identity, metadata, flags, tags and
//! back-references) and adds its kind-specific payload. Primitives refer to each other by
//! [`PrimitiveId`] only; the owning [`Dataset`](crate::Dataset) resolves those ids, which
//! is what makes cyclic relation graphs an ordinary state.

mod flags;
mod id;
mod node;
mod relation;
mod way;

pub use flags::PrimitiveFlags;
pub use id::{IdGenerator, PrimitiveId, PrimitiveKind};
pub use node::{LatLon, Node};
pub use relation::{Relation, RelationMember};
pub use way::Way;

use crate::dataset::DatasetId;
use crate::tags::TagStore;
use crate::{BBox, MapDataError, Result, User};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Ids of the primitives referring to a primitive; usually zero or one
pub type Referrers = SmallVec<[PrimitiveId; 1]>;

/// State shared by all primitive kinds
#[derive(Debug, Clone)]
pub struct PrimitiveCommon {
    kind: PrimitiveKind,
    id: i64,
    /// 0 until the server confirms a version
    version: u32,
    user: Option<Arc<User>>,
    changeset_id: u32,
    /// Seconds since the epoch, 0 if unknown
    timestamp: u32,
    flags: PrimitiveFlags,
    tags: TagStore,
    /// Primitives including this one, maintained by the dataset
    referrers: Referrers,
    dataset: Option<DatasetId>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl PrimitiveCommon {
    fn blank(kind: PrimitiveKind, id: i64, version: u32) -> Self {
        Self {
            kind,
            id,
            version,
            user: None,
            changeset_id: 0,
            timestamp: 0,
            flags: PrimitiveFlags::default(),
            tags: TagStore::new(),
            referrers: Referrers::new(),
            dataset: None,
        }
    }

    pub(crate) fn new(kind: PrimitiveKind, id: i64, version: u32) -> Result<Self> {
        if id == 0 {
            return Err(MapDataError::InvalidId(format!(
                "{kind} id 0 is not a valid id"
            )));
        }
        if version > 0 && id < 0 {
            return Err(MapDataError::InvalidVersion {
                id: PrimitiveId::new(kind, id),
                version,
            });
        }
        let mut common = Self::blank(kind, id, version);
        common.set_incomplete(id > 0 && version == 0);
        Ok(common)
    }

    pub(crate) fn new_local(kind: PrimitiveKind, ids: &IdGenerator) -> Self {
        Self::blank(kind, ids.next_id(), 0)
    }

    #[inline]
    pub fn kind(&self) -> PrimitiveKind {
        self.kind
    }

    #[inline]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[inline]
    pub fn primitive_id(&self) -> PrimitiveId {
        PrimitiveId::new(self.kind, self.id)
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    pub fn changeset_id(&self) -> u32 {
        self.changeset_id
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn is_timestamp_empty(&self) -> bool {
        self.timestamp == 0
    }

    #[inline]
    pub fn flags(&self) -> PrimitiveFlags {
        self.flags
    }

    #[inline]
    pub fn tags(&self) -> &TagStore {
        &self.tags
    }

    /// Value of a tag
    pub fn get(&self, key: &str) -> Option<String> {
        self.tags.get(key)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.tags.has_key(key)
    }

    pub fn has_keys(&self) -> bool {
        !self.tags.is_empty()
    }

    /// Ids of the primitives referring to this one, regardless of their dataset
    pub fn referrers(&self) -> &[PrimitiveId] {
        &self.referrers
    }

    /// The dataset this primitive belongs to
    pub fn dataset(&self) -> Option<DatasetId> {
        self.dataset
    }

    #[inline]
    pub fn is_new(&self) -> bool {
        self.id <= 0
    }

    #[inline]
    pub fn is_modified(&self) -> bool {
        self.flags.contains(PrimitiveFlags::MODIFIED)
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        self.flags.contains(PrimitiveFlags::VISIBLE)
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(PrimitiveFlags::DELETED)
    }

    #[inline]
    pub fn is_incomplete(&self) -> bool {
        self.flags.contains(PrimitiveFlags::INCOMPLETE)
    }

    /// Neither deleted nor incomplete
    pub fn is_usable(&self) -> bool {
        !self
            .flags
            .intersects(PrimitiveFlags::DELETED | PrimitiveFlags::INCOMPLETE)
    }

    /// Deleted on the server and not deleted locally, i.e. resurrected
    pub fn is_undeleted(&self) -> bool {
        !self
            .flags
            .intersects(PrimitiveFlags::VISIBLE | PrimitiveFlags::DELETED)
    }

    pub fn is_new_or_undeleted(&self) -> bool {
        self.is_new() || self.is_undeleted()
    }

    pub fn is_disabled(&self) -> bool {
        self.flags.contains(PrimitiveFlags::DISABLED)
    }

    pub fn is_disabled_and_hidden(&self) -> bool {
        self.flags
            .contains(PrimitiveFlags::DISABLED | PrimitiveFlags::HIDE_IF_DISABLED)
    }

    pub fn is_highlighted(&self) -> bool {
        self.flags.contains(PrimitiveFlags::HIGHLIGHTED)
    }

    pub fn is_preserved(&self) -> bool {
        self.flags.contains(PrimitiveFlags::PRESERVED)
    }

    pub fn is_tagged(&self) -> bool {
        self.flags.contains(PrimitiveFlags::TAGGED)
    }

    pub fn is_annotated(&self) -> bool {
        self.flags.contains(PrimitiveFlags::ANNOTATED)
    }

    pub fn has_direction_keys(&self) -> bool {
        self.flags.contains(PrimitiveFlags::HAS_DIRECTIONS)
    }

    pub fn reversed_direction(&self) -> bool {
        self.flags.contains(PrimitiveFlags::DIRECTION_REVERSED)
    }

    /// Give a local primitive its server id and version
    pub fn set_osm_id(&mut self, id: i64, version: u32) -> Result<()> {
        if id <= 0 {
            return Err(MapDataError::InvalidId(format!(
                "{} expects a positive id, got {id}",
                self.kind
            )));
        }
        if version == 0 {
            return Err(MapDataError::InvalidVersion {
                id: PrimitiveId::new(self.kind, id),
                version,
            });
        }
        self.id = id;
        self.version = version;
        self.set_incomplete(false);
        Ok(())
    }

    /// Reset server metadata, turning this into a new local primitive
    pub fn clear_osm_metadata(&mut self, ids: &IdGenerator) {
        self.id = ids.next_id();
        self.version = 0;
        self.user = None;
        self.changeset_id = 0;
        self.timestamp = 0;
        self.set_incomplete(false);
        self.set_deleted(false);
        self.flags.insert(PrimitiveFlags::VISIBLE);
    }

    pub fn set_user(&mut self, user: Option<Arc<User>>) {
        self.user = user;
    }

    /// Set the changeset; new primitives cannot belong to a changeset
    pub fn set_changeset_id(&mut self, changeset_id: u32) -> Result<()> {
        if self.changeset_id == changeset_id {
            return Ok(());
        }
        if changeset_id > 0 && self.is_new() {
            return Err(MapDataError::InvalidChangesetId {
                id: self.primitive_id(),
                changeset_id,
            });
        }
        self.changeset_id = changeset_id;
        Ok(())
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn set_modified(&mut self, modified: bool) {
        self.flags.set(PrimitiveFlags::MODIFIED, modified);
    }

    /// Set server-side visibility; a new primitive cannot be invisible
    pub fn set_visible(&mut self, visible: bool) -> Result<()> {
        if !visible && self.is_new() {
            return Err(MapDataError::InvisibleNewPrimitive(self.primitive_id()));
        }
        self.flags.set(PrimitiveFlags::VISIBLE, visible);
        Ok(())
    }

    /// Mark deleted or undeleted; the modified flag becomes `deleted != visible`
    pub fn set_deleted(&mut self, deleted: bool) {
        self.flags.set(PrimitiveFlags::DELETED, deleted);
        let visible = self.is_visible();
        self.set_modified(deleted ^ !visible);
    }

    pub(crate) fn set_incomplete(&mut self, incomplete: bool) {
        self.flags.set(PrimitiveFlags::INCOMPLETE, incomplete);
    }

    /// Mark as disabled by a filter; returns whether the flags changed
    pub fn set_disabled_state(&mut self, hidden: bool) -> bool {
        let old = self.flags;
        self.flags.insert(PrimitiveFlags::DISABLED);
        self.flags.set(PrimitiveFlags::HIDE_IF_DISABLED, hidden);
        old != self.flags
    }

    /// Clear the filter state; returns whether the flags changed
    pub fn unset_disabled_state(&mut self) -> bool {
        let old = self.flags;
        self.flags
            .remove(PrimitiveFlags::DISABLED | PrimitiveFlags::HIDE_IF_DISABLED);
        old != self.flags
    }

    pub fn set_disabled_type(&mut self, disabled: bool) {
        self.flags.set(PrimitiveFlags::DISABLED_TYPE, disabled);
    }

    pub fn set_hidden_type(&mut self, hidden: bool) {
        self.flags.set(PrimitiveFlags::HIDDEN_TYPE, hidden);
    }

    /// Returns whether the flag changed
    pub fn set_highlighted(&mut self, highlighted: bool) -> bool {
        let changed = self.is_highlighted() != highlighted;
        self.flags.set(PrimitiveFlags::HIGHLIGHTED, highlighted);
        changed
    }

    pub fn set_preserved(&mut self, preserved: bool) {
        self.flags.set(PrimitiveFlags::PRESERVED, preserved);
    }

    /// Set or remove (`None`) a tag; returns whether the tags changed
    pub fn put(&mut self, key: &str, value: Option<&str>) -> bool {
        let changed = self.tags.put(key, value);
        if changed {
            self.update_tag_flags();
        }
        changed
    }

    pub fn remove_tag(&mut self, key: &str) -> bool {
        self.put(key, None)
    }

    pub fn remove_all_tags(&mut self) -> bool {
        let changed = self.tags.remove_all();
        if changed {
            self.update_tag_flags();
        }
        changed
    }

    /// Replace all tags
    pub fn set_tags(&mut self, tags: BTreeMap<String, String>) {
        self.tags.set_all(tags);
        self.update_tag_flags();
    }

    /// Recompute the flags derived from tags
    fn update_tag_flags(&mut self) {
        let (has_direction, reversed) = self.tags.direction();
        self.flags
            .set(PrimitiveFlags::TAGGED, self.tags.has_interesting_tags());
        self.flags.set(
            PrimitiveFlags::ANNOTATED,
            self.tags.has_work_in_progress_tags(),
        );
        self.flags.set(PrimitiveFlags::HAS_DIRECTIONS, has_direction);
        self.flags
            .set(PrimitiveFlags::DIRECTION_REVERSED, reversed);
    }

    pub(crate) fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    pub(crate) fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Copy flags verbatim, recomputing the tag-derived ones
    pub(crate) fn set_flags(&mut self, flags: PrimitiveFlags) {
        self.flags = flags;
        self.update_tag_flags();
    }

    pub(crate) fn set_dataset(&mut self, dataset: Option<DatasetId>) {
        self.dataset = dataset;
    }

    pub(crate) fn add_referrer(&mut self, referrer: PrimitiveId) {
        if !self.referrers.contains(&referrer) {
            self.referrers.push(referrer);
        }
    }

    pub(crate) fn remove_referrer(&mut self, referrer: PrimitiveId) {
        self.referrers.retain(|r| *r != referrer);
    }

    pub(crate) fn replace_referrer(&mut self, old: PrimitiveId, new: PrimitiveId) {
        for r in self.referrers.iter_mut() {
            if *r == old {
                *r = new;
            }
        }
    }

    pub(crate) fn clear_referrers(&mut self) {
        self.referrers.clear();
    }
}

/// Any primitive
#[derive(Debug, Clone)]
pub enum Primitive {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Primitive {
    pub fn common(&self) -> &PrimitiveCommon {
        match self {
            Primitive::Node(n) => &n.common,
            Primitive::Way(w) => &w.common,
            Primitive::Relation(r) => &r.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut PrimitiveCommon {
        match self {
            Primitive::Node(n) => &mut n.common,
            Primitive::Way(w) => &mut w.common,
            Primitive::Relation(r) => &mut r.common,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Primitive::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_way(&self) -> Option<&Way> {
        match self {
            Primitive::Way(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_relation(&self) -> Option<&Relation> {
        match self {
            Primitive::Relation(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_node_mut(&mut self) -> Option<&mut Node> {
        match self {
            Primitive::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_way_mut(&mut self) -> Option<&mut Way> {
        match self {
            Primitive::Way(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_relation_mut(&mut self) -> Option<&mut Relation> {
        match self {
            Primitive::Relation(r) => Some(r),
            _ => None,
        }
    }

    /// Bounding box: the node position, or the cached box of a way or relation
    pub fn bbox(&self) -> BBox {
        match self {
            Primitive::Node(n) => n.bbox(),
            Primitive::Way(w) => w.bbox(),
            Primitive::Relation(r) => r.bbox(),
        }
    }

    /// Distinct ids this primitive refers to, in list order
    pub fn children(&self) -> Vec<PrimitiveId> {
        let mut children: Vec<PrimitiveId> = match self {
            Primitive::Node(_) => Vec::new(),
            Primitive::Way(w) => w.node_ids().collect(),
            Primitive::Relation(r) => r.members().iter().map(|m| m.member).collect(),
        };
        let mut seen = std::collections::HashSet::with_capacity(children.len());
        children.retain(|id| seen.insert(*id));
        children
    }

    /// Whether `child` appears in the node or member list
    pub fn refers_to(&self, child: PrimitiveId) -> bool {
        match self {
            Primitive::Node(_) => false,
            Primitive::Way(w) => child.kind == PrimitiveKind::Node && w.contains_node(child.id),
            Primitive::Relation(r) => r.members().iter().any(|m| m.member == child),
        }
    }

    /// A copy that belongs to no dataset and has no referrers
    pub fn detached_clone(&self) -> Primitive {
        let mut copy = self.clone();
        let common = copy.common_mut();
        common.set_dataset(None);
        common.clear_referrers();
        copy
    }
}

impl Deref for Primitive {
    type Target = PrimitiveCommon;

    fn deref(&self) -> &PrimitiveCommon {
        self.common()
    }
}

impl DerefMut for Primitive {
    fn deref_mut(&mut self) -> &mut PrimitiveCommon {
        self.common_mut()
    }
}

impl From<Node> for Primitive {
    fn from(node: Node) -> Self {
        Primitive::Node(node)
    }
}

impl From<Way> for Primitive {
    fn from(way: Way) -> Self {
        Primitive::Way(way)
    }
}

impl From<Relation> for Primitive {
    fn from(relation: Relation) -> Self {
        Primitive::Relation(relation)
    }
}
