//! Merging one dataset into another
//!
//! [`DatasetMerger`] copies the primitives of a source dataset into a target dataset.
//! Primitives with a server id are matched by id and reconciled with a fixed decision table;
//! locally created primitives are matched by their semantic attributes or added with a
//! fresh local id. Whatever cannot be reconciled automatically ends up in a
//! [`ConflictCollection`] rather than failing the merge.
//!
//! Merging happens in two passes. The first pass decides, primitive by primitive, what the
//! target keeps; way node lists and relation member lists are then rewritten in a second
//! pass, once every referenced primitive has a counterpart in the target.

mod conflict;

pub use conflict::{Conflict, ConflictCollection};

use crate::data::{PrimitiveData, PrimitivePayload};
use crate::{
    Dataset, DatasetContents, MapDataError, Primitive, PrimitiveId, PrimitiveKind,
    RelationMember, Result, Transaction,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

const KINDS: [PrimitiveKind; 3] = [
    PrimitiveKind::Node,
    PrimitiveKind::Way,
    PrimitiveKind::Relation,
];

/// Something the merge noticed but resolved on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeWarning {
    /// The target holds a newer version; the source version was discarded
    OutdatedSource {
        id: PrimitiveId,
        target_version: u32,
        source_version: u32,
    },
    /// The target primitive is invisible on the server while the source claims otherwise
    InconsistentVisibility { id: PrimitiveId },
}

/// Result of a merge
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub conflicts: ConflictCollection,
    /// Source id to the id of its counterpart in the target
    pub merged_map: HashMap<PrimitiveId, PrimitiveId>,
    pub warnings: Vec<MergeWarning>,
}

/// Merges a source dataset into a target dataset
///
/// The source is read under its read lock; the target is modified inside a single
/// transaction, so its listeners see the whole merge at once.
#[derive(Debug)]
pub struct DatasetMerger<'a> {
    target: &'a Dataset,
    source: &'a Dataset,
}

impl<'a> DatasetMerger<'a> {
    pub fn new(target: &'a Dataset, source: &'a Dataset) -> Self {
        Self { target, source }
    }

    /// Run the merge
    ///
    /// Fails with [`MapDataError::SelfMerge`] when both sides are the same dataset, with
    /// [`MapDataError::ReadOnly`] when the target is locked and with an integrity error
    /// when the source refers to primitives it does not contain. Changes made before an
    /// integrity error are kept.
    pub fn merge(self) -> Result<MergeOutcome> {
        #[cfg(feature = "profiling")]
        profiling::scope!("DatasetMerger::merge");

        if std::ptr::eq(self.target, self.source) || self.target.id() == self.source.id() {
            return Err(MapDataError::SelfMerge);
        }
        let source = self.source.read();
        debug!(
            "Merging {} primitives of {} into {}",
            source.len(),
            self.source.id(),
            self.target.id()
        );

        let mut state = MergeState::new(self.target.begin_update()?, &source);
        for kind in KINDS {
            state.merge_kind(kind)?;
        }
        state.fix_references()?;
        state.unlink_deleted()?;
        if state.tx.version().is_none() {
            state.tx.set_version(source.version().map(str::to_owned));
        }
        let outcome = state.finish();

        if self.source.is_locked() {
            self.target.lock();
        }
        debug!(
            "Merged {} primitives into {}: {} conflicts, {} warnings",
            outcome.merged_map.len(),
            self.target.id(),
            outcome.conflicts.len(),
            outcome.warnings.len()
        );
        Ok(outcome)
    }
}

/// What happens to a target primitive that shares its server id with a source primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Keep,
    Adopt,
    AdoptTechnical,
    Conflict,
}

struct MergeState<'t, 's> {
    tx: Transaction<'t>,
    source: &'s DatasetContents,
    epsilon: f64,
    merged_map: HashMap<PrimitiveId, PrimitiveId>,
    /// Source ways and relations whose lists are copied in the second pass
    children_to_fix: HashSet<PrimitiveId>,
    /// Local target primitives already matched by a source primitive
    matched_new: HashSet<PrimitiveId>,
    /// Target primitives that became deleted by copying source state
    deleted_targets: Vec<PrimitiveId>,
    conflicts: ConflictCollection,
    warnings: Vec<MergeWarning>,
}

impl<'t, 's> MergeState<'t, 's> {
    fn new(tx: Transaction<'t>, source: &'s DatasetContents) -> Self {
        // Keep ids of cloned local primitives clear of the source's local ids
        if let Some(min) = source.primitives().map(|p| p.id()).filter(|&id| id < 0).min() {
            tx.id_generator().advance_past(min);
        }
        Self {
            epsilon: tx.config().coordinate_epsilon,
            tx,
            source,
            merged_map: HashMap::new(),
            children_to_fix: HashSet::new(),
            matched_new: HashSet::new(),
            deleted_targets: Vec::new(),
            conflicts: ConflictCollection::new(),
            warnings: Vec::new(),
        }
    }

    fn finish(self) -> MergeOutcome {
        let MergeState {
            tx,
            merged_map,
            conflicts,
            warnings,
            ..
        } = self;
        tx.commit();
        MergeOutcome {
            conflicts,
            merged_map,
            warnings,
        }
    }

    fn merge_kind(&mut self, kind: PrimitiveKind) -> Result<()> {
        let candidates: Vec<PrimitiveId> = self
            .tx
            .sorted_ids(kind)
            .into_iter()
            .filter(|id| id.is_new())
            .collect();
        let source = self.source;
        for id in source.sorted_ids(kind) {
            let Some(s) = source.primitive(id) else {
                continue;
            };
            if s.is_new() {
                self.merge_new(s, &candidates)?;
            } else {
                self.merge_by_id(s)?;
            }
        }
        Ok(())
    }

    fn merge_new(&mut self, s: &Primitive, candidates: &[PrimitiveId]) -> Result<()> {
        // Deleted before it was ever uploaded
        if s.is_deleted() {
            return Ok(());
        }
        let matched = candidates
            .iter()
            .copied()
            .filter(|c| !self.matched_new.contains(c))
            .find(|c| {
                self.tx
                    .primitive(*c)
                    .is_some_and(|t| self.semantically_equal(t, s))
            });

        let Some(target) = matched else {
            let id = self.tx.id_generator().next_id();
            self.clone_into_target(s, id)?;
            return Ok(());
        };
        self.matched_new.insert(target);
        self.merged_map.insert(s.primitive_id(), target);

        let target_deleted = self.tx.primitive(target).is_some_and(|t| t.is_deleted());
        if target_deleted != s.is_deleted() {
            self.conflicts.add(Conflict::new(target, s, false));
            return Ok(());
        }
        self.tx.set_visible(target, s.is_visible())?;
        self.tx.set_user(target, s.user().cloned())?;
        self.tx.set_timestamp(target, s.timestamp())?;
        self.tx.set_modified(target, s.is_modified())?;
        if s.kind() != PrimitiveKind::Node {
            self.children_to_fix.insert(s.primitive_id());
        }
        Ok(())
    }

    fn merge_by_id(&mut self, s: &Primitive) -> Result<()> {
        let id = s.primitive_id();
        let Some(t) = self.tx.primitive(id) else {
            self.clone_into_target(s, id.id)?;
            return Ok(());
        };
        self.merged_map.insert(id, id);

        let (decision, warning) = self.decide(t, s);
        if let Some(warning) = warning {
            self.warnings.push(warning);
        }
        match decision {
            Decision::Keep => Ok(()),
            Decision::Conflict => {
                self.conflicts.add(Conflict::new(id, s, false));
                Ok(())
            }
            Decision::Adopt => self.adopt(id, s),
            Decision::AdoptTechnical => self.adopt_technical(id, s),
        }
    }

    /// First matching rule wins
    fn decide(&self, t: &Primitive, s: &Primitive) -> (Decision, Option<MergeWarning>) {
        let id = s.primitive_id();
        let (tv, sv) = (t.version(), s.version());
        if tv > sv {
            warn!("Discarding {id} version {sv}: the target already has version {tv}");
            let warning = MergeWarning::OutdatedSource {
                id,
                target_version: tv,
                source_version: sv,
            };
            return (Decision::Keep, Some(warning));
        }
        if !t.is_visible() && s.is_visible() {
            warn!("Keeping {id} invisible although the merged data shows it as visible");
            return (
                Decision::Keep,
                Some(MergeWarning::InconsistentVisibility { id }),
            );
        }
        let decision = if t.is_visible() && !s.is_visible() {
            Decision::Conflict
        } else if t.is_incomplete() && !s.is_incomplete() {
            Decision::Adopt
        } else if t.is_incomplete() || s.is_incomplete() {
            Decision::Keep
        } else if t.is_deleted() && !s.is_deleted() && tv == sv {
            Decision::Keep
        } else if t.is_deleted() != s.is_deleted() {
            Decision::Conflict
        } else {
            match (t.is_modified(), s.is_modified()) {
                (false, true) => Decision::Adopt,
                (false, false) if tv == sv => Decision::Keep,
                (false, false) => Decision::Adopt,
                (true, false) if tv == sv => Decision::Keep,
                _ if !self.semantically_equal(t, s) => Decision::Conflict,
                _ => Decision::AdoptTechnical,
            }
        };
        (decision, None)
    }

    /// Whether `t` and `s` have the same interesting tags and geometry, comparing lists
    /// through the merge map
    fn semantically_equal(&self, t: &Primitive, s: &Primitive) -> bool {
        if !t.tags().interesting_equals(s.tags()) {
            return false;
        }
        match (t, s) {
            (Primitive::Node(t), Primitive::Node(s)) => match (t.coor(), s.coor()) {
                (Some(a), Some(b)) => a.equals_epsilon(&b, self.epsilon),
                (None, None) => true,
                _ => false,
            },
            (Primitive::Way(t), Primitive::Way(s)) => {
                t.node_count() == s.node_count()
                    && s.nodes().iter().zip(t.nodes()).all(|(&sn, &tn)| {
                        self.merged_map.get(&PrimitiveId::node(sn)) == Some(&PrimitiveId::node(tn))
                    })
            }
            (Primitive::Relation(t), Primitive::Relation(s)) => {
                t.member_count() == s.member_count()
                    && s.members().iter().zip(t.members()).all(|(sm, tm)| {
                        sm.role == tm.role && self.merged_map.get(&sm.member) == Some(&tm.member)
                    })
            }
            _ => false,
        }
    }

    /// Source state with the given id; lists are filled in by the second pass
    fn source_data(s: &Primitive, id: i64) -> PrimitiveData {
        let mut data = s.save();
        data.id = id;
        match &mut data.payload {
            PrimitivePayload::Node { .. } => {}
            PrimitivePayload::Way { nodes } => nodes.clear(),
            PrimitivePayload::Relation { members } => members.clear(),
        }
        data
    }

    fn clone_into_target(&mut self, s: &Primitive, id: i64) -> Result<PrimitiveId> {
        let target = self.tx.add_primitive_data(&Self::source_data(s, id))?;
        self.merged_map.insert(s.primitive_id(), target);
        self.copied(target, s);
        Ok(target)
    }

    /// Overwrite the target with the source state
    ///
    /// Way and relation lists keep the live part of their target state until the second
    /// pass rewrites them.
    fn adopt(&mut self, target: PrimitiveId, s: &Primitive) -> Result<()> {
        let mut data = Self::source_data(s, target.id);
        if let Some(t) = self.tx.primitive(target) {
            let live = |id: PrimitiveId| self.tx.primitive(id).is_some_and(|p| !p.is_deleted());
            match (&mut data.payload, t.save().payload) {
                (PrimitivePayload::Way { nodes }, PrimitivePayload::Way { nodes: current }) => {
                    *nodes = current
                        .into_iter()
                        .filter(|&n| live(PrimitiveId::node(n)))
                        .collect();
                }
                (
                    PrimitivePayload::Relation { members },
                    PrimitivePayload::Relation { members: current },
                ) => {
                    *members = current
                        .into_iter()
                        .filter(|m| live(PrimitiveId::new(m.kind, m.id)))
                        .collect();
                }
                _ => {}
            }
        }
        self.tx.load(&data)?;
        self.copied(target, s);
        Ok(())
    }

    /// Take version, changeset, user, timestamp and visibility from the source while
    /// keeping the target's (equal) content and its modified state
    fn adopt_technical(&mut self, target: PrimitiveId, s: &Primitive) -> Result<()> {
        let t = self
            .tx
            .primitive(target)
            .ok_or(MapDataError::NotInDataset(target))?;
        let mut data = t.save();
        data.version = s.version();
        data.changeset_id = s.changeset_id();
        data.timestamp = s.timestamp();
        data.user = s.user().map(|u| u.as_ref().clone());
        data.visible = s.is_visible();
        data.modified = true;
        self.tx.load(&data)
    }

    fn copied(&mut self, target: PrimitiveId, s: &Primitive) {
        if s.kind() != PrimitiveKind::Node {
            self.children_to_fix.insert(s.primitive_id());
        }
        if s.is_deleted() {
            self.deleted_targets.push(target);
        }
    }

    /// Second pass: copy node and member lists through the merge map
    fn fix_references(&mut self) -> Result<()> {
        let source = self.source;
        for kind in [PrimitiveKind::Way, PrimitiveKind::Relation] {
            for id in source.sorted_ids(kind) {
                if !self.children_to_fix.contains(&id) || self.conflicts.has_conflict_for_their(id)
                {
                    continue;
                }
                let Some(s) = source.primitive(id) else {
                    continue;
                };
                // Incomplete primitives carry no list to copy
                if s.is_incomplete() {
                    continue;
                }
                let target = *self
                    .merged_map
                    .get(&id)
                    .ok_or(MapDataError::MissingMergeTarget(id))?;
                let parent_deleted = self.tx.primitive(target).is_some_and(|t| t.is_deleted());

                let children = s
                    .children()
                    .into_iter()
                    .map(|child| self.resolve(child, parent_deleted).map(|t| (child, t)))
                    .collect::<Result<HashMap<PrimitiveId, PrimitiveId>>>()?;

                // A live parent cannot point at a deleted primitive whose conflict is still open
                if !parent_deleted
                    && children
                        .values()
                        .any(|t| self.tx.primitive(*t).is_some_and(|p| p.is_deleted()))
                {
                    debug!("Leaving the list of {target} unchanged: it refers to a conflicted deleted primitive");
                    self.conflicts.add(Conflict::new(target, s, false));
                    continue;
                }

                match s {
                    Primitive::Way(w) => {
                        let nodes = w
                            .node_ids()
                            .filter_map(|n| children.get(&n).map(|t| t.id))
                            .collect();
                        self.tx.set_way_nodes(target.id, nodes)?;
                    }
                    Primitive::Relation(r) => {
                        let members = r
                            .members()
                            .iter()
                            .filter_map(|m| {
                                children
                                    .get(&m.member)
                                    .map(|&t| RelationMember::new(m.role.clone(), t))
                            })
                            .collect();
                        self.tx.set_members(target.id, members)?;
                    }
                    Primitive::Node(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Target counterpart of a referenced source primitive
    ///
    /// A deleted counterpart referenced by a live parent is undeleted and reported, unless
    /// it already has a conflict of its own.
    fn resolve(&mut self, child: PrimitiveId, parent_deleted: bool) -> Result<PrimitiveId> {
        let target = *self
            .merged_map
            .get(&child)
            .ok_or(MapDataError::MissingMergeTarget(child))?;
        let target_deleted = self.tx.primitive(target).is_some_and(|t| t.is_deleted());
        if target_deleted && !parent_deleted && !self.conflicts.has_conflict_for_my(target) {
            if let Some(their) = self.source.primitive(child) {
                self.conflicts.add(Conflict::new(target, their, true));
            }
            self.tx.set_deleted(target, false)?;
        }
        Ok(target)
    }

    /// Remove live references to primitives that the merge deleted
    fn unlink_deleted(&mut self) -> Result<()> {
        for target in std::mem::take(&mut self.deleted_targets) {
            if self.tx.primitive(target).is_some_and(|t| t.is_deleted()) {
                self.tx.unlink_references_to_primitive(target)?;
            }
        }
        Ok(())
    }
}
