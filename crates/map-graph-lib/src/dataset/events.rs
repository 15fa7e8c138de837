//! Change events delivered to dataset listeners

use crate::PrimitiveId;
use std::collections::BTreeMap;

/// A change made to a dataset during a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetEvent {
    /// Primitives were added, or incomplete primitives became complete
    PrimitivesAdded {
        primitives: Vec<PrimitiveId>,
        was_incomplete: bool,
    },
    PrimitivesRemoved {
        primitives: Vec<PrimitiveId>,
    },
    TagsChanged {
        primitive: PrimitiveId,
        /// Tags before the change
        original: BTreeMap<String, String>,
    },
    NodeMoved {
        node: PrimitiveId,
    },
    WayNodesChanged {
        way: PrimitiveId,
    },
    RelationMembersChanged {
        relation: PrimitiveId,
    },
    ChangesetIdChanged {
        primitive: PrimitiveId,
        old: u32,
        new: u32,
    },
    /// Modified, deleted, visible, filter or highlight state changed
    PrimitiveFlagsChanged {
        primitive: PrimitiveId,
    },
    /// Too many changes to report one by one; carries the queued events in order
    DataChanged {
        events: Vec<DatasetEvent>,
    },
}

impl DatasetEvent {
    /// Primitives affected by this event
    pub fn primitives(&self) -> Vec<PrimitiveId> {
        match self {
            DatasetEvent::PrimitivesAdded { primitives, .. }
            | DatasetEvent::PrimitivesRemoved { primitives } => primitives.clone(),
            DatasetEvent::TagsChanged { primitive, .. }
            | DatasetEvent::ChangesetIdChanged { primitive, .. }
            | DatasetEvent::PrimitiveFlagsChanged { primitive } => vec![*primitive],
            DatasetEvent::NodeMoved { node } => vec![*node],
            DatasetEvent::WayNodesChanged { way } => vec![*way],
            DatasetEvent::RelationMembersChanged { relation } => vec![*relation],
            DatasetEvent::DataChanged { events } => {
                let mut all: Vec<PrimitiveId> =
                    events.iter().flat_map(|e| e.primitives()).collect();
                all.sort();
                all.dedup();
                all
            }
        }
    }
}

/// Receiver of [`DatasetEvent`]s
///
/// Called on the thread that closed the transaction, after the write lock was released.
/// Closures taking `&DatasetEvent` implement this trait.
pub trait DatasetListener: Send + Sync {
    fn on_event(&self, event: &DatasetEvent);
}

impl<F> DatasetListener for F
where
    F: Fn(&DatasetEvent) + Send + Sync,
{
    fn on_event(&self, event: &DatasetEvent) {
        self(event)
    }
}
