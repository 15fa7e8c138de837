//! Selection state and selection listeners

use super::DatasetId;
use crate::PrimitiveId;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock, OnceLock};

/// A change of a dataset's selection
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionChangeEvent {
    pub dataset: DatasetId,
    pub old: Arc<[PrimitiveId]>,
    pub new: Arc<[PrimitiveId]>,
    pub added: Vec<PrimitiveId>,
    pub removed: Vec<PrimitiveId>,
}

/// Receiver of [`SelectionChangeEvent`]s; closures implement this trait
pub trait SelectionListener: Send + Sync {
    fn selection_changed(&self, event: &SelectionChangeEvent);
}

impl<F> SelectionListener for F
where
    F: Fn(&SelectionChangeEvent) + Send + Sync,
{
    fn selection_changed(&self, event: &SelectionChangeEvent) {
        self(event)
    }
}

static GLOBAL_LISTENERS: LazyLock<RwLock<Vec<Arc<dyn SelectionListener>>>> =
    LazyLock::new(|| RwLock::new(Vec::new()));

/// Register a listener notified of selection changes in every dataset
pub fn add_global_selection_listener(listener: Arc<dyn SelectionListener>) {
    GLOBAL_LISTENERS.write().push(listener);
}

/// Unregister a listener added with [`add_global_selection_listener`]
pub fn remove_global_selection_listener(listener: &Arc<dyn SelectionListener>) {
    GLOBAL_LISTENERS
        .write()
        .retain(|l| !Arc::ptr_eq(l, listener));
}

pub(crate) fn global_selection_listeners() -> Vec<Arc<dyn SelectionListener>> {
    GLOBAL_LISTENERS.read().clone()
}

/// Ordered set of selected primitives
#[derive(Debug, Default, Clone)]
pub(crate) struct Selection {
    order: Vec<PrimitiveId>,
    members: HashSet<PrimitiveId>,
    /// Memoized copy of `order`, reset on every change
    snapshot: OnceLock<Arc<[PrimitiveId]>>,
}

impl Selection {
    pub fn snapshot(&self) -> Arc<[PrimitiveId]> {
        self.snapshot
            .get_or_init(|| Arc::from(self.order.as_slice()))
            .clone()
    }

    pub fn contains(&self, id: &PrimitiveId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    fn invalidate(&mut self) {
        self.snapshot = OnceLock::new();
    }

    /// Returns whether the id was newly added
    pub fn insert(&mut self, id: PrimitiveId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push(id);
        self.invalidate();
        true
    }

    /// Returns whether the id was selected
    pub fn remove(&mut self, id: &PrimitiveId) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|p| p != id);
        self.invalidate();
        true
    }

    /// Replace one id by another at the same position
    pub fn replace(&mut self, old: &PrimitiveId, new: PrimitiveId) {
        if !self.members.remove(old) {
            return;
        }
        self.members.insert(new);
        for p in self.order.iter_mut() {
            if p == old {
                *p = new;
            }
        }
        self.invalidate();
    }

    pub fn clear(&mut self) {
        if self.order.is_empty() {
            return;
        }
        self.order.clear();
        self.members.clear();
        self.invalidate();
    }
}
