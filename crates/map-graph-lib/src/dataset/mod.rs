//! Transactional container for map data
//!
//! A [`Dataset`] guards its [`DatasetContents`] with a read/write lock. Reads go through
//! [`Dataset::read`]; writes go through a [`Transaction`] obtained from
//! [`Dataset::begin_update`]. Events queued while the transaction is open are delivered
//! once the outermost transaction has released the lock, so listeners may read the dataset
//! from their callbacks.
//!
//! Taking a second lock on the same dataset from a thread that already holds one deadlocks;
//! use [`Transaction::nested`] instead.

mod contents;
mod events;
pub mod selection;

pub use contents::DatasetContents;
pub use events::{DatasetEvent, DatasetListener};
pub use selection::{SelectionChangeEvent, SelectionListener};

use crate::{Config, IdGenerator, MapDataError, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

static NEXT_DATASET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a dataset
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(u64);

impl DatasetId {
    pub(crate) fn next() -> Self {
        Self(NEXT_DATASET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dataset#{}", self.0)
    }
}

impl fmt::Debug for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Map data shared between threads
pub struct Dataset {
    id: DatasetId,
    contents: RwLock<DatasetContents>,
    listeners: RwLock<Vec<Arc<dyn DatasetListener>>>,
    selection_listeners: RwLock<Vec<Arc<dyn SelectionListener>>>,
    locked: AtomicBool,
}

impl Dataset {
    /// An empty dataset with the default configuration
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_id_generator(config, IdGenerator::default())
    }

    /// An empty dataset allocating local ids from `ids`, which may be shared with others
    pub fn with_id_generator(config: Config, ids: IdGenerator) -> Self {
        let id = DatasetId::next();
        Self {
            id,
            contents: RwLock::new(DatasetContents::new(id, config, ids)),
            listeners: RwLock::new(Vec::new()),
            selection_listeners: RwLock::new(Vec::new()),
            locked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    /// Shared read access; blocks while a transaction is open
    pub fn read(&self) -> DatasetReadGuard<'_> {
        DatasetReadGuard {
            guard: self.contents.read(),
        }
    }

    /// Open a transaction holding the write lock
    ///
    /// Fails with [`MapDataError::ReadOnly`] on a locked dataset.
    pub fn begin_update(&self) -> Result<Transaction<'_>> {
        if self.is_locked() {
            return Err(MapDataError::ReadOnly);
        }
        let mut guard = self.contents.write();
        guard.update_depth = 1;
        let max_single_events = guard.config().max_single_events;
        Ok(Transaction {
            guard: TransactionGuard::Outermost(guard),
            flush: PendingFlush {
                dataset: self,
                events: Vec::new(),
                selection: Vec::new(),
                max_single_events,
            },
        })
    }

    /// Run `update` inside a transaction
    ///
    /// Changes made before an error are kept and reported like any other.
    pub fn update<R>(&self, update: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut transaction = self.begin_update()?;
        let result = update(&mut transaction);
        transaction.commit();
        result
    }

    /// Make the dataset read-only
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn add_dataset_listener(&self, listener: Arc<dyn DatasetListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_dataset_listener(&self, listener: &Arc<dyn DatasetListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_selection_listener(&self, listener: Arc<dyn SelectionListener>) {
        self.selection_listeners.write().push(listener);
    }

    pub fn remove_selection_listener(&self, listener: &Arc<dyn SelectionListener>) {
        self.selection_listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }
}

impl Default for Dataset {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("locked", &self.is_locked())
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

/// Shared access to a dataset's contents
pub struct DatasetReadGuard<'a> {
    guard: RwLockReadGuard<'a, DatasetContents>,
}

impl Deref for DatasetReadGuard<'_> {
    type Target = DatasetContents;

    fn deref(&self) -> &DatasetContents {
        &self.guard
    }
}

enum TransactionGuard<'a> {
    Outermost(RwLockWriteGuard<'a, DatasetContents>),
    Nested(&'a mut DatasetContents),
}

impl Deref for TransactionGuard<'_> {
    type Target = DatasetContents;

    fn deref(&self) -> &DatasetContents {
        match self {
            TransactionGuard::Outermost(guard) => guard,
            TransactionGuard::Nested(contents) => contents,
        }
    }
}

impl DerefMut for TransactionGuard<'_> {
    fn deref_mut(&mut self) -> &mut DatasetContents {
        match self {
            TransactionGuard::Outermost(guard) => guard,
            TransactionGuard::Nested(contents) => contents,
        }
    }
}

/// Events taken out of the contents when the outermost transaction closes
///
/// Dropped after the write guard, so delivery happens without the lock.
struct PendingFlush<'a> {
    dataset: &'a Dataset,
    events: Vec<DatasetEvent>,
    selection: Vec<SelectionChangeEvent>,
    max_single_events: usize,
}

impl Drop for PendingFlush<'_> {
    fn drop(&mut self) {
        if self.events.is_empty() && self.selection.is_empty() {
            return;
        }
        #[cfg(feature = "profiling")]
        profiling::scope!("dataset::flush");

        let events = std::mem::take(&mut self.events);
        if !events.is_empty() {
            let listeners = self.dataset.listeners.read().clone();
            let coalesced = events.len() > self.max_single_events;
            debug!(
                "Delivering {} events of {} to {} listeners (coalesced: {})",
                events.len(),
                self.dataset.id,
                listeners.len(),
                coalesced
            );
            if coalesced {
                let event = DatasetEvent::DataChanged { events };
                for listener in &listeners {
                    listener.on_event(&event);
                }
            } else {
                for event in &events {
                    for listener in &listeners {
                        listener.on_event(event);
                    }
                }
            }
        }

        if !self.selection.is_empty() {
            let mut listeners = self.dataset.selection_listeners.read().clone();
            listeners.extend(selection::global_selection_listeners());
            for event in &self.selection {
                for listener in &listeners {
                    listener.selection_changed(event);
                }
            }
        }
    }
}

/// Exclusive access to a dataset's contents
///
/// Dereferences to [`DatasetContents`]. Dropping the outermost transaction (or calling
/// [`commit`](Transaction::commit)) releases the lock and delivers the queued events.
pub struct Transaction<'a> {
    // Declared before `flush`: the lock is released before events are delivered
    guard: TransactionGuard<'a>,
    flush: PendingFlush<'a>,
}

impl<'a> Transaction<'a> {
    /// A transaction sharing this one's lock; its events are delivered with the outermost
    pub fn nested(&mut self) -> Transaction<'_> {
        let contents: &mut DatasetContents = &mut self.guard;
        contents.update_depth += 1;
        Transaction {
            guard: TransactionGuard::Nested(contents),
            flush: PendingFlush {
                dataset: self.flush.dataset,
                events: Vec::new(),
                selection: Vec::new(),
                max_single_events: self.flush.max_single_events,
            },
        }
    }

    /// Number of transactions open on this lock, this one included
    pub fn depth(&self) -> usize {
        self.guard.update_depth
    }

    /// Close the transaction
    pub fn commit(self) {}
}

impl Deref for Transaction<'_> {
    type Target = DatasetContents;

    fn deref(&self) -> &DatasetContents {
        &self.guard
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut DatasetContents {
        &mut self.guard
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let contents: &mut DatasetContents = &mut self.guard;
        contents.update_depth = contents.update_depth.saturating_sub(1);
        if contents.update_depth == 0 {
            self.flush.events = std::mem::take(&mut contents.pending_events);
            self.flush.selection = std::mem::take(&mut contents.pending_selection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LatLon, Node, PrimitiveId, Way};
    use parking_lot::Mutex;

    fn recorder(dataset: &Dataset) -> Arc<Mutex<Vec<DatasetEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dataset.add_dataset_listener(Arc::new(move |e: &DatasetEvent| {
            sink.lock().push(e.clone());
        }));
        events
    }

    fn node(id: i64, lat: f64, lon: f64) -> Node {
        Node::with_id(id, 1).unwrap().with_coor(LatLon::new(lat, lon))
    }

    #[test]
    fn test_events_delivered_on_commit() {
        let dataset = Dataset::new();
        let events = recorder(&dataset);

        let mut tx = dataset.begin_update().unwrap();
        tx.add_primitive(node(1, 1.0, 1.0)).unwrap();
        tx.put_tag(PrimitiveId::node(1), "amenity", Some("bench"))
            .unwrap();
        assert!(events.lock().is_empty());
        tx.commit();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            DatasetEvent::PrimitivesAdded { primitives, was_incomplete: false }
                if primitives == &[PrimitiveId::node(1)]
        ));
        assert!(matches!(
            &events[1],
            DatasetEvent::TagsChanged { original, .. } if original.is_empty()
        ));
    }

    #[test]
    fn test_events_coalesced_past_threshold() {
        let dataset = Dataset::new();
        let events = recorder(&dataset);

        dataset
            .update(|tx| {
                for i in 1..=31 {
                    tx.add_primitive(node(i, 0.0, i as f64 * 0.001))?;
                }
                Ok(())
            })
            .unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DatasetEvent::DataChanged { events } => assert_eq!(events.len(), 31),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_exactly_threshold_events_replayed() {
        let dataset = Dataset::new();
        let events = recorder(&dataset);
        dataset
            .update(|tx| {
                for i in 1..=30 {
                    tx.add_primitive(node(i, 0.0, 0.0))?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(events.lock().len(), 30);
    }

    #[test]
    fn test_nested_transaction_flushes_with_outermost() {
        let dataset = Dataset::new();
        let events = recorder(&dataset);

        let mut tx = dataset.begin_update().unwrap();
        assert_eq!(tx.depth(), 1);
        {
            let mut inner = tx.nested();
            assert_eq!(inner.depth(), 2);
            inner.add_primitive(node(1, 0.0, 0.0)).unwrap();
        }
        assert_eq!(tx.depth(), 1);
        assert!(events.lock().is_empty());
        drop(tx);

        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_listener_can_read_during_delivery() {
        let dataset = Arc::new(Dataset::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (ds, sink) = (Arc::downgrade(&dataset), seen.clone());
        dataset.add_dataset_listener(Arc::new(move |_: &DatasetEvent| {
            if let Some(ds) = ds.upgrade() {
                sink.lock().push(ds.read().len());
            }
        }));

        dataset
            .update(|tx| tx.add_primitive(node(1, 0.0, 0.0)))
            .unwrap();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn test_read_only_dataset() {
        let dataset = Dataset::new();
        dataset.lock();
        assert!(dataset.is_locked());
        assert!(matches!(
            dataset.begin_update(),
            Err(MapDataError::ReadOnly)
        ));
        dataset.unlock();
        assert!(dataset.begin_update().is_ok());
    }

    #[test]
    fn test_remove_listener() {
        let dataset = Dataset::new();
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let listener: Arc<dyn DatasetListener> = Arc::new(move |_: &DatasetEvent| {
            *sink.lock() += 1;
        });
        dataset.add_dataset_listener(listener.clone());
        dataset
            .update(|tx| tx.add_primitive(node(1, 0.0, 0.0)))
            .unwrap();
        dataset.remove_dataset_listener(&listener);
        dataset
            .update(|tx| tx.add_primitive(node(2, 0.0, 0.0)))
            .unwrap();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_selection_events() {
        let dataset = Dataset::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        dataset.add_selection_listener(Arc::new(move |e: &SelectionChangeEvent| {
            sink.lock().push(e.clone());
        }));

        dataset
            .update(|tx| {
                tx.add_primitive(node(1, 0.0, 0.0))?;
                tx.add_primitive(node(2, 0.0, 0.0))?;
                tx.set_selected([PrimitiveId::node(1), PrimitiveId::node(3)]);
                tx.add_selected([PrimitiveId::node(2)]);
                Ok(())
            })
            .unwrap();

        let received = received.lock();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].added, vec![PrimitiveId::node(1)]);
        assert_eq!(received[1].added, vec![PrimitiveId::node(2)]);
        assert_eq!(
            &*received[1].new,
            &[PrimitiveId::node(1), PrimitiveId::node(2)]
        );
        assert_eq!(received[1].dataset, dataset.id());
        assert_eq!(dataset.read().selected().len(), 2);
    }

    #[test]
    fn test_removed_primitive_leaves_selection() {
        let dataset = Dataset::new();
        dataset
            .update(|tx| {
                tx.add_primitive(node(1, 0.0, 0.0))?;
                tx.set_selected([PrimitiveId::node(1)]);
                tx.remove_primitive(PrimitiveId::node(1))?;
                Ok(())
            })
            .unwrap();
        assert!(dataset.read().selected().is_empty());
    }

    #[test]
    fn test_shared_id_generator() {
        let ids = IdGenerator::default();
        let a = Dataset::with_id_generator(Config::default(), ids.clone());
        let b = Dataset::with_id_generator(Config::default(), ids);
        let first = a.update(|tx| {
            let way = Way::new_local(tx.id_generator());
            tx.add_primitive(way)
        });
        let second = b.update(|tx| {
            let way = Way::new_local(tx.id_generator());
            tx.add_primitive(way)
        });
        assert_ne!(first.unwrap(), second.unwrap());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_concurrent_readers() {
        let dataset = Arc::new(Dataset::new());
        dataset
            .update(|tx| {
                for i in 1..=100 {
                    tx.add_primitive(node(i, 0.0, 0.0))?;
                }
                Ok(())
            })
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ds = dataset.clone();
                std::thread::spawn(move || ds.read().nodes().count())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 100);
        }
    }
}
