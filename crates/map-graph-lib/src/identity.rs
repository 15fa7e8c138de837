//! Open-addressing hash set with pluggable hashing
//!
//! [`IdentityStore`] holds elements in a single power-of-two slot array with linear
//! probing. How elements are hashed and compared is decided by a [`HashStrategy`], and the
//! same store can be queried by a different key type (a "foreign key") as long as that
//! strategy hashes the key the way the store's own strategy hashes the element.
//!
//! The slot array sits behind an [`Arc`]: [`IdentityStore::snapshot`] shares it, and the
//! next mutation copies it, so a snapshot taken before a change keeps seeing the old state.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Initial number of slots
const DEFAULT_CAPACITY: usize = 16;

/// The store grows once more than this share of the slots is occupied
const LOAD_FACTOR: f64 = 0.6;

/// Hashing and equality of a key against stored elements
pub trait HashStrategy<K: ?Sized, T> {
    /// Hash of the key
    fn hash(&self, key: &K) -> u64;

    /// Whether `item` is the element identified by `key`
    fn equals(&self, key: &K, item: &T) -> bool;
}

/// Strategy using the element's own [`Hash`] and [`Eq`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategy;

impl<T: Hash + Eq> HashStrategy<T, T> for DefaultStrategy {
    fn hash(&self, key: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn equals(&self, key: &T, item: &T) -> bool {
        key == item
    }
}

/// Spread poor hash codes over the low bits used for bucket selection
#[inline]
fn spread(h: u64) -> u64 {
    let h = (h ^ (h >> 33)).wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^ (h >> 33)
}

fn empty_slots<T>(capacity: usize) -> Vec<Option<T>> {
    (0..capacity).map(|_| None).collect()
}

/// Hash set over `T` with the identity semantics of `H`
pub struct IdentityStore<T, H = DefaultStrategy> {
    slots: Arc<Vec<Option<T>>>,
    len: usize,
    mask: usize,
    strategy: H,
}

impl<T: Clone, H: HashStrategy<T, T> + Default> IdentityStore<T, H> {
    /// Create an empty store with the default strategy
    pub fn new() -> Self {
        Self::with_strategy(H::default())
    }

    /// Create an empty store that holds `capacity` elements without growing
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_strategy(capacity, H::default())
    }
}

impl<T: Clone, H: HashStrategy<T, T> + Default> Default for IdentityStore<T, H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Clone, H: HashStrategy<T, T>> IdentityStore<T, H> {
    /// Create an empty store using `strategy`
    pub fn with_strategy(strategy: H) -> Self {
        Self::with_capacity_and_strategy(DEFAULT_CAPACITY, strategy)
    }

    /// Create an empty store using `strategy`, sized for `capacity` elements
    pub fn with_capacity_and_strategy(capacity: usize, strategy: H) -> Self {
        let slots = ((capacity as f64 / LOAD_FACTOR).ceil() as usize)
            .max(DEFAULT_CAPACITY)
            .next_power_of_two();
        Self {
            slots: Arc::new(empty_slots(slots)),
            len: 0,
            mask: slots - 1,
            strategy,
        }
    }

    pub fn strategy(&self) -> &H {
        &self.strategy
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots, always a power of two
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Locate `key`: `Ok(slot)` when found, `Err(slot)` with the free slot ending the probe
    fn probe<K: ?Sized, S: HashStrategy<K, T>>(&self, strategy: &S, key: &K) -> Result<usize, usize> {
        let mut bucket = spread(strategy.hash(key)) as usize & self.mask;
        loop {
            match &self.slots[bucket] {
                None => return Err(bucket),
                Some(item) if strategy.equals(key, item) => return Ok(bucket),
                Some(_) => bucket = (bucket + 1) & self.mask,
            }
        }
    }

    #[inline]
    fn home(&self, item: &T) -> usize {
        spread(self.strategy.hash(item)) as usize & self.mask
    }

    /// Insert `item` unless an equal element exists; returns whether it was inserted
    pub fn add(&mut self, item: T) -> bool {
        match self.probe(&self.strategy, &item) {
            Ok(_) => false,
            Err(bucket) => {
                Arc::make_mut(&mut self.slots)[bucket] = Some(item);
                self.len += 1;
                self.ensure_capacity();
                true
            }
        }
    }

    /// Insert `item`, replacing and returning an equal element if present
    pub fn put(&mut self, item: T) -> Option<T> {
        match self.probe(&self.strategy, &item) {
            Ok(bucket) => Arc::make_mut(&mut self.slots)[bucket].replace(item),
            Err(bucket) => {
                Arc::make_mut(&mut self.slots)[bucket] = Some(item);
                self.len += 1;
                self.ensure_capacity();
                None
            }
        }
    }

    /// The stored element equal to `item`
    pub fn get(&self, item: &T) -> Option<&T> {
        self.find(&self.strategy, item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.probe(&self.strategy, item).is_ok()
    }

    /// Remove and return the element equal to `item`
    pub fn remove(&mut self, item: &T) -> Option<T> {
        let bucket = self.probe(&self.strategy, item).ok()?;
        self.remove_at(bucket)
    }

    /// Element identified by `key` under a foreign strategy
    pub fn find<K: ?Sized, S: HashStrategy<K, T>>(&self, strategy: &S, key: &K) -> Option<&T> {
        let bucket = self.probe(strategy, key).ok()?;
        self.slots[bucket].as_ref()
    }

    /// Mutable access to the element identified by `key`
    ///
    /// The element must keep hashing to the same value; changing its identity corrupts the
    /// store.
    pub fn find_mut<K: ?Sized, S: HashStrategy<K, T>>(
        &mut self,
        strategy: &S,
        key: &K,
    ) -> Option<&mut T> {
        let bucket = self.probe(strategy, key).ok()?;
        Arc::make_mut(&mut self.slots)[bucket].as_mut()
    }

    /// Remove the element identified by `key` under a foreign strategy
    pub fn remove_by<K: ?Sized, S: HashStrategy<K, T>>(&mut self, strategy: &S, key: &K) -> Option<T> {
        let bucket = self.probe(strategy, key).ok()?;
        self.remove_at(bucket)
    }

    /// Read-only lookups by a foreign key
    pub fn foreign_key<S>(&self, strategy: S) -> ForeignKeyView<'_, T, H, S> {
        ForeignKeyView {
            store: self,
            strategy,
        }
    }

    /// Lookups, mutation and removal by a foreign key
    pub fn foreign_key_mut<S>(&mut self, strategy: S) -> ForeignKeyViewMut<'_, T, H, S> {
        ForeignKeyViewMut {
            store: self,
            strategy,
        }
    }

    /// Remove the element in `hole` and shift later members of its probe run backwards so
    /// that no lookup stops early at the freed slot
    fn remove_at(&mut self, hole: usize) -> Option<T> {
        let removed = Arc::make_mut(&mut self.slots)[hole].take();
        if removed.is_none() {
            return None;
        }
        self.len -= 1;

        let mut hole = hole;
        let mut index = hole;
        loop {
            index = (index + 1) & self.mask;
            let home = match &self.slots[index] {
                None => break,
                Some(item) => self.home(item),
            };
            // The element may move into the hole unless its home lies cyclically in (hole, index]
            let stays = if hole <= index {
                hole < home && home <= index
            } else {
                hole < home || home <= index
            };
            if !stays {
                let slots = Arc::make_mut(&mut self.slots);
                slots[hole] = slots[index].take();
                hole = index;
            }
        }
        removed
    }

    fn ensure_capacity(&mut self) {
        if self.len as f64 > self.slots.len() as f64 * LOAD_FACTOR {
            self.resize(self.slots.len() * 2);
        }
    }

    fn resize(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.slots, Arc::new(empty_slots(capacity)));
        self.mask = capacity - 1;

        let items: Vec<T> = match Arc::try_unwrap(old) {
            Ok(slots) => slots.into_iter().flatten().collect(),
            Err(shared) => shared.iter().flatten().cloned().collect(),
        };

        let strategy = &self.strategy;
        let mask = self.mask;
        let slots = Arc::make_mut(&mut self.slots);
        for item in items {
            let mut bucket = spread(strategy.hash(&item)) as usize & mask;
            while slots[bucket].is_some() {
                bucket = (bucket + 1) & mask;
            }
            slots[bucket] = Some(item);
        }
    }

    /// Remove every element and shrink back to the initial capacity
    pub fn clear(&mut self) {
        self.slots = Arc::new(empty_slots(DEFAULT_CAPACITY));
        self.mask = DEFAULT_CAPACITY - 1;
        self.len = 0;
    }

    /// Iterate the elements in slot order
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter().flatten()
    }

    /// A frozen view of the current elements, unaffected by later mutations of the store
    pub fn snapshot(&self) -> Snapshot<T> {
        Snapshot {
            slots: self.slots.clone(),
            len: self.len,
        }
    }
}

impl<T: Clone, H: Clone> Clone for IdentityStore<T, H> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            len: self.len,
            mask: self.mask,
            strategy: self.strategy.clone(),
        }
    }
}

impl<T: fmt::Debug, H> fmt::Debug for IdentityStore<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.slots.iter().flatten()).finish()
    }
}

/// Frozen element list returned by [`IdentityStore::snapshot`]
pub struct Snapshot<T> {
    slots: Arc<Vec<Option<T>>>,
    len: usize,
}

impl<T> Snapshot<T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<'a, T> IntoIterator for &'a Snapshot<T> {
    type Item = &'a T;
    type IntoIter = std::iter::Flatten<std::slice::Iter<'a, Option<T>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter().flatten()
    }
}

/// Shared lookups into an [`IdentityStore`] by a foreign key
pub struct ForeignKeyView<'a, T, H, S> {
    store: &'a IdentityStore<T, H>,
    strategy: S,
}

impl<'a, T: Clone, H: HashStrategy<T, T>, S> ForeignKeyView<'a, T, H, S> {
    pub fn get<K: ?Sized>(&self, key: &K) -> Option<&'a T>
    where
        S: HashStrategy<K, T>,
    {
        self.store.find(&self.strategy, key)
    }

    pub fn contains_key<K: ?Sized>(&self, key: &K) -> bool
    where
        S: HashStrategy<K, T>,
    {
        self.get(key).is_some()
    }
}

/// Exclusive lookups into an [`IdentityStore`] by a foreign key
pub struct ForeignKeyViewMut<'a, T, H, S> {
    store: &'a mut IdentityStore<T, H>,
    strategy: S,
}

impl<T: Clone, H: HashStrategy<T, T>, S> ForeignKeyViewMut<'_, T, H, S> {
    pub fn get<K: ?Sized>(&self, key: &K) -> Option<&T>
    where
        S: HashStrategy<K, T>,
    {
        self.store.find(&self.strategy, key)
    }

    pub fn get_mut<K: ?Sized>(&mut self, key: &K) -> Option<&mut T>
    where
        S: HashStrategy<K, T>,
    {
        self.store.find_mut(&self.strategy, key)
    }

    pub fn contains_key<K: ?Sized>(&self, key: &K) -> bool
    where
        S: HashStrategy<K, T>,
    {
        self.get(key).is_some()
    }

    pub fn remove<K: ?Sized>(&mut self, key: &K) -> Option<T>
    where
        S: HashStrategy<K, T>,
    {
        self.store.remove_by(&self.strategy, key)
    }
}
