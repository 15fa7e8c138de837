//! Copy-on-write tag storage
//!
//! Every primitive carries a [`TagStore`]. The store keeps its key/value pairs in a single
//! immutable array; writers build a new array and swap it in, so a reader always works on
//! a complete, committed state even while another thread is writing.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A single key/value pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Keys that are dropped silently when data is uploaded
const DISCARDABLE_KEYS: &[&str] = &[
    "created_by",
    "converted_by",
    "geobase:datasetName",
    "geobase:uuid",
    "KSJ2:ADS",
    "KSJ2:ARE",
    "KSJ2:AdminArea",
    "KSJ2:COP_label",
    "KSJ2:DFD",
    "KSJ2:INT",
    "KSJ2:INT_label",
    "KSJ2:LOC",
    "KSJ2:LPN",
    "KSJ2:OPC",
    "KSJ2:PubFacAdmin",
    "KSJ2:RAC",
    "KSJ2:RAC_label",
    "KSJ2:RIC",
    "KSJ2:RIN",
    "KSJ2:WSC",
    "KSJ2:coordinate",
    "KSJ2:curve_id",
    "KSJ2:curve_type",
    "KSJ2:filename",
    "KSJ2:lake_id",
    "KSJ2:lat",
    "KSJ2:long",
    "KSJ2:river_id",
    "odbl",
    "odbl:note",
    "osmarender:nameDirection",
    "osmarender:renderName",
    "osmarender:renderRef",
    "osmarender:rendernames",
    "SK53_bulk:load",
    "sub_sea:type",
    "tiger:source",
    "tiger:separated",
    "tiger:tlid",
    "tiger:upload_uuid",
    "yh:LINE_NAME",
    "yh:LINE_NUM",
    "yh:STRUCTURE",
    "yh:TOTYUMONO",
    "yh:TYPE",
    "yh:WIDTH",
    "yh:WIDTH_RANK",
];

/// Keys marking a primitive as needing further work
const WORK_IN_PROGRESS_KEYS: &[&str] = &["note", "fixme", "FIXME"];

/// Keys describing provenance rather than the mapped feature. Entries ending in `:` match
/// every key with that prefix.
const METADATA_KEYS: &[&str] = &[
    "source",
    "source_ref",
    "source:",
    "comment",
    "watch",
    "watch:",
    "description",
    "attribution",
    "gpx:",
];

static UNINTERESTING_KEYS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    METADATA_KEYS
        .iter()
        .chain(DISCARDABLE_KEYS)
        .chain(WORK_IN_PROGRESS_KEYS)
        .copied()
        .collect()
});

/// Whether a key carries no semantic meaning for the mapped feature
///
/// A key `prefix:rest` is uninteresting when `prefix:` is listed.
pub fn is_uninteresting_key(key: &str) -> bool {
    if UNINTERESTING_KEYS.contains(key) {
        return true;
    }
    match key.find(':') {
        Some(pos) if pos > 0 => UNINTERESTING_KEYS.contains(&key[..=pos]),
        _ => false,
    }
}

/// Whether a key is removed automatically before upload
pub fn is_discardable_key(key: &str) -> bool {
    DISCARDABLE_KEYS.contains(&key)
}

/// Whether a key marks unfinished work
pub fn is_work_in_progress_key(key: &str) -> bool {
    WORK_IN_PROGRESS_KEYS.contains(&key)
}

/// Copy-on-write key/value map with unique keys
///
/// Reads take a cheap snapshot of the current array; writes replace the array as a whole.
/// Writers are not serialized against each other beyond the swap itself: callers that
/// need read-modify-write atomicity across several calls (such as a dataset transaction)
/// must serialize their writers.
pub struct TagStore {
    tags: RwLock<Arc<[Tag]>>,
}

impl TagStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tags: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Create a store from key/value pairs; later duplicates win
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        store.set_all(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        store
    }

    /// The committed tag array at the time of the call
    #[inline]
    pub fn snapshot(&self) -> Arc<[Tag]> {
        self.tags.read().clone()
    }

    /// Value for a key
    pub fn get(&self, key: &str) -> Option<String> {
        self.snapshot()
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.clone())
    }

    /// Value for a key, comparing keys case-insensitively
    pub fn get_ignore_case(&self, key: &str) -> Option<String> {
        self.snapshot()
            .iter()
            .find(|t| t.key.eq_ignore_ascii_case(key))
            .map(|t| t.value.clone())
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.snapshot().iter().any(|t| t.key == key)
    }

    /// Set a value; `None` removes the key. Blank keys are ignored.
    ///
    /// Returns whether the stored tags changed.
    pub fn put(&self, key: &str, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return self.remove(key);
        };
        if key.trim().is_empty() {
            return false;
        }

        let mut guard = self.tags.write();
        let current = guard.clone();
        let mut next: Vec<Tag> = Vec::with_capacity(current.len() + 1);
        let mut replaced = false;
        for tag in current.iter() {
            if tag.key == key {
                if tag.value == value {
                    return false;
                }
                next.push(Tag::new(key, value));
                replaced = true;
            } else {
                next.push(tag.clone());
            }
        }
        if !replaced {
            next.push(Tag::new(key, value));
        }
        *guard = Arc::from(next);
        true
    }

    /// Remove a key, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        let mut guard = self.tags.write();
        if !guard.iter().any(|t| t.key == key) {
            return false;
        }
        let next: Vec<Tag> = guard.iter().filter(|t| t.key != key).cloned().collect();
        *guard = Arc::from(next);
        true
    }

    /// Remove every tag, returning whether there were any
    pub fn remove_all(&self) -> bool {
        let mut guard = self.tags.write();
        if guard.is_empty() {
            return false;
        }
        *guard = Arc::from(Vec::new());
        true
    }

    /// Replace all tags at once; blank keys are skipped and later duplicates win
    pub fn set_all(&self, tags: impl IntoIterator<Item = (String, String)>) {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in tags {
            if !key.trim().is_empty() {
                map.insert(key, value);
            }
        }
        let next: Vec<Tag> = map.into_iter().map(|(k, v)| Tag { key: k, value: v }).collect();
        *self.tags.write() = Arc::from(next);
    }

    /// All keys, in storage order
    pub fn keys(&self) -> Vec<String> {
        self.snapshot().iter().map(|t| t.key.clone()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tags.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tags.read().is_empty()
    }

    /// Call `visitor` for every key/value pair of one committed state
    pub fn visit(&self, mut visitor: impl FnMut(&str, &str)) {
        for tag in self.snapshot().iter() {
            visitor(&tag.key, &tag.value);
        }
    }

    /// Sorted copy of all tags
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.snapshot()
            .iter()
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect()
    }

    /// Sorted copy of the tags whose key is not [uninteresting](is_uninteresting_key)
    pub fn interesting(&self) -> BTreeMap<String, String> {
        self.snapshot()
            .iter()
            .filter(|t| !is_uninteresting_key(&t.key))
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect()
    }

    /// Whether at least one tag has an interesting key
    pub fn has_interesting_tags(&self) -> bool {
        self.snapshot().iter().any(|t| !is_uninteresting_key(&t.key))
    }

    /// Whether the tags carry a work-in-progress marker
    pub fn has_work_in_progress_tags(&self) -> bool {
        self.snapshot()
            .iter()
            .any(|t| is_work_in_progress_key(&t.key))
    }

    /// Direction sensitivity of the tagged feature as `(has_direction, reversed)`
    pub fn direction(&self) -> (bool, bool) {
        let tags = self.snapshot();
        let mut has_direction = false;
        let mut reversed = false;
        for tag in tags.iter() {
            let key = tag.key.as_str();
            let value = tag.value.as_str();
            let directed = match key {
                "oneway" => value != "no" && value != "false" && value != "0",
                "direction" | "waterway" => true,
                "junction" => value == "roundabout",
                "natural" => value == "coastline" || value == "cliff",
                _ => key == "incline" || key.starts_with("incline:"),
            };
            has_direction |= directed;
            if key == "oneway" && value == "-1" {
                reversed = true;
            }
        }
        (has_direction, reversed)
    }

    /// Whether both stores hold the same interesting tags
    pub fn interesting_equals(&self, other: &TagStore) -> bool {
        self.interesting() == other.interesting()
    }
}

impl Default for TagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TagStore {
    fn clone(&self) -> Self {
        Self {
            tags: RwLock::new(self.snapshot()),
        }
    }
}

impl PartialEq for TagStore {
    fn eq(&self, other: &Self) -> bool {
        let a = self.snapshot();
        let b = other.snapshot();
        a.len() == b.len()
            && a.iter()
                .all(|t| b.iter().any(|o| o.key == t.key && o.value == t.value))
    }
}

impl Eq for TagStore {}

impl fmt::Debug for TagStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.snapshot().iter().map(|t| (&t.key, &t.value)))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        TagStore::from_pairs(iter)
    }
}
