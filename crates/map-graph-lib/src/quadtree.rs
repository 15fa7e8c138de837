//! Adaptive quadtree over bounding boxes
//!
//! [`QuadBuckets`] indexes keys by the bounding box they cover. The root tile spans the
//! whole WGS84 world; leaves split into four children once they hold more than the
//! configured number of entries. An entry is stored in the deepest tile that fully bounds
//! its box, so boxes that straddle a child boundary (and empty boxes) stay at an inner tile.
//!
//! Tiles are never merged back after removals.

use crate::{BBox, Config};
use parking_lot::Mutex;
use std::fmt;

/// Path from the root to the tile that bounded the previous query
#[derive(Debug, Clone)]
struct SearchCache {
    /// Child index taken at each level
    path: Vec<u8>,
    tile: BBox,
}

/// Spatial index of keys by bounding box
pub struct QuadBuckets<K> {
    root: QuadNode<K>,
    /// Total number of entries across all tiles
    len: usize,
    max_objects_per_leaf: usize,
    max_depth: u32,
    /// Reused by consecutive searches in the same area
    search_cache: Mutex<Option<SearchCache>>,
}

/// A single tile of the quadtree
#[derive(Debug, Clone)]
struct QuadNode<K> {
    /// Area covered by this tile
    bounds: BBox,
    /// Depth level in the tree (0 = root)
    level: u32,
    /// Entries stored at this tile
    entries: Vec<(K, BBox)>,
    /// Child tiles (NW, NE, SW, SE) if subdivided
    children: Option<Box<[QuadNode<K>; 4]>>,
}

impl<K: Clone + PartialEq> QuadBuckets<K> {
    /// Create an empty index with the default leaf capacity and depth
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    /// Create an empty index using the tuning of `config`
    pub fn with_config(config: &Config) -> Self {
        Self {
            root: QuadNode::new_root(),
            len: 0,
            max_objects_per_leaf: config.max_objects_per_leaf.max(1),
            max_depth: config.max_depth,
            search_cache: Mutex::new(None),
        }
    }
}

impl<K: Clone + PartialEq> Default for QuadBuckets<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<K: Clone + PartialEq> QuadBuckets<K> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index `key` under `bbox`
    ///
    /// The caller is responsible for not adding the same key twice; removal must later use
    /// the same box.
    pub fn add(&mut self, key: K, bbox: BBox) {
        let max_objects = self.max_objects_per_leaf;
        let max_depth = self.max_depth;
        self.root.insert(key, bbox, max_objects, max_depth);
        self.len += 1;
    }

    /// Remove `key`, looking it up along the path of `bbox`
    ///
    /// Returns whether the key was found.
    pub fn remove(&mut self, key: &K, bbox: &BBox) -> bool {
        let removed = self.root.remove(key, bbox);
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Whether `key` is indexed under `bbox`
    pub fn contains(&self, key: &K, bbox: &BBox) -> bool {
        let mut node = &self.root;
        loop {
            if node.entries.iter().any(|(k, _)| k == key) {
                return true;
            }
            match node.child_bounding(bbox) {
                Some(index) => match &node.children {
                    Some(children) => node = &children[index],
                    None => return false,
                },
                None => return false,
            }
        }
    }

    /// All keys whose box intersects `bbox`
    pub fn search(&self, bbox: &BBox) -> Vec<K> {
        #[cfg(feature = "profiling")]
        profiling::scope!("quadtree::search");

        let mut results = Vec::new();
        if bbox.is_empty() {
            return results;
        }
        if !BBox::world().intersects(bbox) {
            tracing::warn!(?bbox, "Search area lies outside the world tile");
        }

        // Start from the cached tile when it still bounds the query; the lock is only held
        // while reading and storing the path so concurrent searches do not serialize
        let mut path = match self.search_cache.lock().as_ref() {
            Some(cached) if cached.tile.bounds(bbox) => cached.path.clone(),
            _ => Vec::new(),
        };

        // Ancestors of the start tile may hold straddling entries that intersect the query
        let mut node = &self.root;
        for &step in &path {
            node.collect_local(bbox, &mut results);
            match &node.children {
                Some(children) => node = &children[step as usize],
                None => break,
            }
        }

        // Narrow down further if the tree has grown below the cached tile
        while let Some(index) = node.child_bounding(bbox) {
            let Some(children) = &node.children else {
                break;
            };
            node.collect_local(bbox, &mut results);
            path.push(index as u8);
            node = &children[index];
        }

        node.collect_subtree(bbox, &mut results);

        *self.search_cache.lock() = Some(SearchCache {
            tile: node.bounds,
            path,
        });
        results
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.root = QuadNode::new_root();
        self.len = 0;
        *self.search_cache.get_mut() = None;
    }

    /// Iterate all keys in tree order
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            stack: vec![&self.root],
            current: [].iter(),
        }
    }

    /// Iterate all keys together with the box they were indexed under
    pub fn entries(&self) -> impl Iterator<Item = (&K, &BBox)> + '_ {
        let mut nodes = vec![&self.root];
        let mut all = Vec::with_capacity(self.len);
        while let Some(node) = nodes.pop() {
            all.extend(node.entries.iter().map(|(k, b)| (k, b)));
            if let Some(children) = &node.children {
                nodes.extend(children.iter());
            }
        }
        all.into_iter()
    }
}

impl<K> QuadNode<K> {
    /// Create a root tile covering the whole world
    fn new_root() -> Self {
        Self::new_child(BBox::world(), 0)
    }

    fn new_child(bounds: BBox, level: u32) -> Self {
        Self {
            bounds,
            level,
            entries: Vec::new(),
            children: None,
        }
    }

    /// Index of the child tile that would fully bound `bbox`
    fn child_bounding(&self, bbox: &BBox) -> Option<usize> {
        let (min, max) = (bbox.min()?, bbox.max()?);
        let tile_min = self.bounds.min()?;
        let tile_max = self.bounds.max()?;
        let mid_x = (tile_min.x + tile_max.x) / 2.0;
        let mid_y = (tile_min.y + tile_max.y) / 2.0;

        if !self.bounds.bounds(bbox) {
            return None;
        }

        let west = max.x <= mid_x;
        let east = min.x >= mid_x;
        let north = min.y >= mid_y;
        let south = max.y <= mid_y;

        match (west, east, north, south) {
            (true, _, true, _) => Some(0),
            (_, true, true, _) => Some(1),
            (true, _, _, true) => Some(2),
            (_, true, _, true) => Some(3),
            _ => None,
        }
    }

    /// Subdivide this tile into 4 children
    fn subdivide(&mut self) {
        if self.children.is_some() {
            return;
        }
        let (Some(min), Some(max)) = (self.bounds.min(), self.bounds.max()) else {
            return;
        };
        let mid_x = (min.x + max.x) / 2.0;
        let mid_y = (min.y + max.y) / 2.0;
        let level = self.level + 1;

        // NW, NE, SW, SE
        let nw = QuadNode::new_child(BBox::new(min.x, mid_y, mid_x, max.y), level);
        let ne = QuadNode::new_child(BBox::new(mid_x, mid_y, max.x, max.y), level);
        let sw = QuadNode::new_child(BBox::new(min.x, min.y, mid_x, mid_y), level);
        let se = QuadNode::new_child(BBox::new(mid_x, min.y, max.x, mid_y), level);

        self.children = Some(Box::new([nw, ne, sw, se]));
    }

    fn insert(&mut self, key: K, bbox: BBox, max_objects: usize, max_depth: u32) {
        if let Some(index) = self.child_bounding(&bbox) {
            if let Some(children) = &mut self.children {
                children[index].insert(key, bbox, max_objects, max_depth);
                return;
            }
        }

        self.entries.push((key, bbox));

        if self.children.is_none() && self.entries.len() > max_objects && self.level < max_depth
        {
            self.split(max_objects, max_depth);
        }
    }

    /// Split a full leaf and push down every entry that fits into a child
    fn split(&mut self, max_objects: usize, max_depth: u32) {
        tracing::trace!(
            level = self.level,
            entries = self.entries.len(),
            "Splitting quadtree tile"
        );
        self.subdivide();

        let entries = std::mem::take(&mut self.entries);
        for (key, bbox) in entries {
            match (self.child_bounding(&bbox), &mut self.children) {
                (Some(index), Some(children)) => {
                    children[index].insert(key, bbox, max_objects, max_depth)
                }
                _ => self.entries.push((key, bbox)),
            }
        }
    }

    fn remove(&mut self, key: &K, bbox: &BBox) -> bool
    where
        K: PartialEq,
    {
        if let Some(pos) = self.entries.iter().position(|(k, _)| k == key) {
            self.entries.swap_remove(pos);
            return true;
        }
        match (self.child_bounding(bbox), &mut self.children) {
            (Some(index), Some(children)) => children[index].remove(key, bbox),
            _ => false,
        }
    }

    /// Entries of this tile only that intersect `bbox`
    fn collect_local(&self, bbox: &BBox, results: &mut Vec<K>)
    where
        K: Clone,
    {
        results.extend(
            self.entries
                .iter()
                .filter(|(_, b)| b.intersects(bbox))
                .map(|(k, _)| k.clone()),
        );
    }

    /// Entries of this tile and all descendants that intersect `bbox`
    fn collect_subtree(&self, bbox: &BBox, results: &mut Vec<K>)
    where
        K: Clone,
    {
        self.collect_local(bbox, results);
        if let Some(children) = &self.children {
            for child in children.iter() {
                if child.bounds.intersects(bbox) {
                    child.collect_subtree(bbox, results);
                }
            }
        }
    }
}

/// Iterator over the keys of a [`QuadBuckets`]
pub struct Iter<'a, K> {
    stack: Vec<&'a QuadNode<K>>,
    current: std::slice::Iter<'a, (K, BBox)>,
}

impl<'a, K> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, _)) = self.current.next() {
                return Some(key);
            }
            let node = self.stack.pop()?;
            if let Some(children) = &node.children {
                self.stack.extend(children.iter());
            }
            self.current = node.entries.iter();
        }
    }
}

impl<K: Clone> Clone for QuadBuckets<K> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
            max_objects_per_leaf: self.max_objects_per_leaf,
            max_depth: self.max_depth,
            search_cache: Mutex::new(None),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for QuadBuckets<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuadBuckets")
            .field("len", &self.len)
            .field("max_objects_per_leaf", &self.max_objects_per_leaf)
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}
