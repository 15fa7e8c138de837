use super::{IdGenerator, PrimitiveCommon, PrimitiveId, PrimitiveKind};
use crate::{BBox, Result};
use std::ops::{Deref, DerefMut};

/// An ordered list of nodes
///
/// Nodes are referenced by id and resolved through the owning dataset. The bounding box is
/// maintained by the dataset whenever the node list or a node position changes.
#[derive(Debug, Clone)]
pub struct Way {
    pub(crate) common: PrimitiveCommon,
    nodes: Vec<i64>,
    bbox: BBox,
}

impl Way {
    /// A new local way with an id from `ids`
    pub fn new_local(ids: &IdGenerator) -> Self {
        Self::from_common(PrimitiveCommon::new_local(PrimitiveKind::Way, ids))
    }

    /// A way with a given id; a positive id with version 0 is incomplete
    pub fn with_id(id: i64, version: u32) -> Result<Self> {
        Ok(Self::from_common(PrimitiveCommon::new(
            PrimitiveKind::Way,
            id,
            version,
        )?))
    }

    pub(crate) fn from_common(common: PrimitiveCommon) -> Self {
        Self {
            common,
            nodes: Vec::new(),
            bbox: BBox::empty(),
        }
    }

    /// Builder: set the node list, which also makes the way complete
    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = i64>) -> Self {
        self.nodes = nodes.into_iter().collect();
        self.common.set_incomplete(false);
        self
    }

    /// Builder: set a tag
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.common.put(key, Some(value));
        self
    }

    /// Node ids in order; a node may appear more than once
    #[inline]
    pub fn nodes(&self) -> &[i64] {
        &self.nodes
    }

    /// Node ids as primitive ids
    pub fn node_ids(&self) -> impl Iterator<Item = PrimitiveId> + '_ {
        self.nodes.iter().map(|&id| PrimitiveId::node(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn first_node(&self) -> Option<i64> {
        self.nodes.first().copied()
    }

    pub fn last_node(&self) -> Option<i64> {
        self.nodes.last().copied()
    }

    pub fn contains_node(&self, node: i64) -> bool {
        self.nodes.contains(&node)
    }

    /// Whether the way forms a ring: at least 3 nodes and the first equals the last
    pub fn is_closed(&self) -> bool {
        self.nodes.len() >= 3 && self.nodes.first() == self.nodes.last()
    }

    pub fn is_first_last_node(&self, node: i64) -> bool {
        self.first_node() == Some(node) || self.last_node() == Some(node)
    }

    /// Whether `node` occurs at a position other than the ends
    pub fn is_inner_node(&self, node: i64) -> bool {
        let n = self.nodes.len();
        n > 2 && self.nodes[1..n - 1].contains(&node)
    }

    /// Consecutive node pairs, one per segment
    pub fn node_pairs(&self) -> Vec<(i64, i64)> {
        self.nodes.windows(2).map(|w| (w[0], w[1])).collect()
    }

    /// The node list with every occurrence of `node` removed
    ///
    /// A closed way stays closed if it keeps more than 2 nodes; consecutive duplicates
    /// left behind by the removal are collapsed.
    pub fn nodes_without(&self, node: i64) -> Vec<i64> {
        let closed = self.first_node() == Some(node) && self.last_node() == Some(node);
        let mut nodes: Vec<i64> = self.nodes.iter().copied().filter(|&n| n != node).collect();
        let n = nodes.len();
        if closed && n > 2 {
            nodes.push(nodes[0]);
        } else if (2..=3).contains(&n) && nodes[0] == nodes[n - 1] {
            nodes.pop();
        }
        nodes.dedup();
        nodes
    }

    /// Replace the node list; the bounding box is stale until recomputed
    pub fn set_nodes(&mut self, nodes: Vec<i64>) {
        self.nodes = nodes;
    }

    #[inline]
    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    pub(crate) fn set_bbox(&mut self, bbox: BBox) {
        self.bbox = bbox;
    }
}

impl Deref for Way {
    type Target = PrimitiveCommon;

    fn deref(&self) -> &PrimitiveCommon {
        &self.common
    }
}

impl DerefMut for Way {
    fn deref_mut(&mut self) -> &mut PrimitiveCommon {
        &mut self.common
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_way() {
        let way = Way::with_id(1, 1).unwrap().with_nodes([1, 2, 3, 1]);
        assert!(way.is_closed());
        assert!(way.is_first_last_node(1));
        assert!(way.is_inner_node(2));
        assert!(!way.is_inner_node(1));

        // Two nodes going back and forth do not form a ring
        let degenerate = Way::with_id(2, 1).unwrap().with_nodes([1, 1]);
        assert!(!degenerate.is_closed());
    }

    #[test]
    fn test_nodes_without() {
        let way = Way::with_id(1, 1).unwrap().with_nodes([1, 2, 3]);
        assert_eq!(way.nodes_without(2), vec![1, 3]);

        let ring = Way::with_id(2, 1).unwrap().with_nodes([1, 2, 3, 4, 1]);
        assert_eq!(ring.nodes_without(1), vec![2, 3, 4, 2]);

        let spike = Way::with_id(3, 1).unwrap().with_nodes([1, 2, 1, 3]);
        assert_eq!(spike.nodes_without(2), vec![1, 3]);
    }

    #[test]
    fn test_node_pairs() {
        let way = Way::with_id(1, 1).unwrap().with_nodes([1, 2, 3]);
        assert_eq!(way.node_pairs(), vec![(1, 2), (2, 3)]);
        assert_eq!(way.node_ids().collect::<Vec<_>>()[0], PrimitiveId::node(1));
    }
}
