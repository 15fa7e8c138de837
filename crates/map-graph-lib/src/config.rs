//! Configuration shared by a dataset, its spatial indices and the merger

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for a dataset
///
/// Defaults: 16 objects per quadtree leaf, 24 levels of subdivision and up to 30
/// individually delivered events per transaction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Number of entries a quadtree leaf holds before it is split into 4 children.
    /// Default: 16
    pub max_objects_per_leaf: usize,
    /// Maximum depth of the quadtree. Leaves at this depth are never split and may grow
    /// beyond `max_objects_per_leaf` (e.g. many nodes at the same coordinate).
    /// Default: 24
    pub max_depth: u32,
    /// Transactions queuing more events than this deliver a single coalesced
    /// [`DatasetEvent::DataChanged`](crate::DatasetEvent::DataChanged) instead.
    /// Default: 30
    pub max_single_events: usize,
    /// Tolerance in degrees under which two coordinates are considered equal when
    /// comparing primitives semantically.
    /// Default: 1e-7 (the precision of the remote server)
    pub coordinate_epsilon: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_objects_per_leaf: 16,
            max_depth: 24,
            max_single_events: 30,
            coordinate_epsilon: 1e-7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_objects_per_leaf, 16);
        assert_eq!(config.max_depth, 24);
        assert_eq!(config.max_single_events, 30);
        assert!(config.coordinate_epsilon > 0.0);
    }
}
