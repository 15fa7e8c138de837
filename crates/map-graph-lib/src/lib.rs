//! Map Graph Library - Core Data Structures for Editable Map Data
//!
//! This library provides the in-memory engine behind a map editor: a mutable graph of
//! nodes, ways and relations, indexed by an adaptive quadtree, guarded by a read/write
//! lock with transactional change notification, and able to merge two independently
//! edited datasets while reporting the differences it cannot reconcile as conflicts.
//!
//! # Architecture
//!
//! - **[`TagStore`]**: Copy-on-write key/value storage attached to every primitive
//! - **[`IdentityStore`]**: Open-addressing hash set with pluggable hash strategies
//! - **[`QuadBuckets`]**: Adaptive quadtree over bounding boxes
//! - **[`Primitive`]**: The node/way/relation model with flags, metadata and back-references
//! - **[`Dataset`]**: Transactional container owning indices, selection and listeners
//! - **[`DatasetMerger`]**: Three-way merge producing a [`ConflictCollection`]
//!
//! # Concurrency
//!
//! - **Reads**: any number of threads through [`Dataset::read`]
//! - **Writes**: serialized through [`Dataset::begin_update`]; events are delivered after
//!   the outermost transaction releases the lock

pub mod bbox;
mod config;
pub mod data;
pub mod dataset;
pub mod identity;
pub mod merge;
pub mod primitive;
mod quadtree;
pub mod tags;
pub mod user;
pub mod utils;

// Public API exports
pub use bbox::BBox;
pub use config::Config;
pub use data::PrimitiveData;
pub use dataset::{
    Dataset, DatasetContents, DatasetEvent, DatasetId, DatasetListener, DatasetReadGuard,
    SelectionChangeEvent, SelectionListener, Transaction,
};
pub use identity::{HashStrategy, IdentityStore};
pub use merge::{Conflict, ConflictCollection, DatasetMerger, MergeOutcome, MergeWarning};
pub use primitive::{
    IdGenerator, LatLon, Node, Primitive, PrimitiveFlags, PrimitiveId, PrimitiveKind, Relation,
    RelationMember, Way,
};
pub use quadtree::QuadBuckets;
pub use tags::TagStore;
pub use user::{User, UserRegistry};

/// Error types for the map data engine
///
/// Variants fall into two categories: precondition violations, raised when a caller asks
/// for something the current state does not allow, and data integrity problems, raised when
/// the graph handed to the engine is inconsistent. See
/// [`MapDataError::is_integrity_problem`].
#[derive(Debug, thiserror::Error)]
pub enum MapDataError {
    #[error("Primitive {0} already exists in the dataset")]
    DuplicatePrimitive(PrimitiveId),

    #[error("Primitive {0} is already part of a dataset")]
    AlreadyInDataset(PrimitiveId),

    #[error("Primitive {0} is not part of the dataset")]
    NotInDataset(PrimitiveId),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Invalid version {version} for primitive {id}")]
    InvalidVersion { id: PrimitiveId, version: u32 },

    #[error("Invalid changeset id {changeset_id} for primitive {id}")]
    InvalidChangesetId { id: PrimitiveId, changeset_id: u32 },

    #[error("Primitive {0} is new and cannot be invisible")]
    InvisibleNewPrimitive(PrimitiveId),

    #[error("Primitive {0} is incomplete")]
    IncompletePrimitive(PrimitiveId),

    #[error("Expected a {expected}, found {found}")]
    KindMismatch {
        expected: PrimitiveKind,
        found: PrimitiveId,
    },

    #[error("Index {index} out of bounds for {id} with {len} entries")]
    IndexOutOfBounds {
        id: PrimitiveId,
        index: usize,
        len: usize,
    },

    #[error("Dataset is read-only")]
    ReadOnly,

    #[error("Cannot merge a dataset into itself")]
    SelfMerge,

    #[error("Data integrity problem: {0}")]
    DataIntegrity(String),

    #[error("Missing merge target for {0}")]
    MissingMergeTarget(PrimitiveId),
}

impl MapDataError {
    /// Whether this error reports an inconsistent graph rather than a misuse of the API
    pub fn is_integrity_problem(&self) -> bool {
        matches!(
            self,
            MapDataError::DataIntegrity(_) | MapDataError::MissingMergeTarget(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MapDataError>;
