mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_index::{
    FieldIndex, IndexKind, IndexOffset, IndexSegment, INITIAL_LARGEST_BATCH_ID,
};
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath, DOCUMENT_KEY_NAME};
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldTransform, Mutation, MutationResult, Precondition,
    TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, OverlayedDocument};
pub use overlay::Overlay;
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

/// Target ids are assigned by the client; even for queries, odd for limbo
/// resolutions.
pub type TargetId = i32;
pub type BatchId = i32;
/// Monotonic counter used by LRU garbage collection to order accesses.
pub type ListenSequenceNumber = i64;
