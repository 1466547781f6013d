use std::cmp::Ordering;

use crate::firestore::model::{BatchId, DocumentKey, FieldPath, MutableDocument, SnapshotVersion};

/// Sentinel for "no batch".
pub const INITIAL_LARGEST_BATCH_ID: BatchId = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Ascending,
    Descending,
    /// Indexes every element of an array field for `array-contains` lookups.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexSegment {
    pub field: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field: FieldPath, kind: IndexKind) -> Self {
        Self { field, kind }
    }
}

/// A client-side field index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn new(index_id: i32, collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id,
            collection_group: collection_group.into(),
            segments,
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> + '_ {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::Contains)
    }

    /// Indexes with the same collection group and segments describe the same
    /// index regardless of id.
    pub fn same_shape(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}

/// Position in the remote document cache up to which an index (or a previous
/// query result) is known to be complete. Documents and overlays after the
/// offset have to be read separately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: Option<DocumentKey>,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    pub fn new(
        read_time: SnapshotVersion,
        document_key: Option<DocumentKey>,
        largest_batch_id: BatchId,
    ) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    /// Offset that sorts before every document.
    pub fn none() -> Self {
        Self::new(SnapshotVersion::min(), None, INITIAL_LARGEST_BATCH_ID)
    }

    /// Offset of one cached document.
    pub fn from_document(doc: &MutableDocument) -> Self {
        Self::new(
            doc.read_time(),
            Some(doc.key().clone()),
            INITIAL_LARGEST_BATCH_ID,
        )
    }

    /// Offset that sorts after every document read at `read_time`.
    pub fn successor_of(read_time: SnapshotVersion, largest_batch_id: BatchId) -> Self {
        Self::new(read_time.successor(), None, largest_batch_id)
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}
