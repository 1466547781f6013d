use std::collections::BTreeMap;

use crate::firestore::core::{ChangeType, Query, ViewSnapshot};
use crate::firestore::model::{Document, DocumentKey, FieldPath};
use crate::firestore::value::{FirestoreValue, MapValue};

/// Metadata about the state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    /// Whether the snapshot was served from the local cache without a
    /// confirmed backend sync.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Whether the snapshot contains writes not yet acknowledged.
    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    data: Option<MapValue>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn new(key: DocumentKey, data: Option<MapValue>, metadata: SnapshotMetadata) -> Self {
        Self {
            key,
            data,
            metadata,
        }
    }

    /// Snapshot of a cached document; missing and deleted documents have no
    /// data.
    pub fn from_document(document: &Document, from_cache: bool) -> Self {
        let data = document
            .is_found_document()
            .then(|| document.data().clone());
        Self::new(
            document.key().clone(),
            data,
            SnapshotMetadata::new(from_cache, document.has_local_mutations()),
        )
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&BTreeMap<String, FirestoreValue>> {
        self.data.as_ref().map(|map| map.fields())
    }

    pub fn get(&self, field: &FieldPath) -> Option<&FirestoreValue> {
        self.data.as_ref().and_then(|map| map.field(field))
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }
}

/// One entry of [`QuerySnapshot::doc_changes`].
#[derive(Clone, Debug)]
pub struct DocumentChange {
    pub change_type: ChangeType,
    pub document: DocumentSnapshot,
}

/// Result set of a query at one point in time.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    documents: Vec<DocumentSnapshot>,
    changes: Vec<DocumentChange>,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub fn from_view_snapshot(snapshot: &ViewSnapshot) -> Self {
        let from_cache = snapshot.from_cache;
        let documents = snapshot
            .documents
            .iter()
            .map(|doc| DocumentSnapshot::from_document(doc, from_cache))
            .collect();
        let changes = snapshot
            .document_changes
            .iter()
            .map(|change| DocumentChange {
                change_type: change.change_type,
                document: DocumentSnapshot::from_document(&change.document, from_cache),
            })
            .collect();
        Self {
            query: snapshot.query.clone(),
            documents,
            changes,
            metadata: SnapshotMetadata::new(from_cache, snapshot.has_pending_writes()),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Documents in query order.
    pub fn docs(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    pub fn doc_changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    pub fn size(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{MutableDocument, SnapshotVersion};

    #[test]
    fn metadata_flags() {
        let meta = SnapshotMetadata::new(true, false);
        assert!(meta.from_cache());
        assert!(!meta.has_pending_writes());
    }

    #[test]
    fn deleted_document_has_no_data() {
        let key = DocumentKey::from_string("cities/sf").unwrap();
        let doc = MutableDocument::new_no_document(key, SnapshotVersion::from_micros(3));
        let snapshot = DocumentSnapshot::from_document(&doc, false);
        assert!(!snapshot.exists());
        assert_eq!(snapshot.id(), "sf");
    }

    #[test]
    fn found_document_exposes_fields() {
        let key = DocumentKey::from_string("cities/sf").unwrap();
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_single("name"), FirestoreValue::from_string("SF"));
        let doc = MutableDocument::new_found_document(key, SnapshotVersion::from_micros(3), data);
        let snapshot = DocumentSnapshot::from_document(&doc, true);
        assert!(snapshot.exists());
        assert!(snapshot.from_cache());
        assert_eq!(
            snapshot.get(&FieldPath::from_single("name")),
            Some(&FirestoreValue::from_string("SF"))
        );
    }
}
