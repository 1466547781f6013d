use std::fmt::{Display, Formatter};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentType {
    /// No information about the document is known, not even whether it exists.
    Invalid,
    FoundDocument,
    /// The backend confirmed the document does not exist.
    NoDocument,
    /// The document exists but its contents are unknown, e.g. after a patch
    /// was acknowledged without a base document.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as held by the cache, mutable so that mutations can be applied
/// in place.
///
/// Invariant: a document carrying local mutations reports
/// `SnapshotVersion::min()` as its version until the write is acknowledged.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

pub type Document = MutableDocument;

impl MutableDocument {
    fn with_type(key: DocumentKey, document_type: DocumentType) -> Self {
        Self {
            key,
            document_type,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    /// Placeholder for a key the cache has no information about.
    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self::with_type(key, DocumentType::Invalid)
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut doc = Self::new_invalid_document(key);
        doc.convert_to_found_document(version, data);
        doc
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid_document(key);
        doc.convert_to_no_document(version);
        doc
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid_document(key);
        doc.convert_to_unknown_document(version);
        doc
    }

    pub fn convert_to_found_document(
        &mut self,
        version: SnapshotVersion,
        data: MapValue,
    ) -> &mut Self {
        if self.create_time.is_min()
            && matches!(
                self.document_type,
                DocumentType::NoDocument | DocumentType::Invalid
            )
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    /// Compares everything except the pending-write flags; used by views to
    /// tell data changes apart from metadata-only changes.
    pub fn has_same_contents(&self, other: &Self) -> bool {
        self.key == other.key
            && self.document_type == other.document_type
            && self.version == other.version
            && self.data == other.data
    }
}

impl Display for MutableDocument {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Document({}, {:?}, {}, local={}, committed={})",
            self.key,
            self.document_type,
            self.version,
            self.has_local_mutations(),
            self.has_committed_mutations()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    #[test]
    fn local_mutations_reset_version() {
        let mut doc =
            MutableDocument::new_found_document(key(), SnapshotVersion::from_micros(5), MapValue::empty());
        assert_eq!(doc.version(), SnapshotVersion::from_micros(5));
        doc.set_has_local_mutations();
        assert!(doc.has_local_mutations());
        assert!(doc.version().is_min());
    }

    #[test]
    fn conversions_switch_types() {
        let mut doc = MutableDocument::new_invalid_document(key());
        assert!(!doc.is_valid_document());
        doc.convert_to_no_document(SnapshotVersion::from_micros(1));
        assert!(doc.is_no_document());
        doc.convert_to_unknown_document(SnapshotVersion::from_micros(2));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
    }
}
