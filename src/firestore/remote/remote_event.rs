use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::value::BytesValue;

/// Everything the watch stream delivered up to one consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose remote key mapping was reset after an existence filter
    /// mismatch, with the purpose to re-listen with.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Documents that were only referenced by limbo resolution targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    /// Event for a target that became current (or not) without any new
    /// documents, used when a listen is served entirely from the cache.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: BytesValue,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target delta carried by a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChange {
    /// Empty when the target did not advance.
    pub resume_token: BytesValue,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: BytesValue) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn document_count_delta(&self) -> i64 {
        self.added_documents.len() as i64 - self.removed_documents.len() as i64
    }
}
