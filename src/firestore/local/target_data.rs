use crate::firestore::core::Target;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::firestore::value::BytesValue;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A regular, user-initiated listen.
    Listen,
    /// Re-listen after an existence filter mismatch without a usable bloom
    /// filter.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter could not resolve the mismatch.
    ExistenceFilterMismatchBloom,
    /// Single document target that resolves a limbo document.
    LimboResolution,
}

/// Everything the client remembers about a target between listens.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    /// Last listen sequence number at which the target was in use.
    pub sequence_number: ListenSequenceNumber,
    /// Version of the latest snapshot the backend sent for this target.
    pub snapshot_version: SnapshotVersion,
    /// Latest version at which the target's view had no limbo documents.
    /// Results up to this version can be reused by the query engine.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque token to resume the target from `snapshot_version`. Empty when
    /// the target has to be listened to from scratch.
    pub resume_token: BytesValue,
    /// Number of documents the client believes match, sent along with a
    /// resume token so the backend can detect missed removals.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: BytesValue::default(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// Copy with a new resume token. The expected count is dropped since it
    /// only applies to the token it was sent with.
    pub fn with_resume_token(&self, resume_token: BytesValue, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}
