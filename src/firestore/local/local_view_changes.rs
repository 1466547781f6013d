use std::collections::BTreeSet;

use crate::firestore::core::{ChangeType, ViewSnapshot};
use crate::firestore::model::{DocumentKey, TargetId};

/// Documents a view started or stopped showing. The local store pins the
/// added ones so garbage collection leaves them alone while they are
/// visible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = BTreeSet::new();
        let mut removed_keys = BTreeSet::new();
        for change in &snapshot.document_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.document.key().clone());
                }
                _ => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}
