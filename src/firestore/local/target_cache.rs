use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::core::{Target, TargetIdGenerator};
use crate::firestore::local::{ReferenceSet, TargetData};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::util::hard_assert;

/// Cached targets and the document keys the backend reported for each.
pub trait TargetCache {
    fn allocate_target_id(&mut self) -> TargetId;

    /// Version of the most recent consistent snapshot applied to the cache.
    fn get_last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn get_highest_sequence_number(&self) -> ListenSequenceNumber;

    fn set_targets_metadata(
        &mut self,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    );

    fn add_target_data(&mut self, target_data: TargetData);

    fn update_target_data(&mut self, target_data: TargetData);

    fn remove_target_data(&mut self, target_data: &TargetData);

    /// Removes every inactive target whose sequence number is at most
    /// `upper_bound`. Returns the number of targets removed and the keys
    /// they referenced.
    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> (usize, Vec<DocumentKey>);

    fn get_target_count(&self) -> usize;

    fn targets(&self) -> Vec<TargetData>;

    fn get_target_data(&self, target: &Target) -> Option<TargetData>;

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> Vec<DocumentKey>;

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn contains_key(&self, key: &DocumentKey) -> bool;
}

#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    targets: Arc<BTreeMap<String, TargetData>>,
    references: ReferenceSet,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
    target_id_generator: TargetIdGenerator,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self {
            targets: Arc::default(),
            references: ReferenceSet::new(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            last_remote_snapshot_version: SnapshotVersion::min(),
            target_id_generator: TargetIdGenerator::for_target_cache(0),
        }
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        if target_data.target_id > self.highest_target_id {
            self.target_id_generator = TargetIdGenerator::for_target_cache(target_data.target_id);
            self.highest_target_id = target_data.target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        Arc::make_mut(&mut self.targets).insert(target_data.target.canonical_id(), target_data);
    }
}

impl TargetCache for MemoryTargetCache {
    fn allocate_target_id(&mut self) -> TargetId {
        self.highest_target_id = self.target_id_generator.next_id();
        self.highest_target_id
    }

    fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    fn get_highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    fn set_targets_metadata(
        &mut self,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) {
        if let Some(version) = last_remote_snapshot_version {
            self.last_remote_snapshot_version = version;
        }
        if highest_listen_sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = highest_listen_sequence_number;
        }
    }

    fn add_target_data(&mut self, target_data: TargetData) {
        let canonical_id = target_data.target.canonical_id();
        hard_assert(
            !self.targets.contains_key(&canonical_id),
            "Adding a target that already exists",
        );
        self.save_target_data(target_data);
    }

    fn update_target_data(&mut self, target_data: TargetData) {
        hard_assert(
            self.targets.contains_key(&target_data.target.canonical_id()),
            "Updating a nonexistent target",
        );
        self.save_target_data(target_data);
    }

    fn remove_target_data(&mut self, target_data: &TargetData) {
        let canonical_id = target_data.target.canonical_id();
        hard_assert(
            self.targets.contains_key(&canonical_id),
            "Removing a nonexistent target",
        );
        Arc::make_mut(&mut self.targets).remove(&canonical_id);
        self.references
            .remove_references_for_id(target_data.target_id);
    }

    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> (usize, Vec<DocumentKey>) {
        let doomed: Vec<(String, TargetId)> = self
            .targets
            .iter()
            .filter(|(_, data)| {
                data.sequence_number <= upper_bound
                    && !active_target_ids.contains(&data.target_id)
            })
            .map(|(id, data)| (id.clone(), data.target_id))
            .collect();
        let mut orphaned = Vec::new();
        for (canonical_id, target_id) in &doomed {
            Arc::make_mut(&mut self.targets).remove(canonical_id);
            orphaned.extend(self.references.remove_references_for_id(*target_id));
        }
        (doomed.len(), orphaned)
    }

    fn get_target_count(&self) -> usize {
        self.targets.len()
    }

    fn targets(&self) -> Vec<TargetData> {
        self.targets.values().cloned().collect()
    }

    fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.targets.get(&target.canonical_id()).cloned()
    }

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.references.add_references(keys, target_id);
    }

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.references.remove_references(keys, target_id);
    }

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> Vec<DocumentKey> {
        self.references.remove_references_for_id(target_id)
    }

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.references.references_for_id(target_id)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}
