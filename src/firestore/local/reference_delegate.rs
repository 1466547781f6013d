use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::local::ReferenceSet;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, TargetId};

/// Tracks when documents stop being referenced so the LRU garbage collector
/// can tell which ones are safe to evict.
pub trait ReferenceDelegate {
    /// A target started referencing `key`.
    fn add_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber);

    /// A target stopped referencing `key`.
    fn remove_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber);

    /// An acknowledged or rejected batch released `key`.
    fn remove_mutation_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber);

    /// A limbo resolution touched `key`.
    fn update_limbo_document(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber);

    /// The document was evicted or deleted from the cache.
    fn forget_document(&mut self, key: &DocumentKey);

    /// Sequence number at which `key` was last released, if any.
    fn orphaned_sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber>;

    fn orphaned_document_count(&self) -> usize;

    fn orphaned_sequence_numbers(&self) -> Vec<ListenSequenceNumber>;

    /// Pins `keys` for as long as the view of `target_id` shows them.
    fn add_in_memory_pins(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn remove_in_memory_pins(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    /// Drops every pin of `target_id` and returns the keys it pinned.
    fn remove_in_memory_pins_for_target(&mut self, target_id: TargetId) -> Vec<DocumentKey>;

    fn is_pinned_in_memory(&self, key: &DocumentKey) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryLruDelegate {
    orphaned_documents: Arc<BTreeMap<DocumentKey, ListenSequenceNumber>>,
    in_memory_pins: ReferenceSet,
}

impl MemoryLruDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        Arc::make_mut(&mut self.orphaned_documents).insert(key.clone(), sequence_number);
    }
}

impl ReferenceDelegate for MemoryLruDelegate {
    fn add_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.mark(key, sequence_number);
    }

    fn remove_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.mark(key, sequence_number);
    }

    fn remove_mutation_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.mark(key, sequence_number);
    }

    fn update_limbo_document(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.mark(key, sequence_number);
    }

    fn forget_document(&mut self, key: &DocumentKey) {
        if self.orphaned_documents.contains_key(key) {
            Arc::make_mut(&mut self.orphaned_documents).remove(key);
        }
    }

    fn orphaned_sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber> {
        self.orphaned_documents.get(key).copied()
    }

    fn orphaned_document_count(&self) -> usize {
        self.orphaned_documents.len()
    }

    fn orphaned_sequence_numbers(&self) -> Vec<ListenSequenceNumber> {
        self.orphaned_documents.values().copied().collect()
    }

    fn add_in_memory_pins(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.in_memory_pins.add_references(keys, target_id);
    }

    fn remove_in_memory_pins(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.in_memory_pins.remove_references(keys, target_id);
    }

    fn remove_in_memory_pins_for_target(&mut self, target_id: TargetId) -> Vec<DocumentKey> {
        self.in_memory_pins.remove_references_for_id(target_id)
    }

    fn is_pinned_in_memory(&self, key: &DocumentKey) -> bool {
        self.in_memory_pins.contains_key(key)
    }
}
