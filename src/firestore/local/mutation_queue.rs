use std::collections::BTreeSet;

use crate::firestore::core::Query;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp};
use crate::util::hard_assert;

/// Batch id reported when the queue holds no unacknowledged batch.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Ordered queue of one user's unacknowledged mutation batches.
pub trait MutationQueue {
    fn check_empty(&self) -> bool;

    /// Appends a batch; ids increase monotonically.
    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch;

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// First batch with an id greater than `batch_id`.
    fn get_next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch>;

    fn get_highest_unacknowledged_batch_id(&self) -> BatchId;

    fn get_all_mutation_batches(&self) -> Vec<MutationBatch>;

    fn get_all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch>;

    /// Batches touching any of `keys`, in batch id order.
    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch>;

    fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch>;

    /// Removes `batch`, which must be the oldest batch in the queue.
    fn remove_mutation_batch(&mut self, batch: &MutationBatch);

    fn perform_consistency_check(&self);

    fn contains_key(&self, key: &DocumentKey) -> bool;
}

#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    /// `(key, batch_id)` for every mutation in the queue.
    batches_by_key: BTreeSet<(DocumentKey, BatchId)>,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            batches_by_key: BTreeSet::new(),
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of `batch_id` in the queue. Ids are contiguous from the
    /// head since batches are only ever removed from the front. The result
    /// may be out of range.
    fn index_of_batch_id(&self, batch_id: BatchId) -> Option<usize> {
        let first = self.queue.first()?.batch_id;
        let index = batch_id - first;
        if index < 0 {
            None
        } else {
            Some(index as usize)
        }
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> Vec<BatchId> {
        self.batches_by_key
            .range((key.clone(), BatchId::MIN)..)
            .take_while(|(entry, _)| entry == key)
            .map(|(_, batch_id)| *batch_id)
            .collect()
    }

    fn batches_for_ids(&self, ids: BTreeSet<BatchId>) -> Vec<MutationBatch> {
        ids.into_iter()
            .filter_map(|id| self.lookup_mutation_batch(id))
            .collect()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn check_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        if let Some(previous) = self.queue.last() {
            hard_assert(
                previous.batch_id < batch_id,
                "Mutation batch ids must be monotonically increasing",
            );
        }
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            self.batches_by_key
                .insert((mutation.key().clone(), batch_id));
        }
        self.queue.push(batch.clone());
        batch
    }

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        let index = self.index_of_batch_id(batch_id)?;
        let batch = self.queue.get(index)?;
        hard_assert(batch.batch_id == batch_id, "If found batch must match");
        Some(batch.clone())
    }

    fn get_next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        let index = self.index_of_batch_id(batch_id + 1).unwrap_or(0);
        self.queue.get(index).cloned()
    }

    fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.queue
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    fn get_all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.queue.clone()
    }

    fn get_all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.batches_for_ids(self.batch_ids_for_key(key).into_iter().collect())
    }

    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch> {
        let ids: BTreeSet<BatchId> = keys
            .iter()
            .flat_map(|key| self.batch_ids_for_key(key))
            .collect();
        self.batches_for_ids(ids)
    }

    fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let prefix = query.path();
        if DocumentKey::is_document_key(prefix) {
            return DocumentKey::from_path(prefix.clone())
                .map(|key| self.get_all_mutation_batches_affecting_document_key(&key))
                .unwrap_or_default();
        }

        let immediate_children_length = prefix.len() + 1;
        let mut ids = BTreeSet::new();
        let start = DocumentKey::range_start(prefix);
        for (key, batch_id) in self.batches_by_key.range((start, BatchId::MIN)..) {
            let row_path = key.path();
            if !prefix.is_prefix_of(row_path) {
                break;
            }
            // Rows under subcollections are skipped.
            if row_path.len() == immediate_children_length {
                ids.insert(*batch_id);
            }
        }
        self.batches_for_ids(ids)
    }

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) {
        hard_assert(
            self.index_of_batch_id(batch.batch_id) == Some(0),
            "Can only remove the first entry of the mutation queue",
        );
        self.queue.remove(0);
        for mutation in &batch.mutations {
            self.batches_by_key
                .remove(&(mutation.key().clone(), batch.batch_id));
        }
    }

    fn perform_consistency_check(&self) {
        if self.queue.is_empty() {
            hard_assert(
                self.batches_by_key.is_empty(),
                "Document leak -- detected dangling mutation references when queue is empty.",
            );
        }
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_key
            .range((key.clone(), BatchId::MIN)..)
            .next()
            .map(|(entry, _)| entry == key)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldMask, FieldPath};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set(path: &str) -> Mutation {
        Mutation::set(key(path), MapValue::empty())
    }

    #[test]
    fn batch_ids_start_at_one_and_increase() {
        let mut queue = MemoryMutationQueue::new();
        assert!(queue.check_empty());
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);

        let first = queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/a")]);
        let second = queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/b")]);
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), 2);
        assert_eq!(
            queue
                .get_next_mutation_batch_after_batch_id(BATCH_ID_UNKNOWN)
                .map(|b| b.batch_id),
            Some(1)
        );
        assert_eq!(
            queue.get_next_mutation_batch_after_batch_id(1).map(|b| b.batch_id),
            Some(2)
        );
        assert!(queue.get_next_mutation_batch_after_batch_id(2).is_none());
    }

    #[test]
    fn finds_batches_by_key_and_query() {
        let mut queue = MemoryMutationQueue::new();
        queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("rooms/a")]);
        queue.add_mutation_batch(
            Timestamp::now(),
            Vec::new(),
            vec![set("rooms/a/messages/1"), set("users/x")],
        );
        queue.add_mutation_batch(
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::patch(
                key("rooms/b"),
                MapValue::empty(),
                FieldMask::new([FieldPath::from_single("n")]),
            )],
        );

        let for_a = queue.get_all_mutation_batches_affecting_document_key(&key("rooms/a"));
        assert_eq!(for_a.iter().map(|b| b.batch_id).collect::<Vec<_>>(), vec![1]);

        let rooms =
            queue.get_all_mutation_batches_affecting_query(&Query::collection("rooms").unwrap());
        assert_eq!(rooms.iter().map(|b| b.batch_id).collect::<Vec<_>>(), vec![1, 3]);

        let many = queue.get_all_mutation_batches_affecting_document_keys(&BTreeSet::from([
            key("users/x"),
            key("rooms/b"),
        ]));
        assert_eq!(many.iter().map(|b| b.batch_id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn removal_clears_key_index() {
        let mut queue = MemoryMutationQueue::new();
        let batch = queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/a")]);
        assert!(queue.contains_key(&key("c/a")));
        queue.remove_mutation_batch(&batch);
        assert!(!queue.contains_key(&key("c/a")));
        queue.perform_consistency_check();
        assert!(queue.check_empty());
    }

    #[test]
    #[should_panic(expected = "first entry")]
    fn removing_out_of_order_panics() {
        let mut queue = MemoryMutationQueue::new();
        queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/a")]);
        let second = queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/b")]);
        queue.remove_mutation_batch(&second);
    }
}
