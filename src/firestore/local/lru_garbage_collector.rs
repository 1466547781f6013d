use std::collections::{BTreeSet, BinaryHeap};

use crate::firestore::core::LruParams;
use crate::firestore::local::PersistenceTransaction;
use crate::firestore::model::{ListenSequenceNumber, TargetId};

/// Sentinel returned when there is nothing to collect.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn skipped() -> Self {
        Self::default()
    }
}

/// Keeps the `capacity` lowest sequence numbers seen so far. The heap is a
/// max-heap so the largest kept value is evicted first.
struct RollingSequenceNumberBuffer {
    capacity: usize,
    heap: BinaryHeap<ListenSequenceNumber>,
}

impl RollingSequenceNumberBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    fn add(&mut self, sequence_number: ListenSequenceNumber) {
        if self.heap.len() < self.capacity {
            self.heap.push(sequence_number);
        } else if let Some(&highest) = self.heap.peek() {
            if sequence_number < highest {
                self.heap.pop();
                self.heap.push(sequence_number);
            }
        }
    }

    fn max_value(&self) -> ListenSequenceNumber {
        self.heap.peek().copied().unwrap_or(INVALID_SEQUENCE_NUMBER)
    }
}

/// Evicts targets and documents in least-recently-used order once the cache
/// grows beyond its configured threshold.
#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    pub fn is_enabled(&self) -> bool {
        self.params.is_enabled()
    }

    /// Number of sequence numbers making up `percentile` percent of the
    /// targets and orphaned documents currently cached.
    pub fn calculate_target_count(
        &self,
        txn: &PersistenceTransaction<'_>,
        percentile: u32,
    ) -> usize {
        let count = txn.target_cache.get_target_count()
            + txn.reference_delegate.orphaned_document_count();
        (percentile as usize * count) / 100
    }

    /// The `n`th lowest sequence number across targets and orphaned
    /// documents.
    pub fn nth_sequence_number(
        &self,
        txn: &PersistenceTransaction<'_>,
        n: usize,
    ) -> ListenSequenceNumber {
        if n == 0 {
            return INVALID_SEQUENCE_NUMBER;
        }
        let mut buffer = RollingSequenceNumberBuffer::new(n);
        for target in txn.target_cache.targets() {
            buffer.add(target.sequence_number);
        }
        for sequence_number in txn.reference_delegate.orphaned_sequence_numbers() {
            buffer.add(sequence_number);
        }
        buffer.max_value()
    }

    /// Removes inactive targets at or below `upper_bound`. The documents
    /// they referenced keep the sequence number at which they were last
    /// referenced.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        let (removed, _orphaned_keys) = txn
            .target_cache
            .remove_targets(upper_bound, active_target_ids);
        removed
    }

    /// Removes every orphaned document last used at or below `upper_bound`
    /// that no target, mutation batch or live view still references.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
    ) -> usize {
        let mut removed = 0;
        for key in txn.remote_documents.document_keys() {
            let recently_used = txn
                .reference_delegate
                .orphaned_sequence_number(&key)
                .is_some_and(|sequence_number| sequence_number > upper_bound);
            if recently_used
                || txn.target_cache.contains_key(&key)
                || txn.mutation_queues_contain_key(&key)
                || txn.reference_delegate.is_pinned_in_memory(&key)
            {
                continue;
            }
            txn.remove_remote_document(&key);
            txn.reference_delegate.forget_document(&key);
            removed += 1;
        }
        removed
    }

    /// Size of the cached remote documents in bytes.
    pub fn cache_size(&self, txn: &PersistenceTransaction<'_>) -> usize {
        txn.remote_documents.get_size()
    }

    /// Runs a collection pass if the cache is over its threshold.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> LruResults {
        if !self.is_enabled() {
            log::debug!("lru gc: garbage collection skipped; disabled");
            return LruResults::skipped();
        }

        let cache_size = self.cache_size(txn);
        let threshold = self.params.cache_size_collection_threshold;
        if (cache_size as i64) < threshold {
            log::debug!(
                "lru gc: garbage collection skipped; cache size {cache_size} is lower than threshold {threshold}"
            );
            return LruResults::skipped();
        }

        let mut sequence_numbers =
            self.calculate_target_count(txn, self.params.percentile_to_collect);
        if sequence_numbers > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "lru gc: capping sequence numbers to collect down to {} from {sequence_numbers}",
                self.params.maximum_sequence_numbers_to_collect
            );
            sequence_numbers = self.params.maximum_sequence_numbers_to_collect;
        }

        let upper_bound = self.nth_sequence_number(txn, sequence_numbers);
        let targets_removed = self.remove_targets(txn, upper_bound, active_target_ids);
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound);

        log::debug!(
            "lru gc: collected {sequence_numbers} sequence numbers up to {upper_bound}; \
             removed {targets_removed} targets and {documents_removed} documents"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers,
            targets_removed,
            documents_removed,
        }
    }
}
