use std::collections::BTreeSet;

use crate::firestore::core::Target;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{
    BundleCache, DocumentOverlayCache, IndexManager, MutationQueue, ReferenceDelegate,
    RemoteDocumentCache, TargetCache, TargetData,
};
use crate::firestore::model::{
    DocumentKey, IndexOffset, ListenSequenceNumber, MutableDocument, Mutation, MutationBatch,
    TargetId, Timestamp,
};
use crate::firestore::remote::User;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

/// The stores visible to one persistence transaction. Stores are public so
/// callers can borrow several of them at once; the helper methods keep the
/// stores that mirror each other (collection parents, field indexes, GC
/// bookkeeping) in step.
pub struct PersistenceTransaction<'a> {
    pub label: &'a str,
    pub user: &'a User,
    pub current_sequence_number: ListenSequenceNumber,
    pub mutation_queue: &'a mut dyn MutationQueue,
    /// Queues of the other users; read only, used to pin their documents.
    pub other_mutation_queues: Vec<&'a dyn MutationQueue>,
    pub document_overlays: &'a mut dyn DocumentOverlayCache,
    pub remote_documents: &'a mut dyn RemoteDocumentCache,
    pub target_cache: &'a mut dyn TargetCache,
    pub bundle_cache: &'a mut dyn BundleCache,
    pub index_manager: &'a mut dyn IndexManager,
    pub reference_delegate: &'a mut dyn ReferenceDelegate,
}

impl<'a> PersistenceTransaction<'a> {
    pub fn save_remote_document(&mut self, doc: MutableDocument) {
        self.index_manager
            .add_to_collection_parent_index(&doc.key().collection_path());
        self.index_manager.update_index_entries(&doc);
        self.remote_documents.add_entry(doc);
    }

    pub fn remove_remote_document(&mut self, key: &DocumentKey) {
        self.remote_documents.remove_entry(key);
        self.index_manager.remove_index_entries(key);
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch = self
            .mutation_queue
            .add_mutation_batch(local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            self.index_manager
                .add_to_collection_parent_index(&mutation.key().collection_path());
        }
        batch
    }

    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) {
        self.mutation_queue.remove_mutation_batch(batch);
        for key in batch.keys() {
            self.reference_delegate
                .remove_mutation_reference(&key, self.current_sequence_number);
        }
    }

    pub fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.target_cache.add_matching_keys(keys, target_id);
        for key in keys {
            self.reference_delegate
                .add_reference(key, self.current_sequence_number);
        }
    }

    pub fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.target_cache.remove_matching_keys(keys, target_id);
        for key in keys {
            self.reference_delegate
                .remove_reference(key, self.current_sequence_number);
        }
    }

    /// Marks `target_data` as released at the current sequence number. The
    /// target stays cached until garbage collection removes it.
    pub fn release_target(&mut self, target_data: &TargetData) {
        let updated = target_data.with_sequence_number(self.current_sequence_number);
        self.target_cache.update_target_data(updated);
    }

    /// Creates a field index for `target` if none serves it fully and
    /// backfills it from the remote document cache.
    pub fn create_target_indexes(&mut self, target: &Target) {
        let Some(index) = self.index_manager.create_target_indexes(target) else {
            return;
        };
        let docs = self
            .remote_documents
            .get_all_from_collection_group(&index.collection_group, &IndexOffset::none());
        for doc in docs.values() {
            self.index_manager.update_index_entries(doc);
        }
    }

    /// Whether any user's mutation queue still references `key`.
    pub fn mutation_queues_contain_key(&self, key: &DocumentKey) -> bool {
        self.mutation_queue.contains_key(key)
            || self
                .other_mutation_queues
                .iter()
                .any(|queue| queue.contains_key(key))
    }
}

pub type TransactionOperation<'f> =
    dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()> + 'f;

/// A storage backend. Every read and write of the local stores happens
/// inside [`Persistence::execute_transaction`]; a transaction that returns
/// an error leaves no trace.
pub trait Persistence: Send + Sync {
    fn start(&self) -> FirestoreResult<()>;

    fn shutdown(&self);

    fn is_started(&self) -> bool;

    fn execute_transaction(
        &self,
        label: &str,
        mode: TransactionMode,
        user: &User,
        operation: &mut TransactionOperation<'_>,
    ) -> FirestoreResult<()>;
}

impl dyn Persistence {
    /// Runs `operation` in a transaction and returns its value.
    pub fn run_transaction<T, F>(
        &self,
        label: &str,
        mode: TransactionMode,
        user: &User,
        operation: F,
    ) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let mut operation = Some(operation);
        let mut output = None;
        self.execute_transaction(label, mode, user, &mut |txn| {
            let operation = operation
                .take()
                .ok_or_else(|| internal_error("transaction body invoked twice"))?;
            output = Some(operation(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| internal_error(format!("transaction '{label}' produced no result")))
    }
}
