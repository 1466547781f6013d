use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::firestore::core::{Query, Target};
use crate::firestore::error::{not_found, FirestoreResult};
use crate::firestore::local::{
    BundleMetadata, LocalDocumentsView, LocalViewChanges, LruGarbageCollector, LruResults,
    NamedQuery, Persistence, PersistenceTransaction, QueryEngine, TargetData, TargetPurpose,
    TransactionMode,
};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, OverlayedDocument, SnapshotVersion, TargetId, Timestamp,
};
use crate::firestore::remote::{RemoteEvent, TargetChange, User};
use crate::firestore::value::BytesValue;
use crate::util::hard_assert;

/// Resume tokens older than this are persisted even if nothing changed, so a
/// restarted client does not resume from a token the backend has expired.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

pub type DocumentMap = BTreeMap<DocumentKey, Document>;

/// Result of [`LocalStore::write_locally`].
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

/// Result of [`LocalStore::execute_query`].
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Result of [`LocalStore::handle_user_change`].
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

struct LocalStoreState {
    current_user: User,
    query_engine: QueryEngine,
    /// Active targets, including the data the backend sent since they were
    /// allocated.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
}

/// Local half of the client: applies user writes and backend events to the
/// persistence stores and answers queries from them.
///
/// Every operation runs in one persistence transaction, so a failure leaves
/// the stores untouched.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn Persistence>, query_engine: QueryEngine, user: User) -> Self {
        Self {
            persistence,
            state: Mutex::new(LocalStoreState {
                current_user: user,
                query_engine,
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical_id: HashMap::new(),
            }),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn start(&self) -> FirestoreResult<()> {
        if !self.persistence.is_started() {
            self.persistence.start()?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.persistence.shutdown();
    }

    fn lock(&self) -> MutexGuard<'_, LocalStoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_user(&self) -> User {
        self.lock().current_user.clone()
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.lock().query_engine.set_index_auto_creation_enabled(enabled);
    }

    /// Switches to `user`'s mutation queue. Returns the documents whose local
    /// view may have changed because the pending writes of the old user
    /// disappeared and those of the new user appeared.
    pub fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let mut state = self.lock();
        let old_user = state.current_user.clone();
        let old_batches = self.persistence.run_transaction(
            "Get old mutation batches",
            TransactionMode::ReadOnly,
            &old_user,
            |txn| Ok(txn.mutation_queue.get_all_mutation_batches()),
        )?;

        let result = self.persistence.run_transaction(
            "Handle user change",
            TransactionMode::ReadOnly,
            &user,
            |txn| {
                let new_batches = txn.mutation_queue.get_all_mutation_batches();
                let mut changed_keys = BTreeSet::new();
                let removed_batch_ids = old_batches
                    .iter()
                    .map(|batch| {
                        changed_keys.extend(batch.keys());
                        batch.batch_id
                    })
                    .collect();
                let added_batch_ids = new_batches
                    .iter()
                    .map(|batch| {
                        changed_keys.extend(batch.keys());
                        batch.batch_id
                    })
                    .collect();
                let affected_documents = LocalDocumentsView::new(txn).get_documents(&changed_keys);
                Ok(UserChangeResult {
                    affected_documents,
                    removed_batch_ids,
                    added_batch_ids,
                })
            },
        )?;

        log::debug!(
            "local store: switched user from {:?} to {:?}",
            old_user.uid(),
            user.uid()
        );
        state.current_user = user;
        Ok(result)
    }

    /// Queues `mutations` as a new batch and returns the resulting local
    /// view of the documents they touch.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let state = self.lock();
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> =
            mutations.iter().map(|mutation| mutation.key().clone()).collect();

        self.persistence.run_transaction(
            "Locally write mutations",
            TransactionMode::ReadWrite,
            &state.current_user,
            |txn| {
                let remote_docs = txn.remote_documents.get_entries(&keys);
                let docs_without_remote_version: BTreeSet<DocumentKey> = remote_docs
                    .iter()
                    .filter(|(_, doc)| !doc.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = LocalDocumentsView::new(txn).get_overlayed_documents(remote_docs);

                // Transforms that depend on the current value (increments)
                // capture it as a base mutation so the local view stays put
                // when the remote document changes underneath.
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let doc = &overlayed.get(mutation.key())?.document;
                        let base_value = mutation.extract_base_value(doc)?;
                        let mask = base_value.field_mask();
                        Some(Mutation::patch(mutation.key().clone(), base_value, mask))
                    })
                    .collect();

                let batch = txn.add_mutation_batch(local_write_time, base_mutations, mutations);
                let overlays =
                    batch.apply_to_local_document_set(&mut overlayed, &docs_without_remote_version);
                txn.document_overlays.save_overlays(batch.batch_id, overlays);

                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: into_document_map(overlayed),
                })
            },
        )
    }

    /// Applies a batch the backend acknowledged: its results go into the
    /// remote document cache and the batch leaves the queue.
    pub fn acknowledge_batch(&self, batch_result: MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Acknowledge batch",
            TransactionMode::ReadWritePrimary,
            &state.current_user,
            |txn| {
                let affected = batch_result.batch.keys();
                apply_write_to_remote_document_cache(txn, &batch_result);
                txn.remove_mutation_batch(&batch_result.batch);
                txn.mutation_queue.perform_consistency_check();
                txn.document_overlays
                    .remove_overlays_for_batch_id(batch_result.batch.batch_id);
                let mut view = LocalDocumentsView::new(txn);
                view.recalculate_and_save_overlays_for_document_keys(&affected);
                Ok(view.get_documents(&affected))
            },
        )
    }

    /// Drops a batch the backend rejected; the documents revert to what the
    /// remaining batches and the remote cache say.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Reject batch",
            TransactionMode::ReadWritePrimary,
            &state.current_user,
            |txn| {
                let batch = txn.mutation_queue.lookup_mutation_batch(batch_id);
                let Some(batch) = batch else {
                    crate::util::fail(format!("Attempt to reject nonexistent batch {batch_id}"));
                };
                let affected = batch.keys();
                txn.remove_mutation_batch(&batch);
                txn.mutation_queue.perform_consistency_check();
                txn.document_overlays.remove_overlays_for_batch_id(batch_id);
                let mut view = LocalDocumentsView::new(txn);
                view.recalculate_and_save_overlays_for_document_keys(&affected);
                Ok(view.get_documents(&affected))
            },
        )
    }

    /// Highest batch id still waiting for the backend, or
    /// [`BATCH_ID_UNKNOWN`](crate::firestore::local::BATCH_ID_UNKNOWN).
    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            &state.current_user,
            |txn| Ok(txn.mutation_queue.get_highest_unacknowledged_batch_id()),
        )
    }

    /// First batch with an id greater than `after_batch_id`, for the write
    /// pipeline.
    pub fn next_mutation_batch(
        &self,
        after_batch_id: Option<BatchId>,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.lock();
        let after = after_batch_id.unwrap_or(crate::firestore::local::BATCH_ID_UNKNOWN);
        self.persistence.run_transaction(
            "Get next mutation batch",
            TransactionMode::ReadOnly,
            &state.current_user,
            |txn| Ok(txn.mutation_queue.get_next_mutation_batch_after_batch_id(after)),
        )
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Get last remote snapshot version",
            TransactionMode::ReadOnly,
            &state.current_user,
            |txn| Ok(txn.target_cache.get_last_remote_snapshot_version()),
        )
    }

    /// Applies one consistent snapshot from the backend: target metadata,
    /// target membership and document updates land in one transaction.
    /// Returns the local view of every document that changed.
    pub fn apply_remote_event(&self, remote_event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut state = self.lock();
        let remote_version = remote_event.snapshot_version;
        let mut updated_targets = Vec::with_capacity(remote_event.target_changes.len());

        let changes = self.persistence.run_transaction(
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            &state.current_user,
            |txn| {
                for (target_id, change) in &remote_event.target_changes {
                    let Some(old_target_data) = state.target_data_by_target.get(target_id) else {
                        continue;
                    };
                    txn.remove_matching_keys(&change.removed_documents, *target_id);
                    txn.add_matching_keys(&change.added_documents, *target_id);

                    let mut updated = old_target_data.with_sequence_number(txn.current_sequence_number);
                    if remote_event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(BytesValue::default(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    if should_persist_target_data(old_target_data, &updated, change) {
                        txn.target_cache.update_target_data(updated.clone());
                    }
                    updated_targets.push((*target_id, updated));
                }

                for key in remote_event.document_updates.keys() {
                    if remote_event.resolved_limbo_documents.contains(key) {
                        txn.reference_delegate
                            .update_limbo_document(key, txn.current_sequence_number);
                    }
                }

                let (changed_docs, existence_changed) =
                    populate_document_changes(txn, &remote_event.document_updates, remote_version);

                if !remote_version.is_min() {
                    let last_version = txn.target_cache.get_last_remote_snapshot_version();
                    hard_assert(
                        remote_version >= last_version,
                        format!(
                            "Watch stream reverted to previous snapshot?? {remote_version} < {last_version}"
                        ),
                    );
                    txn.target_cache
                        .set_targets_metadata(txn.current_sequence_number, Some(remote_version));
                }

                Ok(LocalDocumentsView::new(txn)
                    .get_local_view_of_documents(changed_docs, &existence_changed))
            },
        )?;

        state.target_data_by_target.extend(updated_targets);
        Ok(changes)
    }

    /// Pins the documents views started showing and records, for views the
    /// backend has synced, the snapshot version their results are free of
    /// limbo documents at.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let mut state = self.lock();
        self.persistence.run_transaction(
            "Notify local view changes",
            TransactionMode::ReadWrite,
            &state.current_user,
            |txn| {
                for change in view_changes {
                    txn.reference_delegate
                        .add_in_memory_pins(&change.added_keys, change.target_id);
                    txn.reference_delegate
                        .remove_in_memory_pins(&change.removed_keys, change.target_id);
                    for key in change.added_keys.iter().chain(&change.removed_keys) {
                        txn.reference_delegate
                            .add_reference(key, txn.current_sequence_number);
                    }
                }
                Ok(())
            },
        )?;

        for change in view_changes {
            if change.from_cache {
                continue;
            }
            if let Some(target_data) = state.target_data_by_target.get_mut(&change.target_id) {
                *target_data = target_data
                    .with_last_limbo_free_snapshot_version(target_data.snapshot_version);
            }
        }
        Ok(())
    }

    /// Returns the cached target data for `target`, creating and persisting
    /// a new target if the target was never listened to.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut state = self.lock();
        let target_data = self.persistence.run_transaction(
            "Allocate target",
            TransactionMode::ReadWrite,
            &state.current_user,
            |txn| {
                if let Some(cached) = txn.target_cache.get_target_data(&target) {
                    return Ok(cached);
                }
                let target_id = txn.target_cache.allocate_target_id();
                let data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number,
                );
                txn.target_cache.add_target_data(data.clone());
                Ok(data)
            },
        )?;

        let target_id = target_data.target_id;
        if !state.target_data_by_target.contains_key(&target_id) {
            state
                .target_data_by_target
                .insert(target_id, target_data.clone());
            state
                .target_id_by_canonical_id
                .insert(target.canonical_id(), target_id);
        }
        Ok(target_data)
    }

    /// Target data of an active target, or of a cached one.
    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let state = self.lock();
        self.target_data_for(&state, target)
    }

    fn target_data_for(
        &self,
        state: &LocalStoreState,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_id) = state.target_id_by_canonical_id.get(&target.canonical_id()) {
            return Ok(state.target_data_by_target.get(target_id).cloned());
        }
        self.persistence.run_transaction(
            "Get target data",
            TransactionMode::ReadOnly,
            &state.current_user,
            |txn| Ok(txn.target_cache.get_target_data(target)),
        )
    }

    /// Stops tracking an active target. The target data stays cached until
    /// garbage collection unless `keep_persisted_target_data` is set, in
    /// which case its sequence number is left alone too.
    pub fn release_target(
        &self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> FirestoreResult<()> {
        let mut state = self.lock();
        let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
            return Err(not_found(format!("Tried to release nonexistent target: {target_id}")));
        };
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };
        self.persistence.run_transaction(
            "Release target",
            mode,
            &state.current_user,
            |txn| {
                for key in txn
                    .reference_delegate
                    .remove_in_memory_pins_for_target(target_id)
                {
                    txn.reference_delegate
                        .remove_reference(&key, txn.current_sequence_number);
                }
                if !keep_persisted_target_data {
                    txn.release_target(&target_data);
                }
                Ok(())
            },
        )?;

        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local view. With `use_previous_results` the
    /// engine may start from the target's last synced result set.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let state = self.lock();
        let target_data = self.target_data_for(&state, &query.to_target())?;
        let query_engine = &state.query_engine;
        let mode = if query_engine.creates_indexes() {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadOnly
        };

        self.persistence.run_transaction(
            "Execute query",
            mode,
            &state.current_user,
            |txn| {
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        txn.target_cache.get_matching_keys_for_target_id(data.target_id),
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let (since, previous_keys) = if use_previous_results {
                    (last_limbo_free, remote_keys.clone())
                } else {
                    (SnapshotVersion::min(), BTreeSet::new())
                };
                let documents =
                    query_engine.get_documents_matching_query(txn, query, since, &previous_keys);
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            },
        )
    }

    /// Local view of one document; an invalid document if nothing is known.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Read document",
            TransactionMode::ReadOnly,
            &state.current_user,
            |txn| Ok(LocalDocumentsView::new(txn).get_document(key)),
        )
    }

    /// Keys the backend last reported as matching `target_id`.
    pub fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Remote document keys",
            TransactionMode::ReadOnly,
            &state.current_user,
            |txn| Ok(txn.target_cache.get_matching_keys_for_target_id(target_id)),
        )
    }

    /// Active target ids, which garbage collection must leave alone.
    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.lock().target_data_by_target.keys().copied().collect()
    }

    pub fn collect_garbage(&self, collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let state = self.lock();
        let active: BTreeSet<TargetId> = state.target_data_by_target.keys().copied().collect();
        self.persistence.run_transaction(
            "Collect garbage",
            TransactionMode::ReadWritePrimary,
            &state.current_user,
            |txn| Ok(collector.collect(txn, &active)),
        )
    }

    /// Whether a bundle with this id at the same or a later creation time
    /// was loaded before.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Has newer bundle",
            TransactionMode::ReadOnly,
            &state.current_user,
            |txn| {
                Ok(txn
                    .bundle_cache
                    .get_bundle_metadata(&metadata.id)
                    .is_some_and(|cached| cached.create_time >= metadata.create_time))
            },
        )
    }

    pub fn save_bundle(&self, metadata: BundleMetadata) -> FirestoreResult<()> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Save bundle",
            TransactionMode::ReadWrite,
            &state.current_user,
            |txn| {
                txn.bundle_cache.save_bundle_metadata(metadata);
                Ok(())
            },
        )
    }

    pub fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        let state = self.lock();
        self.persistence.run_transaction(
            "Get named query",
            TransactionMode::ReadOnly,
            &state.current_user,
            |txn| Ok(txn.bundle_cache.get_named_query(name)),
        )
    }

    /// Saves a named query. The documents it matched at its read time
    /// become the remote keys of its target, so listening to the query
    /// starts from the bundled results.
    pub fn save_named_query(
        &self,
        query: NamedQuery,
        documents: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let target_data = self.allocate_target(query.query.to_target())?;
        let state = self.lock();
        self.persistence.run_transaction(
            "Save named query",
            TransactionMode::ReadWrite,
            &state.current_user,
            |txn| {
                if query.read_time > target_data.snapshot_version {
                    let updated = target_data
                        .with_resume_token(BytesValue::default(), query.read_time);
                    txn.target_cache.update_target_data(updated);
                    let previous =
                        txn.target_cache.get_matching_keys_for_target_id(target_data.target_id);
                    txn.remove_matching_keys(&previous, target_data.target_id);
                    txn.add_matching_keys(&documents, target_data.target_id);
                }
                txn.bundle_cache.save_named_query(query);
                Ok(())
            },
        )
    }
}

fn into_document_map(overlayed: BTreeMap<DocumentKey, OverlayedDocument>) -> DocumentMap {
    overlayed
        .into_iter()
        .map(|(key, doc)| (key, doc.document))
        .collect()
}

fn apply_write_to_remote_document_cache(
    txn: &mut PersistenceTransaction<'_>,
    batch_result: &MutationBatchResult,
) {
    let batch = &batch_result.batch;
    for key in batch.keys() {
        let mut doc = txn.remote_documents.get_entry(&key);
        let Some(ack_version) = batch_result.doc_versions.get(&key).copied() else {
            crate::util::fail("docVersions should contain every doc in the write.");
        };
        if doc.version() < ack_version {
            batch.apply_to_remote_document(&mut doc, batch_result);
            if doc.is_valid_document() {
                doc.set_read_time(batch_result.commit_version);
                txn.save_remote_document(doc);
            }
        }
    }
}

/// Writes the newer of each update and the cached entry into the remote
/// document cache. Returns the applied documents and the keys whose
/// existence changed. Updates without a read time are stamped with the
/// event's snapshot version, or their own version when the event has none.
fn populate_document_changes(
    txn: &mut PersistenceTransaction<'_>,
    updates: &BTreeMap<DocumentKey, MutableDocument>,
    remote_version: SnapshotVersion,
) -> (BTreeMap<DocumentKey, MutableDocument>, BTreeSet<DocumentKey>) {
    let keys: BTreeSet<DocumentKey> = updates.keys().cloned().collect();
    let existing_docs = txn.remote_documents.get_entries(&keys);
    let mut changed = BTreeMap::new();
    let mut existence_changed = BTreeSet::new();

    for (key, doc) in updates {
        let existing = existing_docs
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));
        if doc.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if doc.is_no_document() && doc.version().is_min() {
            // Deletion from a limbo resolution; the backend sends no version.
            txn.remove_remote_document(key);
            changed.insert(key.clone(), doc.clone());
        } else if !existing.is_valid_document()
            || doc.version() > existing.version()
            || (doc.version() == existing.version() && existing.has_pending_writes())
        {
            let mut doc = doc.clone();
            if doc.read_time().is_min() {
                let read_time = if remote_version.is_min() { doc.version() } else { remote_version };
                log::debug!("local store: {key} arrived without a read time, using {read_time}");
                doc.set_read_time(read_time);
            }
            txn.save_remote_document(doc.clone());
            changed.insert(key.clone(), doc);
        } else {
            log::debug!(
                "local store: ignoring outdated watch update for {key}. Current version: {}, watch version: {}",
                existing.version(),
                doc.version()
            );
        }
    }
    (changed, existence_changed)
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let age = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len()
        > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::IndexAutoCreation;
    use crate::firestore::local::MemoryPersistence;
    use crate::firestore::model::{FieldPath, MutationResult};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(field: &str, value: &str) -> MapValue {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_single(field), FirestoreValue::from_string(value));
        data
    }

    fn store() -> LocalStore {
        LocalStore::new(
            Arc::new(MemoryPersistence::started()),
            QueryEngine::new(IndexAutoCreation::disabled()),
            User::unauthenticated(),
        )
    }

    fn remote_doc(path: &str, version: i64, value: &str) -> MutableDocument {
        let mut doc = MutableDocument::new_found_document(
            key(path),
            SnapshotVersion::from_micros(version),
            map("name", value),
        );
        doc.set_read_time(SnapshotVersion::from_micros(version));
        doc
    }

    fn event_for(target_id: TargetId, version: i64, docs: Vec<MutableDocument>) -> RemoteEvent {
        let added: BTreeSet<DocumentKey> = docs.iter().map(|doc| doc.key().clone()).collect();
        RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(version),
            target_changes: BTreeMap::from([(
                target_id,
                TargetChange {
                    resume_token: BytesValue::new(vec![1, 2, 3]),
                    current: true,
                    added_documents: added,
                    modified_documents: BTreeSet::new(),
                    removed_documents: BTreeSet::new(),
                },
            )]),
            target_mismatches: BTreeMap::new(),
            document_updates: docs
                .into_iter()
                .map(|doc| (doc.key().clone(), doc))
                .collect(),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    #[test]
    fn offline_write_is_visible_then_acknowledged() {
        let store = store();
        let write = store
            .write_locally(vec![Mutation::set(key("items/a"), map("name", "x"))])
            .unwrap();
        let local = &write.changes[&key("items/a")];
        assert!(local.has_local_mutations());
        assert_eq!(local.data(), &map("name", "x"));

        let batch = store.next_mutation_batch(None).unwrap().unwrap();
        assert_eq!(batch.batch_id, write.batch_id);
        let version = SnapshotVersion::from_micros(2);
        let result = MutationBatchResult::new(
            batch,
            version,
            vec![MutationResult::new(version, Vec::new())],
            BytesValue::default(),
        );
        let changes = store.acknowledge_batch(result).unwrap();
        let acked = &changes[&key("items/a")];
        assert!(!acked.has_local_mutations());
        assert!(acked.has_committed_mutations());
        assert_eq!(acked.version(), version);
        assert_eq!(acked.data(), &map("name", "x"));
        assert_eq!(
            store.get_highest_unacknowledged_batch_id().unwrap(),
            crate::firestore::local::BATCH_ID_UNKNOWN
        );
    }

    #[test]
    fn rejected_write_reverts_to_remote_state() {
        let store = store();
        let query = Query::collection("items").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 1, vec![remote_doc("items/a", 1, "server")]))
            .unwrap();

        let write = store
            .write_locally(vec![Mutation::set(key("items/a"), map("name", "local"))])
            .unwrap();
        assert_eq!(write.changes[&key("items/a")].data(), &map("name", "local"));

        let reverted = store.reject_batch(write.batch_id).unwrap();
        let doc = &reverted[&key("items/a")];
        assert_eq!(doc.data(), &map("name", "server"));
        assert!(!doc.has_local_mutations());
    }

    #[test]
    fn remote_event_updates_target_and_ignores_stale_documents() {
        let store = store();
        let query = Query::collection("items").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();

        store
            .apply_remote_event(&event_for(target.target_id, 5, vec![remote_doc("items/a", 5, "new")]))
            .unwrap();
        let stale = store
            .apply_remote_event(&event_for(target.target_id, 6, vec![remote_doc("items/a", 3, "old")]))
            .unwrap();
        assert!(stale.is_empty());

        assert_eq!(
            store.get_last_remote_snapshot_version().unwrap(),
            SnapshotVersion::from_micros(6)
        );
        let data = store.get_target_data(&query.to_target()).unwrap().unwrap();
        assert_eq!(data.resume_token, BytesValue::new(vec![1, 2, 3]));
        assert_eq!(
            store.get_remote_document_keys(target.target_id).unwrap(),
            BTreeSet::from([key("items/a")])
        );
        assert_eq!(store.read_document(&key("items/a")).unwrap().data(), &map("name", "new"));
    }

    #[test]
    fn target_mismatch_discards_resume_token() {
        let store = store();
        let query = Query::collection("items").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 1, Vec::new()))
            .unwrap();

        let mut mismatch = event_for(target.target_id, 2, Vec::new());
        mismatch
            .target_mismatches
            .insert(target.target_id, TargetPurpose::ExistenceFilterMismatch);
        store.apply_remote_event(&mismatch).unwrap();

        let data = store.get_target_data(&query.to_target()).unwrap().unwrap();
        assert!(data.resume_token.is_empty());
        assert!(data.snapshot_version.is_min());
    }

    #[test]
    fn execute_query_combines_remote_and_local_documents() {
        let store = store();
        let query = Query::collection("items").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 1, vec![remote_doc("items/a", 1, "a")]))
            .unwrap();
        store
            .write_locally(vec![Mutation::set(key("items/b"), map("name", "b"))])
            .unwrap();

        let result = store.execute_query(&query, true).unwrap();
        assert_eq!(
            result.documents.keys().cloned().collect::<Vec<_>>(),
            vec![key("items/a"), key("items/b")]
        );
        assert_eq!(result.remote_keys, BTreeSet::from([key("items/a")]));
    }

    #[test]
    fn user_change_swaps_pending_writes() {
        let store = store();
        store
            .write_locally(vec![Mutation::set(key("items/a"), map("name", "anon"))])
            .unwrap();

        let result = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(result.removed_batch_ids.len(), 1);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("items/a")].is_valid_document());
        assert!(!store.read_document(&key("items/a")).unwrap().is_valid_document());

        let back = store.handle_user_change(User::unauthenticated()).unwrap();
        assert_eq!(back.added_batch_ids.len(), 1);
        assert_eq!(back.affected_documents[&key("items/a")].data(), &map("name", "anon"));
    }

    #[test]
    fn released_target_is_collected_but_pending_write_survives() {
        let store = store();
        let query = Query::collection("items").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        store
            .apply_remote_event(&event_for(
                target.target_id,
                1,
                vec![remote_doc("items/a", 1, "a"), remote_doc("items/b", 1, "b")],
            ))
            .unwrap();
        store
            .write_locally(vec![Mutation::set(key("items/b"), map("name", "pending"))])
            .unwrap();
        store.release_target(target.target_id, false).unwrap();

        let collector = LruGarbageCollector::new(crate::firestore::core::LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        let results = store.collect_garbage(&collector).unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert!(!store.read_document(&key("items/a")).unwrap().is_valid_document());
        assert_eq!(
            store.read_document(&key("items/b")).unwrap().data(),
            &map("name", "pending")
        );
        assert!(store.release_target(target.target_id, false).is_err());
    }

    #[test]
    fn update_without_read_time_uses_event_version() {
        let store = store();
        let query = Query::collection("items").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        let unstamped = MutableDocument::new_found_document(
            key("items/a"),
            SnapshotVersion::from_micros(3),
            map("name", "a"),
        );

        let changes = store
            .apply_remote_event(&event_for(target.target_id, 4, vec![unstamped]))
            .unwrap();
        assert!(changes.contains_key(&key("items/a")));
        let cached = store.read_document(&key("items/a")).unwrap();
        assert_eq!(cached.read_time(), SnapshotVersion::from_micros(4));
        assert_eq!(cached.data(), &map("name", "a"));
    }

    #[test]
    fn remote_event_only_touches_targets_it_names() {
        let store = store();
        let items = Query::collection("items").unwrap();
        let rooms = Query::collection("rooms").unwrap();
        let items_target = store.allocate_target(items.to_target()).unwrap();
        let rooms_target = store.allocate_target(rooms.to_target()).unwrap();

        let mut event = event_for(items_target.target_id, 2, vec![remote_doc("items/a", 2, "a")]);
        let unknown = event.target_changes[&items_target.target_id].clone();
        event.target_changes.insert(rooms_target.target_id + 100, unknown);
        store.apply_remote_event(&event).unwrap();

        let items_data = store.get_target_data(&items.to_target()).unwrap().unwrap();
        assert_eq!(items_data.resume_token, BytesValue::new(vec![1, 2, 3]));
        assert_eq!(items_data.snapshot_version, SnapshotVersion::from_micros(2));
        let rooms_data = store.get_target_data(&rooms.to_target()).unwrap().unwrap();
        assert!(rooms_data.resume_token.is_empty());
        assert_eq!(rooms_data.sequence_number, rooms_target.sequence_number);
        assert_eq!(
            store.active_target_ids(),
            BTreeSet::from([items_target.target_id, rooms_target.target_id])
        );
    }
}
