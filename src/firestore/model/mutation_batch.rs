use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult,
    SnapshotVersion, Timestamp,
};
use crate::firestore::value::BytesValue;
use crate::util::hard_assert;

/// Local view of a document plus the fields pending batches changed
/// (`None` when a batch replaced the whole document).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(document: MutableDocument, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}

/// Writes issued together by one `write` call.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Patches capturing pre-write values for transforms such as increments.
    /// Applied locally before `mutations`; never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        hard_assert(!mutations.is_empty(), "Cannot create an empty mutation batch");
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the backend's results for this batch to the cached document.
    pub fn apply_to_remote_document(&self, doc: &mut MutableDocument, result: &MutationBatchResult) {
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if mutation.key() == doc.key() {
                mutation.apply_to_remote_document(doc, mutation_result);
            }
        }
    }

    /// Applies every mutation of this batch that targets `doc`, threading the
    /// mutated-field mask through.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == doc.key() {
                mutated_fields =
                    mutation.apply_to_local_view(doc, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to a set of overlayed documents in place and returns
    /// the overlay mutation per touched key. Keys in
    /// `documents_without_remote_version` get whole-document overlays.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let key = mutation.key();
            let Some(overlayed) = documents.get_mut(key) else {
                continue;
            };
            let mut mutated_fields = self
                .apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            if documents_without_remote_version.contains(key) {
                mutated_fields = None;
            }
            if let Some(overlay) =
                calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref())
            {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mutated_fields;
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }
}

/// Backend acknowledgement of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: BytesValue,
    /// Version the backend assigned to each written document.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: BytesValue,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            "mutations sent and results received should have equal length",
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}
