use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::local::{PersistenceTransaction, QueryContext};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, IndexOffset, MutableDocument,
    Mutation, Overlay, OverlayedDocument, Timestamp,
};

/// Local view of documents: the remote document cache with the overlays of
/// pending writes applied.
pub struct LocalDocumentsView<'t, 'a> {
    txn: &'t mut PersistenceTransaction<'a>,
}

impl<'t, 'a> LocalDocumentsView<'t, 'a> {
    pub fn new(txn: &'t mut PersistenceTransaction<'a>) -> Self {
        Self { txn }
    }

    /// Local view of `key`; an invalid document when nothing is known.
    pub fn get_document(&mut self, key: &DocumentKey) -> MutableDocument {
        let overlay = self.txn.document_overlays.get_overlay(key);
        let mut document = self.base_document(key, overlay.as_ref());
        if let Some(overlay) = overlay {
            overlay
                .mutation()
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    pub fn get_documents(&mut self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        let docs = self.txn.remote_documents.get_entries(keys);
        self.get_local_view_of_documents(docs, &BTreeSet::new())
    }

    /// Applies overlays to `docs`. Keys in `existence_state_changed` had
    /// their remote existence flip, so their overlays are recomputed from
    /// the mutation queue.
    pub fn get_local_view_of_documents(
        &mut self,
        docs: BTreeMap<DocumentKey, MutableDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let keys: BTreeSet<DocumentKey> = docs.keys().cloned().collect();
        let overlays = self.txn.document_overlays.get_overlays(&keys);
        self.compute_views(docs, overlays, existence_state_changed)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect()
    }

    /// Overlayed documents plus the fields their pending writes touched.
    pub fn get_overlayed_documents(
        &mut self,
        docs: BTreeMap<DocumentKey, MutableDocument>,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let keys: BTreeSet<DocumentKey> = docs.keys().cloned().collect();
        let overlays = self.txn.document_overlays.get_overlays(&keys);
        self.compute_views(docs, overlays, &BTreeSet::new())
    }

    fn compute_views(
        &mut self,
        mut docs: BTreeMap<DocumentKey, MutableDocument>,
        overlays: BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let mut recalculate = BTreeMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();

        for (key, doc) in docs.iter_mut() {
            let overlay = overlays.get(key);
            let overlay_is_patch =
                overlay.map(|o| matches!(o.mutation(), Mutation::Patch { .. }));
            if existence_state_changed.contains(key) && overlay_is_patch.unwrap_or(true) {
                recalculate.insert(key.clone(), doc.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation().field_mask();
                mutated_fields.insert(key.clone(), mask.clone());
                overlay
                    .mutation()
                    .apply_to_local_view(doc, mask, Timestamp::now());
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        let (recalculated_docs, recalculated_masks) = self.recalculate_and_save_overlays(recalculate);
        mutated_fields.extend(recalculated_masks);
        docs.extend(recalculated_docs);

        docs.into_iter()
            .map(|(key, doc)| {
                let mask = mutated_fields.remove(&key).unwrap_or(None);
                (key, OverlayedDocument::new(doc, mask))
            })
            .collect()
    }

    /// Replays every pending batch over `docs` and stores one overlay per
    /// key, attributed to the newest batch touching it. Returns the
    /// replayed documents and the mutated-field mask of each.
    fn recalculate_and_save_overlays(
        &mut self,
        mut docs: BTreeMap<DocumentKey, MutableDocument>,
    ) -> (
        BTreeMap<DocumentKey, MutableDocument>,
        BTreeMap<DocumentKey, Option<FieldMask>>,
    ) {
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();

        let keys: BTreeSet<DocumentKey> = docs.keys().cloned().collect();
        let batches = self
            .txn
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(&keys);
        for batch in &batches {
            for key in batch.keys() {
                let Some(base) = docs.get_mut(&key) else {
                    continue;
                };
                let mask = masks
                    .remove(&key)
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                masks.insert(key.clone(), batch.apply_to_local_view(base, mask));
                documents_by_batch_id
                    .entry(batch.batch_id)
                    .or_default()
                    .insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch_id.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(doc) = docs.get(&key) else {
                    continue;
                };
                let mask = masks.get(&key).cloned().unwrap_or(None);
                if let Some(mutation) = calculate_overlay_mutation(doc, mask.as_ref()) {
                    overlays.insert(key, mutation);
                }
            }
            self.txn.document_overlays.save_overlays(batch_id, overlays);
        }
        (docs, masks)
    }

    /// Recomputes the overlays of `keys` from the remote cache and the
    /// mutation queue.
    pub fn recalculate_and_save_overlays_for_document_keys(&mut self, keys: &BTreeSet<DocumentKey>) {
        let docs = self.txn.remote_documents.get_entries(keys);
        self.recalculate_and_save_overlays(docs);
    }

    /// Documents matching `query` in the local view, reading remote
    /// documents and overlays newer than `offset`.
    pub fn get_documents_matching_query(
        &mut self,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() {
            return self.get_documents_matching_document_query(query);
        }
        if let Some(collection_id) = query.collection_group_id() {
            return self.get_documents_matching_collection_group_query(
                query,
                collection_id.to_string(),
                offset,
                context,
            );
        }
        self.get_documents_matching_collection_query(query, offset, context)
    }

    fn get_documents_matching_document_query(
        &mut self,
        query: &Query,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let mut results = BTreeMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let doc = self.get_document(&key);
            if doc.is_found_document() {
                results.insert(key, doc);
            }
        }
        results
    }

    fn get_documents_matching_collection_group_query(
        &mut self,
        query: &Query,
        collection_id: String,
        offset: &IndexOffset,
        mut context: Option<&mut QueryContext>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let parents = self.txn.index_manager.get_collection_parents(&collection_id);
        let mut results = BTreeMap::new();
        for parent in parents {
            if !query.path().is_prefix_of(&parent) {
                continue;
            }
            let collection_query =
                query.as_collection_query_at_path(parent.child([collection_id.as_str()]));
            results.extend(self.get_documents_matching_collection_query(
                &collection_query,
                offset,
                context.as_deref_mut(),
            ));
        }
        results
    }

    fn get_documents_matching_collection_query(
        &mut self,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let overlays = self
            .txn
            .document_overlays
            .get_overlays_for_collection(query.path(), offset.largest_batch_id);
        let mutated_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut remote_documents = self.txn.remote_documents.get_documents_matching_query(
            query,
            offset,
            &mutated_keys,
            context,
        );

        // Documents that only exist locally.
        for key in overlays.keys() {
            remote_documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        let mut results = BTreeMap::new();
        for (key, mut doc) in remote_documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation()
                    .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&doc) {
                results.insert(key, doc);
            }
        }
        results
    }

    fn base_document(&self, key: &DocumentKey, overlay: Option<&Overlay>) -> MutableDocument {
        match overlay.map(Overlay::mutation) {
            None | Some(Mutation::Patch { .. }) => self.txn.remote_documents.get_entry(key),
            Some(_) => MutableDocument::new_invalid_document(key.clone()),
        }
    }
}
