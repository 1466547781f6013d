use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{DocumentSet, IndexAutoCreation, LimitType, Query};
use crate::firestore::local::{IndexType, LocalDocumentsView, PersistenceTransaction};
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, SnapshotVersion};

/// Counts the documents a query execution had to read.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    document_read_count: usize,
}

impl QueryContext {
    pub fn document_read_count(&self) -> usize {
        self.document_read_count
    }

    pub fn increment_document_read_count(&mut self, amount: usize) {
        self.document_read_count += amount;
    }
}

/// Runs queries against the local view, picking the cheapest strategy:
///
/// 1. a field index, when one serves the query;
/// 2. the previous result set of the target plus everything changed since
///    the target was last free of limbo documents;
/// 3. a scan of the whole collection.
///
/// After a full scan that read many documents for few results, a field index
/// is created so later executions can use strategy 1.
#[derive(Clone, Debug, Default)]
pub struct QueryEngine {
    index_auto_creation: IndexAutoCreation,
}

impl QueryEngine {
    pub fn new(index_auto_creation: IndexAutoCreation) -> Self {
        Self {
            index_auto_creation,
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.index_auto_creation.enabled = enabled;
    }

    /// Whether running a query may create field indexes.
    pub fn creates_indexes(&self) -> bool {
        self.index_auto_creation.enabled
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if let Some(results) = self.perform_query_using_index(txn, query) {
            return results;
        }
        if let Some(results) = self.perform_query_using_remote_keys(
            txn,
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        ) {
            return results;
        }

        let mut context = QueryContext::default();
        let results = self.execute_full_collection_scan(txn, query, &mut context);
        if self.index_auto_creation.enabled {
            self.create_cache_indexes(txn, query, &context, results.len());
        }
        results
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) {
        let read_count = context.document_read_count();
        if read_count < self.index_auto_creation.min_collection_size {
            log::debug!(
                "query engine: skipping index creation for {}: read {read_count} documents",
                query.canonical_id()
            );
            return;
        }
        let threshold =
            self.index_auto_creation.relative_index_read_cost_per_document * result_size as f64;
        if read_count as f64 > threshold {
            txn.create_target_indexes(&query.to_target());
            log::debug!(
                "query engine: index created for {} after reading {read_count} documents for {result_size} results",
                query.canonical_id()
            );
        }
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if query.matches_all_documents() {
            return None;
        }

        let target = query.to_target();
        let index_type = txn.index_manager.get_index_type(&target);
        if index_type == IndexType::None {
            return None;
        }
        if query.has_limit() && index_type == IndexType::Partial {
            // The index cannot apply the limit; run unlimited and let the view
            // trim the result.
            return self.perform_query_using_index(txn, &query.without_limit());
        }

        let keys: BTreeSet<DocumentKey> = txn
            .index_manager
            .get_documents_matching_target(&target)?
            .into_iter()
            .collect();
        let offset = txn.index_manager.get_min_offset(&target);

        let mut view = LocalDocumentsView::new(txn);
        let indexed = view.get_documents(&keys);
        let previous_results = apply_query(query, indexed.into_values());
        if needs_refill(query, &previous_results, &keys, offset.read_time) {
            return self.perform_query_using_index(txn, &query.without_limit());
        }
        Some(append_remaining_results(txn, previous_results, query, &offset))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        // A full scan is cheaper when every document matches anyway.
        if query.matches_all_documents() {
            return None;
        }
        // Without a limbo-free snapshot the previous results cannot be
        // trusted.
        if last_limbo_free_snapshot_version.is_min() {
            return None;
        }

        let documents = LocalDocumentsView::new(txn).get_documents(remote_keys);
        let previous_results = apply_query(query, documents.into_values());
        if query.has_limit()
            && needs_refill(
                query,
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return None;
        }

        log::debug!(
            "query engine: re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );
        Some(append_remaining_results(
            txn,
            previous_results,
            query,
            &IndexOffset::successor_of(last_limbo_free_snapshot_version, -1),
        ))
    }

    fn execute_full_collection_scan(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        log::debug!(
            "query engine: using full collection scan to execute query: {}",
            query.canonical_id()
        );
        LocalDocumentsView::new(txn).get_documents_matching_query(
            query,
            &IndexOffset::none(),
            Some(context),
        )
    }
}

/// Documents of `docs` that match `query`, in query order.
fn apply_query(query: &Query, docs: impl IntoIterator<Item = MutableDocument>) -> DocumentSet {
    let mut results = DocumentSet::new(query.comparator());
    for doc in docs {
        if query.matches(&doc) {
            results.add(doc);
        }
    }
    results
}

/// Whether a limited result computed from previous results may be missing
/// documents: some previous result left the query, or the document at the
/// limit edge changed after the results were computed.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &DocumentSet,
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        None => false,
        Some(doc) => doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version,
    }
}

fn append_remaining_results(
    txn: &mut PersistenceTransaction<'_>,
    indexed_results: DocumentSet,
    query: &Query,
    offset: &IndexOffset,
) -> BTreeMap<DocumentKey, MutableDocument> {
    let mut remaining = LocalDocumentsView::new(txn).get_documents_matching_query(query, offset, None);
    for doc in indexed_results.iter() {
        remaining.insert(doc.key().clone(), doc.clone());
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{FieldFilter, FilterOperator, OrderBy};
    use crate::firestore::local::{MemoryPersistence, Persistence, TransactionMode};
    use crate::firestore::model::{FieldPath, Mutation, Timestamp};
    use crate::firestore::remote::User;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn remote(path: &str, version: i64, n: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_single("n"), FirestoreValue::from_integer(n));
        let mut doc =
            MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), data);
        doc.set_read_time(SnapshotVersion::from_micros(version));
        doc
    }

    fn n_below(limit: i64) -> Query {
        Query::collection("c").unwrap().with_filter(
            FieldFilter::new(
                FieldPath::from_single("n"),
                FilterOperator::LessThan,
                FirestoreValue::from_integer(limit),
            )
            .unwrap(),
        )
    }

    fn run<T>(
        persistence: &Arc<dyn Persistence>,
        body: impl FnOnce(&mut PersistenceTransaction<'_>) -> T,
    ) -> T {
        persistence
            .run_transaction(
                "test",
                TransactionMode::ReadWrite,
                &User::unauthenticated(),
                |txn| Ok(body(txn)),
            )
            .unwrap()
    }

    #[test]
    fn previous_results_are_combined_with_newer_documents() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::started());
        let engine = QueryEngine::new(IndexAutoCreation::disabled());
        let results = run(&persistence, |txn| {
            txn.save_remote_document(remote("c/a", 1, 1));
            txn.save_remote_document(remote("c/b", 1, 7));
            txn.save_remote_document(remote("c/c", 10, 2));
            engine.get_documents_matching_query(
                txn,
                &n_below(5),
                SnapshotVersion::from_micros(5),
                &BTreeSet::from([key("c/a")]),
            )
        });
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("c/a"), key("c/c")]);
    }

    #[test]
    fn limit_query_refills_when_edge_document_changed() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::started());
        let engine = QueryEngine::new(IndexAutoCreation::disabled());
        let query = n_below(5)
            .with_order_by(OrderBy::ascending(FieldPath::from_single("n")))
            .limit_to_first(1);
        let results = run(&persistence, |txn| {
            txn.save_remote_document(remote("c/a", 9, 3));
            txn.save_remote_document(remote("c/b", 1, 1));
            engine.get_documents_matching_query(
                txn,
                &query,
                SnapshotVersion::from_micros(5),
                &BTreeSet::from([key("c/a")]),
            )
        });
        // The edge document is newer than the limbo-free version, so the
        // engine falls back to a full scan that also finds c/b.
        assert!(results.contains_key(&key("c/b")));
    }

    #[test]
    fn full_scan_creates_index_for_selective_query() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::started());
        let engine = QueryEngine::new(IndexAutoCreation {
            enabled: true,
            min_collection_size: 3,
            relative_index_read_cost_per_document: 1.0,
        });
        let query = n_below(1);
        run(&persistence, |txn| {
            for i in 0..5 {
                txn.save_remote_document(remote(&format!("c/{i}"), 1, i));
            }
            let results = engine.get_documents_matching_query(
                txn,
                &query,
                SnapshotVersion::min(),
                &BTreeSet::new(),
            );
            assert_eq!(results.len(), 1);
            assert_eq!(
                txn.index_manager.get_index_type(&query.to_target()),
                IndexType::Full
            );

            txn.add_mutation_batch(
                Timestamp::now(),
                Vec::new(),
                vec![Mutation::delete(key("c/0"))],
            );
            LocalDocumentsView::new(txn)
                .recalculate_and_save_overlays_for_document_keys(&BTreeSet::from([key("c/0")]));
            let after_delete = engine.get_documents_matching_query(
                txn,
                &query,
                SnapshotVersion::min(),
                &BTreeSet::new(),
            );
            assert!(after_delete.is_empty());
        });
    }
}
