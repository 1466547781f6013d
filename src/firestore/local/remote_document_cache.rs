use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::core::Query;
use crate::firestore::local::QueryContext;
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, SnapshotVersion};
use crate::util::hard_assert;

/// The latest server-confirmed version of every cached document.
pub trait RemoteDocumentCache {
    /// Stores `doc`, replacing any earlier entry. The document's read time
    /// must already be set.
    fn add_entry(&mut self, doc: MutableDocument);

    fn remove_entry(&mut self, key: &DocumentKey);

    /// Cached document, or an invalid document when the key is unknown.
    fn get_entry(&self, key: &DocumentKey) -> MutableDocument;

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument>;

    /// Every cached document in a collection with id `collection_group`,
    /// with an offset greater than `offset`.
    fn get_all_from_collection_group(
        &self,
        collection_group: &str,
        offset: &IndexOffset,
    ) -> BTreeMap<DocumentKey, MutableDocument>;

    /// Documents directly under the query's collection that were read after
    /// `offset` and either match the query or are in `mutated_keys`.
    fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: Option<&mut QueryContext>,
    ) -> BTreeMap<DocumentKey, MutableDocument>;

    fn document_keys(&self) -> Vec<DocumentKey>;

    /// Estimated byte size of all cached documents.
    fn get_size(&self) -> usize;
}

/// Cloning shares the entries; the first write to a clone copies them.
#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    docs: Arc<BTreeMap<DocumentKey, (MutableDocument, usize)>>,
    size: usize,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn shares_entries_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.docs, &other.docs)
    }
}

/// Size estimate of a cached document.
pub(crate) fn document_size(doc: &MutableDocument) -> usize {
    doc.key().path().canonical_string().len() + doc.data().estimate_byte_size()
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&mut self, doc: MutableDocument) {
        hard_assert(
            !doc.read_time().is_min() || !doc.is_valid_document(),
            "Cannot add a document with a read time of zero",
        );
        let size = document_size(&doc);
        let previous = Arc::make_mut(&mut self.docs).insert(doc.key().clone(), (doc, size));
        if let Some((_, previous_size)) = previous {
            self.size -= previous_size;
        }
        self.size += size;
    }

    fn remove_entry(&mut self, key: &DocumentKey) {
        if !self.docs.contains_key(key) {
            return;
        }
        if let Some((_, size)) = Arc::make_mut(&mut self.docs).remove(key) {
            self.size -= size;
        }
    }

    fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.docs
            .get(key)
            .map(|(doc, _)| doc.clone())
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    fn get_all_from_collection_group(
        &self,
        collection_group: &str,
        offset: &IndexOffset,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        self.docs
            .iter()
            .filter(|(key, (doc, _))| {
                key.has_collection_id(collection_group) && IndexOffset::from_document(doc) > *offset
            })
            .map(|(key, (doc, _))| (key.clone(), doc.clone()))
            .collect()
    }

    fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        mut context: Option<&mut QueryContext>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let collection = query.path();
        let immediate_children_length = collection.len() + 1;
        let mut results = BTreeMap::new();

        let scan = self
            .docs
            .range(DocumentKey::range_start(collection)..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()));
        for (key, (doc, _)) in scan {
            if let Some(context) = context.as_deref_mut() {
                context.increment_document_read_count(1);
            }
            if key.path().len() != immediate_children_length {
                continue;
            }
            if IndexOffset::from_document(doc) <= *offset {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(doc) {
                continue;
            }
            results.insert(key.clone(), doc.clone());
        }
        results
    }

    fn document_keys(&self) -> Vec<DocumentKey> {
        self.docs.keys().cloned().collect()
    }

    fn get_size(&self) -> usize {
        self.size
    }
}

/// Latest read time across `docs`.
pub(crate) fn max_read_time<'a>(docs: impl IntoIterator<Item = &'a MutableDocument>) -> SnapshotVersion {
    docs.into_iter()
        .map(MutableDocument::read_time)
        .max()
        .unwrap_or_else(SnapshotVersion::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{FieldFilter, FilterOperator};
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, micros: i64, n: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_single("n"), FirestoreValue::from_integer(n));
        let mut doc = MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(micros),
            data,
        );
        doc.set_read_time(SnapshotVersion::from_micros(micros));
        doc
    }

    #[test]
    fn tracks_size_across_replacements() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("c/a", 1, 1));
        let first = cache.get_size();
        cache.add_entry(doc("c/a", 2, 2));
        assert_eq!(cache.get_size(), first);
        cache.remove_entry(&DocumentKey::from_string("c/a").unwrap());
        assert_eq!(cache.get_size(), 0);
        assert!(!cache
            .get_entry(&DocumentKey::from_string("c/a").unwrap())
            .is_valid_document());
    }

    #[test]
    fn query_scan_honors_offset_children_and_mutated_keys() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("c/a", 1, 1));
        cache.add_entry(doc("c/b", 5, 2));
        cache.add_entry(doc("c/c", 5, 9));
        cache.add_entry(doc("c/b/sub/x", 5, 2));
        cache.add_entry(doc("d/a", 5, 2));

        let query = Query::collection("c").unwrap().with_filter(
            FieldFilter::new(
                FieldPath::from_single("n"),
                FilterOperator::LessThan,
                FirestoreValue::from_integer(5),
            )
            .unwrap(),
        );
        let mutated = BTreeSet::from([DocumentKey::from_string("c/c").unwrap()]);
        let mut context = QueryContext::default();
        let results = cache.get_documents_matching_query(
            &query,
            &IndexOffset::new(SnapshotVersion::from_micros(2), None, -1),
            &mutated,
            Some(&mut context),
        );
        let keys: Vec<String> = results.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["c/b", "c/c"]);
        assert_eq!(context.document_read_count(), 4);
    }
}
