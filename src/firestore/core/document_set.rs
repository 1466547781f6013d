use std::collections::BTreeMap;

use crate::firestore::core::DocumentComparator;
use crate::firestore::model::{Document, DocumentKey};

/// Documents kept in query order, with key lookup.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Empty set with the same ordering.
    pub fn empty_like(&self) -> Self {
        Self::new(self.comparator.clone())
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.by_key.get(key)?;
        self.position(doc).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> + '_ {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> + '_ {
        self.sorted.iter().map(Document::key)
    }

    /// Inserts `doc`, replacing any document with the same key.
    pub fn add(&mut self, doc: Document) {
        self.delete(doc.key());
        let index = match self.position(&doc) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(doc.key().clone(), doc.clone());
        self.sorted.insert(index, doc);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        }
        Some(existing)
    }

    fn position(&self, doc: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| self.comparator.compare(probe, doc))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .sorted
                .iter()
                .zip(other.sorted.iter())
                .all(|(left, right)| left.key() == right.key() && left.has_same_contents(right))
    }
}
