use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Identifies a document: a resource path with an even number of segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Invalid document path ({path}). Document keys must have an even number of segments"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn from_segments<I, S>(segments: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_path(ResourcePath::from_segments(segments))
    }

    /// Key at the root path; sorts before every real key.
    pub(crate) fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    /// Sorts before every document nested under `collection`. Only meant as
    /// the lower bound of a range scan.
    pub(crate) fn range_start(collection: &ResourcePath) -> Self {
        Self {
            path: collection.clone(),
        }
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        path.len() >= 2 && path.len() % 2 == 0
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// Id of the collection that directly contains the document.
    pub fn collection_group(&self) -> &str {
        self.path.segment(self.path.len() - 2).unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("cities").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(DocumentKey::from_string("cities/sf/landmarks").is_err());
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("cities/sf/landmarks/bridge").unwrap();
        assert_eq!(key.id(), "bridge");
        assert_eq!(key.collection_group(), "landmarks");
        assert_eq!(key.collection_path().canonical_string(), "cities/sf/landmarks");
    }

    #[test]
    fn keys_order_by_path() {
        let a = DocumentKey::from_string("items/a").unwrap();
        let b = DocumentKey::from_string("items/b").unwrap();
        let nested = DocumentKey::from_string("items/a/sub/x").unwrap();
        assert!(a < b);
        assert!(a < nested);
        assert!(nested < b);
    }
}
