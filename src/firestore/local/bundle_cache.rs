use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::model::SnapshotVersion;

/// Metadata of a loaded data bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleMetadata {
    pub id: String,
    pub version: i32,
    pub create_time: SnapshotVersion,
}

/// A query saved by name from a bundle, with the time its results were read.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

pub trait BundleCache {
    fn get_bundle_metadata(&self, bundle_id: &str) -> Option<BundleMetadata>;

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata);

    fn get_named_query(&self, name: &str) -> Option<NamedQuery>;

    fn save_named_query(&mut self, query: NamedQuery);
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBundleCache {
    bundles: BTreeMap<String, BundleMetadata>,
    named_queries: BTreeMap<String, NamedQuery>,
}

impl MemoryBundleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleCache for MemoryBundleCache {
    fn get_bundle_metadata(&self, bundle_id: &str) -> Option<BundleMetadata> {
        self.bundles.get(bundle_id).cloned()
    }

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata) {
        self.bundles.insert(metadata.id.clone(), metadata);
    }

    fn get_named_query(&self, name: &str) -> Option<NamedQuery> {
        self.named_queries.get(name).cloned()
    }

    fn save_named_query(&mut self, query: NamedQuery) {
        self.named_queries.insert(query.name.clone(), query);
    }
}
