use crate::firestore::core::{Bound, FieldFilter, OrderBy};
use crate::firestore::model::{DocumentKey, ResourcePath, TargetId};

/// What the backend is asked to watch: a query stripped of limit-to-last
/// handling, with its order-by already normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub(crate) path: ResourcePath,
    pub(crate) collection_group: Option<String>,
    pub(crate) filters: Vec<FieldFilter>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) limit: Option<u32>,
    pub(crate) start_at: Option<Bound>,
    pub(crate) end_at: Option<Bound>,
}

impl Target {
    /// Target that watches a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(FieldFilter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        id.push_str("|ob:");
        id.push_str(
            &self
                .order_by
                .iter()
                .map(OrderBy::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if start.inclusive() { "b:" } else { "a:" });
            id.push_str(&start.canonical_position());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if end.inclusive() { "a:" } else { "b:" });
            id.push_str(&end.canonical_position());
        }
        id
    }
}

/// Hands out target ids. Ids from the target cache are even, ids for limbo
/// resolutions allocated by the sync engine are odd, so the two never clash.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Generator for cached query targets, continuing after `highest`.
    pub fn for_target_cache(highest: TargetId) -> Self {
        let mut next_id = highest + 1;
        if next_id % 2 != 0 {
            next_id += 1;
        }
        Self {
            next_id: next_id.max(2),
        }
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next_id(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}
