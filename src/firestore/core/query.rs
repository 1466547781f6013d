use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::{Bound, Direction, FieldFilter, FilterOperator, OrderBy, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A query as the application sees it.
///
/// Results are ordered by the normalized order-by: the explicit order-bys,
/// then every inequality field not already ordered, then the document key.
/// Limit-to-last queries are executed by the backend as reversed
/// limit-to-first targets (see [`Query::to_target`]).
#[derive(Clone)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the documents of `path`. An even-length path makes a
    /// single-document query.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 != 1 {
            return Err(invalid_argument(format!(
                "Invalid collection path ({path}). Collection paths must have an odd number of segments"
            )));
        }
        Ok(Self::at_path(path))
    }

    /// Query over every collection named `collection_id`.
    pub fn collection_group(collection_id: impl Into<String>) -> FirestoreResult<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(format!(
                "Invalid collection ID '{collection_id}'. Collection IDs must not be empty or contain '/'"
            )));
        }
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id);
        Ok(query)
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds a `field <op> value` filter.
    pub fn where_field(
        self,
        field: &str,
        operator: FilterOperator,
        value: impl Into<FirestoreValue>,
    ) -> FirestoreResult<Self> {
        let field = FieldPath::from_dot_separated(field)?;
        Ok(self.with_filter(FieldFilter::new(field, operator, value.into())?))
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn order_by(self, field: &str, direction: Direction) -> FirestoreResult<Self> {
        let field = FieldPath::from_dot_separated(field)?;
        Ok(self.with_order_by(OrderBy::new(field, direction)))
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Rejects shapes that cannot be executed.
    pub fn validate(&self) -> FirestoreResult<()> {
        if self.limit_type == LimitType::Last && self.explicit_order_by.is_empty() {
            return Err(invalid_argument(
                "limitToLast() queries require specifying at least one orderBy() clause",
            ));
        }
        if self.limit == Some(0) {
            return Err(invalid_argument("Query limit must be greater than 0"));
        }
        Ok(())
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns the whole collection in key order.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    /// Fields restricted by inequality filters, sorted.
    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field().clone()).collect();
        let last_direction = result
            .last()
            .map(OrderBy::direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !seen.contains(&field) && !field.is_key_field() {
                seen.insert(field.clone());
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_path()) {
            result.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        result
    }

    /// Whether `doc` belongs to the result set, ignoring the limit.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.is_found_document()
            && self.matches_path(doc.key())
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field().is_key_field() || doc.field(order.field()).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        if self.start_at.is_none() && self.end_at.is_none() {
            return true;
        }
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Comparator over the normalized order-by. The key is always the last
    /// component, so distinct documents never compare equal.
    pub fn comparator(&self) -> DocumentComparator {
        DocumentComparator::new(self.normalized_order_by())
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by.iter().map(OrderBy::flipped).collect(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), bound.inclusive())),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), bound.inclusive())),
            },
        }
    }

    /// Same query rooted at a concrete collection; used to fan a collection
    /// group query out over its parents.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    /// Same query without a limit.
    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query
    }

    pub fn canonical_id(&self) -> String {
        let kind = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{kind}", self.to_target().canonical_id())
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.limit_type == other.limit_type && self.to_target() == other.to_target()
    }
}

impl Debug for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

/// Orders documents by a query's normalized order-by.
#[derive(Clone, Debug)]
pub struct DocumentComparator {
    order_by: Arc<Vec<OrderBy>>,
}

impl DocumentComparator {
    pub fn new(order_by: Vec<OrderBy>) -> Self {
        Self {
            order_by: Arc::new(order_by),
        }
    }

    /// Key order only.
    pub fn by_key() -> Self {
        Self::new(vec![OrderBy::ascending(FieldPath::key_path())])
    }

    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        for order in self.order_by.iter() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{MutableDocument, SnapshotVersion};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeMap;

    fn doc(path: &str, fields: Vec<(&str, FirestoreValue)>) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::new(
                fields
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect::<BTreeMap<_, _>>(),
            ),
        )
    }

    #[test]
    fn normalized_order_by_adds_inequalities_and_key() {
        let query = Query::collection("items")
            .unwrap()
            .where_field("b", FilterOperator::GreaterThan, 1)
            .unwrap()
            .where_field("a", FilterOperator::NotEqual, 1)
            .unwrap()
            .order_by("c", Direction::Descending)
            .unwrap();
        let fields: Vec<String> = query
            .normalized_order_by()
            .iter()
            .map(|o| format!("{}{}", o.field(), o.direction().as_str()))
            .collect();
        assert_eq!(fields, vec!["cdesc", "adesc", "bdesc", "__name__desc"]);
    }

    #[test]
    fn matches_only_direct_children() {
        let query = Query::collection("items").unwrap();
        assert!(query.matches(&doc("items/a", vec![])));
        assert!(!query.matches(&doc("items/a/sub/b", vec![])));
        assert!(!query.matches(&doc("other/a", vec![])));

        let group = Query::collection_group("sub").unwrap();
        assert!(group.matches(&doc("items/a/sub/b", vec![])));
        assert!(!group.matches(&doc("items/a", vec![])));
    }

    #[test]
    fn missing_order_by_field_excludes_document() {
        let query = Query::collection("items")
            .unwrap()
            .order_by("rank", Direction::Ascending)
            .unwrap();
        assert!(!query.matches(&doc("items/a", vec![])));
        assert!(query.matches(&doc("items/a", vec![("rank", 1.into())])));
    }

    #[test]
    fn comparator_breaks_ties_on_key() {
        let query = Query::collection("items")
            .unwrap()
            .order_by("rank", Direction::Ascending)
            .unwrap();
        let cmp = query.comparator();
        let a = doc("items/a", vec![("rank", 1.into())]);
        let b = doc("items/b", vec![("rank", 1.into())]);
        let c = doc("items/c", vec![("rank", 0.into())]);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
        assert_eq!(cmp.compare(&c, &a), Ordering::Less);
    }

    #[test]
    fn limit_to_last_target_flips_order_and_bounds() {
        let query = Query::collection("items")
            .unwrap()
            .order_by("rank", Direction::Ascending)
            .unwrap()
            .start_at(Bound::new(vec![1.into()], true))
            .limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by()[0].direction(), Direction::Descending);
        assert!(target.start_at().is_none());
        assert_eq!(target.end_at().map(Bound::inclusive), Some(true));
        assert!(query.canonical_id().ends_with("|lt:L"));
        assert_ne!(query.canonical_id(), query.clone().limit_to_first(2).canonical_id());
    }

    #[test]
    fn canonical_id_covers_every_component() {
        let query = Query::collection("items")
            .unwrap()
            .where_field("n", FilterOperator::Equal, 1)
            .unwrap()
            .limit_to_first(3);
        assert_eq!(
            query.canonical_id(),
            "items|f:n==1|ob:__name__asc|l:3|lt:F"
        );
    }

    #[test]
    fn limit_to_last_requires_order_by() {
        let query = Query::collection("items").unwrap().limit_to_last(1);
        assert!(query.validate().is_err());
    }
}
