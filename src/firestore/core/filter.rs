use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, FieldPath, ResourcePath};
use crate::firestore::value::{
    array_contains, canonical_id, compare_values, type_order, FirestoreValue, ValueKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    /// Operators that restrict a field to a range; such fields are folded
    /// into the normalized order-by of a query.
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array_operand(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContainsAny | FilterOperator::In | FilterOperator::NotIn
        )
    }
}

impl Display for FilterOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single `field <op> value` predicate.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(
        field: FieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        if operator.takes_array_operand() {
            let Some(array) = value.as_array() else {
                return Err(invalid_argument(format!(
                    "Invalid Query. A non-empty array is required for '{operator}' filters."
                )));
            };
            if array.values().is_empty() {
                return Err(invalid_argument(format!(
                    "Invalid Query. A non-empty array is required for '{operator}' filters."
                )));
            }
        }
        if field.is_key_field() {
            if matches!(
                operator,
                FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
            ) {
                return Err(invalid_argument(format!(
                    "Invalid Query. You can't perform '{operator}' queries on the document id."
                )));
            }
            let references_only = match value.kind() {
                ValueKind::Reference(_) => true,
                ValueKind::Array(array) if operator.takes_array_operand() => array
                    .values()
                    .iter()
                    .all(|v| matches!(v.kind(), ValueKind::Reference(_))),
                _ => false,
            };
            if !references_only {
                return Err(invalid_argument(
                    "Invalid Query. Document id filters must compare against document references.",
                ));
            }
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.operator.is_inequality()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(doc.key().path());
        }

        self.matches_value(doc.field(&self.field))
    }

    /// Evaluates the filter against the value of its field, `None` when the
    /// field is absent. Key filters are not supported here.
    pub(crate) fn matches_value(&self, other: Option<&FirestoreValue>) -> bool {
        match self.operator {
            FilterOperator::NotEqual => match other {
                Some(other) if !other.is_null() => {
                    self.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array_contains(array, &self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => {
                let (Some(array), Some(needles)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                needles
                    .values()
                    .iter()
                    .any(|needle| array_contains(array, needle))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => array_contains(candidates, other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if array_contains(candidates, &FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(other) if !other.is_null() => !array_contains(candidates, other),
                    _ => false,
                }
            }
            _ => match other {
                Some(other) if type_order(other) == type_order(&self.value) => {
                    self.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_key(&self, path: &ResourcePath) -> bool {
        match self.operator {
            FilterOperator::In | FilterOperator::NotIn => {
                let contained = self
                    .value
                    .as_array()
                    .map(|array| {
                        array
                            .values()
                            .iter()
                            .filter_map(reference_path)
                            .any(|candidate| &candidate == path)
                    })
                    .unwrap_or(false);
                if self.operator == FilterOperator::In {
                    contained
                } else {
                    !contained
                }
            }
            _ => match reference_path(&self.value) {
                Some(reference) => self.matches_comparison(path.cmp(&reference)),
                None => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.operator {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonical_id(&self.value)
        )
    }
}

/// Path of a reference value, if `value` is one.
pub(crate) fn reference_path(value: &FirestoreValue) -> Option<ResourcePath> {
    match value.kind() {
        ValueKind::Reference(reference) => ResourcePath::from_string(reference).ok(),
        _ => None,
    }
}
