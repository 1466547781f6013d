use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{values_equal, ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Write-time sentinels accepted in user data. They are turned into field
/// transforms (or deletes) before a mutation is built and never reach the
/// cache.
#[derive(Clone, Debug, PartialEq)]
pub enum SentinelValue {
    Delete,
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(Box<FirestoreValue>),
}

/// Local stand-in for a server timestamp that the backend has not resolved
/// yet. Sorts after every concrete timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingServerTimestamp {
    pub local_write_time: Timestamp,
    pub previous_value: Option<Box<FirestoreValue>>,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    ServerTimestamp(PendingServerTimestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
    Sentinel(SentinelValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self::from_kind(ValueKind::Null)
    }

    pub fn from_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_kind(ValueKind::Boolean(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Self::from_kind(ValueKind::Integer(value))
    }

    pub fn from_double(value: f64) -> Self {
        Self::from_kind(ValueKind::Double(value))
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self::from_kind(ValueKind::Timestamp(value))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::String(value.into()))
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self::from_kind(ValueKind::Bytes(value))
    }

    /// Reference to another document, given as a path relative to the
    /// database root (`rooms/eros`).
    pub fn from_reference(path: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::Reference(path.into()))
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self::from_kind(ValueKind::GeoPoint(value))
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Array(ArrayValue::new(values)))
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Map(MapValue::new(map)))
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self::from_kind(ValueKind::Map(map))
    }

    pub fn pending_server_timestamp(
        local_write_time: Timestamp,
        previous_value: Option<FirestoreValue>,
    ) -> Self {
        // Chains of pending timestamps keep the oldest concrete value.
        let previous_value = match previous_value {
            Some(FirestoreValue {
                kind: ValueKind::ServerTimestamp(pending),
            }) => pending.previous_value,
            other => other.map(Box::new),
        };
        Self::from_kind(ValueKind::ServerTimestamp(PendingServerTimestamp {
            local_write_time,
            previous_value,
        }))
    }

    /// Sentinel that removes the field in `update` and merging `set` writes.
    pub fn delete_field() -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::Delete))
    }

    /// Sentinel that populates the field with the commit time.
    pub fn server_timestamp() -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::ServerTimestamp))
    }

    /// Sentinel that unions the provided elements with an existing array field.
    pub fn array_union(elements: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::ArrayUnion(elements)))
    }

    /// Sentinel that removes the provided elements from an existing array field.
    pub fn array_remove(elements: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::ArrayRemove(elements)))
    }

    /// Sentinel that increments the targeted numeric field by `operand`.
    pub fn numeric_increment(operand: FirestoreValue) -> Self {
        Self::from_kind(ValueKind::Sentinel(SentinelValue::NumericIncrement(
            Box::new(operand),
        )))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ValueKind {
        &mut self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Double(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }

    /// Rough in-memory footprint used for cache-size accounting.
    pub fn estimate_byte_size(&self) -> usize {
        match &self.kind {
            ValueKind::Null | ValueKind::Boolean(_) => 4,
            ValueKind::Integer(_) | ValueKind::Double(_) => 8,
            ValueKind::Timestamp(_) => 16,
            ValueKind::ServerTimestamp(pending) => {
                16 + pending
                    .previous_value
                    .as_ref()
                    .map(|value| value.estimate_byte_size())
                    .unwrap_or(0)
            }
            ValueKind::String(value) => value.len() * 2,
            ValueKind::Bytes(bytes) => bytes.as_slice().len(),
            ValueKind::Reference(path) => path.len(),
            ValueKind::GeoPoint(_) => 16,
            ValueKind::Array(array) => array
                .values()
                .iter()
                .map(FirestoreValue::estimate_byte_size)
                .sum(),
            ValueKind::Map(map) => map.estimate_byte_size(),
            ValueKind::Sentinel(_) => 0,
        }
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<i32> for FirestoreValue {
    fn from(value: i32) -> Self {
        Self::from_integer(i64::from(value))
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        assert_eq!(v.as_str(), Some("hello"));
        assert!(FirestoreValue::from_integer(1).is_number());
        assert!(FirestoreValue::from_double(f64::NAN).is_nan());
    }

    #[test]
    fn pending_timestamps_keep_first_previous_value() {
        let first = FirestoreValue::pending_server_timestamp(
            Timestamp::new(1, 0),
            Some(FirestoreValue::from_integer(7)),
        );
        let second = FirestoreValue::pending_server_timestamp(Timestamp::new(2, 0), Some(first));
        match second.kind() {
            ValueKind::ServerTimestamp(pending) => {
                assert_eq!(pending.local_write_time, Timestamp::new(2, 0));
                assert_eq!(
                    pending.previous_value.as_deref(),
                    Some(&FirestoreValue::from_integer(7))
                );
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn estimates_nested_sizes() {
        let value = FirestoreValue::from_map(BTreeMap::from([
            ("name".to_string(), FirestoreValue::from_string("ab")),
            ("n".to_string(), FirestoreValue::from_integer(1)),
        ]));
        assert_eq!(value.estimate_byte_size(), (4 + 4) + (1 + 8));
    }
}
