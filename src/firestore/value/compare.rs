use std::cmp::Ordering;

use crate::firestore::model::ResourcePath;
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Position of a value's type in the cross-type sort order.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp(_) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
        ValueKind::Sentinel(_) => 11,
    }
}

/// Total order over values. Values of different types order by
/// [`type_order`]; integers and doubles compare numerically with NaN first.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_integer_to_double(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => {
            compare_integer_to_double(*r, *l).reverse()
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time.cmp(&r.local_write_time)
        }
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
            compare_doubles(l.latitude(), r.latitude())
                .then_with(|| compare_doubles(l.longitude(), r.longitude()))
        }
        (ValueKind::Array(l), ValueKind::Array(r)) => compare_arrays(l, r),
        (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
        _ => Ordering::Equal,
    }
}

/// Equality used for document data: integers never equal doubles, NaN
/// equals NaN and `-0.0` differs from `0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            if l.is_nan() || r.is_nan() {
                l.is_nan() && r.is_nan()
            } else {
                l.to_bits() == r.to_bits()
            }
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time == r.local_write_time
        }
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l
                    .values()
                    .iter()
                    .zip(r.values())
                    .all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields().iter().all(|(key, value)| {
                    r.fields()
                        .get(key)
                        .map(|other| values_equal(value, other))
                        .unwrap_or(false)
                })
        }
        (ValueKind::Sentinel(l), ValueKind::Sentinel(r)) => l == r,
        _ => false,
    }
}

pub fn array_contains(array: &ArrayValue, needle: &FirestoreValue) -> bool {
    array.values().iter().any(|value| values_equal(value, needle))
}

/// Stable textual form of a value, used to build canonical query ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => {
            if value.fract() == 0.0 && value.is_finite() {
                format!("{value:.1}")
            } else {
                value.to_string()
            }
        }
        ValueKind::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
        ValueKind::ServerTimestamp(pending) => format!(
            "serverTimestamp({},{})",
            pending.local_write_time.seconds, pending.local_write_time.nanos
        ),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(bytes) => bytes.to_base64(),
        ValueKind::Reference(path) => path.clone(),
        ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
        ValueKind::Array(array) => {
            let parts: Vec<String> = array.values().iter().map(canonical_id).collect();
            format!("[{}]", parts.join(","))
        }
        ValueKind::Map(map) => {
            let parts: Vec<String> = map
                .fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_id(value)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        ValueKind::Sentinel(sentinel) => format!("sentinel({sentinel:?})"),
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_integer_to_double(left: i64, right: f64) -> Ordering {
    if right.is_nan() {
        return Ordering::Greater;
    }
    match (left as f64).partial_cmp(&right) {
        Some(Ordering::Equal) | None => {
            // Same magnitude once widened; settle on the integral part.
            if right >= i64::MAX as f64 {
                Ordering::Less
            } else if right <= i64::MIN as f64 {
                Ordering::Greater
            } else {
                left.cmp(&(right as i64))
                    .then_with(|| compare_doubles(0.0, right.fract()))
            }
        }
        Some(ordering) => ordering,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_path = ResourcePath::from_segments(left.split('/').filter(|s| !s.is_empty()));
    let right_path = ResourcePath::from_segments(right.split('/').filter(|s| !s.is_empty()));
    left_path.cmp(&right_path)
}

fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
    for (l, r) in left.values().iter().zip(right.values()) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.values().len().cmp(&right.values().len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((left_key, left_value), (right_key, right_value)) in
        left.fields().iter().zip(right.fields())
    {
        let ordering = left_key
            .cmp(right_key)
            .then_with(|| compare_values(left_value, right_value));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.fields().len().cmp(&right.fields().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_timestamp(Timestamp::new(10, 0)),
            FirestoreValue::pending_server_timestamp(Timestamp::new(1, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_reference("a/b"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                compare_values(&pair[0], &pair[1]),
                Ordering::Less,
                "{:?} should sort before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn integers_and_doubles_compare_but_are_not_equal() {
        let one = FirestoreValue::from_integer(1);
        let one_double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&one, &one_double), Ordering::Equal);
        assert!(!values_equal(&one, &one_double));
        assert_eq!(
            compare_values(&FirestoreValue::from_integer(2), &FirestoreValue::from_double(1.5)),
            Ordering::Greater
        );
    }

    #[test]
    fn nan_equals_nan_and_signed_zeros_differ() {
        let nan = FirestoreValue::from_double(f64::NAN);
        assert!(values_equal(&nan, &nan.clone()));
        assert!(!values_equal(
            &FirestoreValue::from_double(0.0),
            &FirestoreValue::from_double(-0.0)
        ));
    }

    #[test]
    fn arrays_compare_elementwise_then_by_length() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        let bigger = FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
        assert_eq!(compare_values(&long, &bigger), Ordering::Less);
    }

    #[test]
    fn canonical_ids_are_stable() {
        let value = FirestoreValue::from_map(BTreeMap::from([
            ("b".to_string(), FirestoreValue::from_double(2.0)),
            ("a".to_string(), FirestoreValue::from_array(vec![FirestoreValue::null()])),
        ]));
        assert_eq!(canonical_id(&value), "{a:[null],b:2.0}");
    }
}
