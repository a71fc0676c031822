use std::cmp::Ordering;

use crate::firestore::model::ResourcePath;
use crate::firestore::value::{FirestoreValue, SentinelValue, ValueKind};

const TYPE_ORDER_NULL: u8 = 0;
const TYPE_ORDER_BOOLEAN: u8 = 1;
const TYPE_ORDER_NUMBER: u8 = 2;
const TYPE_ORDER_TIMESTAMP: u8 = 3;
const TYPE_ORDER_SERVER_TIMESTAMP: u8 = 4;
const TYPE_ORDER_STRING: u8 = 5;
const TYPE_ORDER_BYTES: u8 = 6;
const TYPE_ORDER_REFERENCE: u8 = 7;
const TYPE_ORDER_GEO_POINT: u8 = 8;
const TYPE_ORDER_ARRAY: u8 = 9;
const TYPE_ORDER_MAP: u8 = 10;
const TYPE_ORDER_SENTINEL: u8 = 11;

/// Position of the value's type in the cross-type sort order.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => TYPE_ORDER_NULL,
        ValueKind::Boolean(_) => TYPE_ORDER_BOOLEAN,
        ValueKind::Integer(_) | ValueKind::Double(_) => TYPE_ORDER_NUMBER,
        ValueKind::Timestamp(_) => TYPE_ORDER_TIMESTAMP,
        ValueKind::ServerTimestamp(_) => TYPE_ORDER_SERVER_TIMESTAMP,
        ValueKind::String(_) => TYPE_ORDER_STRING,
        ValueKind::Bytes(_) => TYPE_ORDER_BYTES,
        ValueKind::Reference(_) => TYPE_ORDER_REFERENCE,
        ValueKind::GeoPoint(_) => TYPE_ORDER_GEO_POINT,
        ValueKind::Array(_) => TYPE_ORDER_ARRAY,
        ValueKind::Map(_) => TYPE_ORDER_MAP,
        ValueKind::Sentinel(_) => TYPE_ORDER_SENTINEL,
    }
}

/// Total order over values: by type first, then within the type.
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
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*r, *l).reverse(),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time.cmp(&r.local_write_time)
        }
        (ValueKind::String(l), ValueKind::String(r)) => l.as_bytes().cmp(r.as_bytes()),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (lv, rv) in l.values().iter().zip(r.values().iter()) {
                match compare_values(lv, rv) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((lk, lv), (rk, rv)) in l.fields().iter().zip(r.fields().iter()) {
                match lk.as_bytes().cmp(rk.as_bytes()) {
                    Ordering::Equal => {}
                    other => return other,
                }
                match compare_values(lv, rv) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number and equals itself.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(left: i64, right: f64) -> Ordering {
    if right.is_nan() {
        return Ordering::Greater;
    }
    compare_doubles(left as f64, right).then_with(|| {
        // Both round to the same double; fall back to the exact integer part.
        if right >= i64::MAX as f64 {
            Ordering::Less
        } else if right <= i64::MIN as f64 {
            Ordering::Greater
        } else {
            left.cmp(&(right as i64))
        }
    })
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left = ResourcePath::from_segments(left.split('/').filter(|s| !s.is_empty()));
    let right = ResourcePath::from_segments(right.split('/').filter(|s| !s.is_empty()));
    ResourcePath::comparator(&left, &right)
}

/// Equality as observed by queries: integers and doubles are distinct values,
/// NaN equals NaN, and `-0.0` differs from `0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
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
                && l.values()
                    .iter()
                    .zip(r.values().iter())
                    .all(|(lv, rv)| values_equal(lv, rv))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields()
                    .iter()
                    .zip(r.fields().iter())
                    .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        (ValueKind::Sentinel(l), ValueKind::Sentinel(r)) => l == r,
        _ => false,
    }
}

pub(crate) fn canonical_id(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => format!("{value:?}"),
        ValueKind::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
        ValueKind::ServerTimestamp(placeholder) => format!(
            "server_timestamp({},{})",
            placeholder.local_write_time.seconds, placeholder.local_write_time.nanos
        ),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(bytes) => bytes.to_base64(),
        ValueKind::Reference(name) => name.clone(),
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
        ValueKind::Sentinel(sentinel) => match sentinel {
            SentinelValue::ServerTimestamp => "serverTimestamp()".to_string(),
            SentinelValue::Delete => "deleteField()".to_string(),
            SentinelValue::ArrayUnion(values) => format!(
                "arrayUnion({})",
                values.iter().map(canonical_id).collect::<Vec<_>>().join(",")
            ),
            SentinelValue::ArrayRemove(values) => format!(
                "arrayRemove({})",
                values.iter().map(canonical_id).collect::<Vec<_>>().join(",")
            ),
            SentinelValue::NumericIncrement(operand) => {
                format!("increment({})", canonical_id(operand))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{GeoPoint, Timestamp};
    use crate::firestore::value::BytesValue;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::server_timestamp_placeholder(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_bytes(BytesValue::new(vec![0])),
            FirestoreValue::from_reference("projects/p/databases/d/documents/c/a"),
            FirestoreValue::from_geo_point(GeoPoint::new(0.0, 0.0).unwrap()),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                compare_values(&window[0], &window[1]),
                Ordering::Less,
                "{:?} should sort before {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn integers_and_doubles_compare_numerically() {
        let one = FirestoreValue::from_integer(1);
        let one_double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&one, &one_double), Ordering::Equal);
        assert_ne!(one, one_double);
    }

    #[test]
    fn nan_equals_nan() {
        assert_eq!(
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(f64::NAN)
        );
    }

    #[test]
    fn canonical_ids_are_stable() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), FirestoreValue::from_integer(2));
        map.insert("a".to_string(), FirestoreValue::from_array(vec![
            FirestoreValue::from_bool(true),
            FirestoreValue::null(),
        ]));
        assert_eq!(
            FirestoreValue::from_map(map).canonical_id(),
            "{a:[true,null],b:2}"
        );
        assert_eq!(FirestoreValue::from_double(1.0).canonical_id(), "1.0");
    }
}
