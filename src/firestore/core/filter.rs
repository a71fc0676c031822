use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{compare_values, type_order, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
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
            FilterOperator::In => "in",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::NotIn => "not-in",
        }
    }

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

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

impl Display for FilterOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    /// Validates operator/value combinations the backend would reject.
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        let needs_array = matches!(
            op,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        );
        if needs_array && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Invalid Query. A non-empty array is required for '{op}' filters."
            )));
        }
        if field.is_key_field() && !matches!(value.kind(), ValueKind::Reference(_) | ValueKind::Array(_)) {
            return Err(invalid_argument(
                "Invalid Query. When querying with the document id field, the value must be a document reference.",
            ));
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }
        let other = document.field(&self.field);
        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array.values().iter().any(|item| item == &self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => match (other.and_then(FirestoreValue::as_array), self.value.as_array()) {
                (Some(array), Some(needles)) => array
                    .values()
                    .iter()
                    .any(|item| needles.values().iter().any(|needle| needle == item)),
                _ => false,
            },
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.values().iter().any(|c| c == other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.values().iter().any(FirestoreValue::is_null) {
                    return false;
                }
                match other {
                    Some(other) => !candidates.values().iter().any(|c| c == other),
                    None => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(other) if !other.is_null() => {
                    self.op.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
            _ => match other {
                Some(other) if type_order(other) == type_order(&self.value) => {
                    self.op.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            FilterOperator::In | FilterOperator::NotIn => {
                let keys: Vec<DocumentKey> = self
                    .value
                    .as_array()
                    .map(|array| array.values().iter().filter_map(key_from_reference).collect())
                    .unwrap_or_default();
                let contained = keys.iter().any(|candidate| candidate == key);
                if self.op == FilterOperator::In {
                    contained
                } else {
                    !contained
                }
            }
            _ => match key_from_reference(&self.value) {
                Some(other) => self.op.matches_comparison(key.cmp(&other)),
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_id()
        )
    }
}

/// Extracts the document key from a fully qualified reference value.
pub(crate) fn key_from_reference(value: &FirestoreValue) -> Option<DocumentKey> {
    let ValueKind::Reference(name) = value.kind() else {
        return None;
    };
    let path = ResourcePath::from_string(name).ok()?;
    // projects/{p}/databases/{d}/documents/...
    let relative = if path.segment(0) == Some("projects") && path.segment(4) == Some("documents") {
        path.pop_first_n(5)
    } else {
        path
    };
    DocumentKey::from_path(relative).ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    pub op: CompositeOperator,
    pub filters: Vec<Filter>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::And => composite.filters.iter().all(|f| f.matches(document)),
                CompositeOperator::Or => composite.filters.iter().any(|f| f.matches(document)),
            },
        }
    }

    /// Every field filter reachable from this filter.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .flat_map(|filter| filter.flattened())
                .collect(),
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) => {
                let parts: Vec<String> = composite.filters.iter().map(Filter::canonical_id).collect();
                let is_flat_and = composite.op == CompositeOperator::And
                    && composite.filters.iter().all(|f| matches!(f, Filter::Field(_)));
                if is_flat_and {
                    parts.join("")
                } else {
                    let op = match composite.op {
                        CompositeOperator::And => "and",
                        CompositeOperator::Or => "or",
                    };
                    format!("{op}({})", parts.join(","))
                }
            }
        }
    }
}

impl From<FieldFilter> for Filter {
    fn from(value: FieldFilter) -> Self {
        Filter::Field(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, SnapshotVersion, Timestamp};

    fn doc(path: &str, field: &str, value: FirestoreValue) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), value);
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn filter(field: &str, op: FilterOperator, value: FirestoreValue) -> FieldFilter {
        FieldFilter::new(FieldPath::from_dot_separated(field).unwrap(), op, value).unwrap()
    }

    #[test]
    fn comparison_requires_same_type() {
        let document = doc("c/a", "n", "5".into());
        assert!(!filter("n", FilterOperator::LessThan, 10i64.into()).matches(&document));
        let document = doc("c/a", "n", 5i64.into());
        assert!(filter("n", FilterOperator::LessThan, 10.5f64.into()).matches(&document));
    }

    #[test]
    fn not_equal_skips_missing_and_null() {
        let missing = doc("c/a", "other", 1i64.into());
        let null = doc("c/b", "n", FirestoreValue::null());
        let f = filter("n", FilterOperator::NotEqual, 1i64.into());
        assert!(!f.matches(&missing));
        assert!(!f.matches(&null));
        assert!(f.matches(&doc("c/c", "n", 2i64.into())));
    }

    #[test]
    fn array_operators() {
        let document = doc("c/a", "tags", FirestoreValue::from_array(vec!["x".into(), "y".into()]));
        assert!(filter("tags", FilterOperator::ArrayContains, "x".into()).matches(&document));
        assert!(filter(
            "tags",
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["z".into(), "y".into()])
        )
        .matches(&document));
        let err = FieldFilter::new(
            FieldPath::from_dot_separated("tags").unwrap(),
            FilterOperator::In,
            "x".into(),
        )
        .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn or_filter_matches_any() {
        let document = doc("c/a", "n", 3i64.into());
        let or = Filter::Composite(CompositeFilter {
            op: CompositeOperator::Or,
            filters: vec![
                filter("n", FilterOperator::Equal, 1i64.into()).into(),
                filter("n", FilterOperator::Equal, 3i64.into()).into(),
            ],
        });
        assert!(or.matches(&document));
        assert_eq!(or.canonical_id(), "or(n==1,n==3)");
    }

    #[test]
    fn key_filters_compare_document_keys() {
        let document = doc("c/b", "n", 1i64.into());
        let f = FieldFilter::new(
            FieldPath::document_id(),
            FilterOperator::GreaterThan,
            FirestoreValue::from_reference("projects/p/databases/(default)/documents/c/a"),
        )
        .unwrap();
        assert!(f.matches(&document));
    }
}
