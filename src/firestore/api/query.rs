use crate::firestore::core::{
    Bound, ChangeType, Direction, FilterOperator, LimitType, OrderBy, Query as CoreQuery, ViewSnapshot,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::remote::JsonProtoSerializer;
use crate::firestore::value::{FirestoreValue, ValueKind};

use super::snapshot::{DocumentSnapshot, SnapshotMetadata};
use super::user_data::parse_query_value;
use super::Firestore;

/// A query over a collection or collection group.
///
/// Builder methods return a new query; the receiver is left untouched.
#[derive(Clone, Debug)]
pub struct Query {
    firestore: Firestore,
    query: CoreQuery,
}

impl Query {
    pub(crate) fn new(firestore: Firestore, query: CoreQuery) -> Self {
        Self { firestore, query }
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    pub(crate) fn core_query(&self) -> &CoreQuery {
        &self.query
    }

    /// Adds a field filter. `field` is a dot-separated path; `__name__`
    /// filters on the document key and accepts plain document ids.
    pub fn where_field(
        &self,
        field: &str,
        op: FilterOperator,
        value: impl Into<FirestoreValue>,
    ) -> FirestoreResult<Self> {
        let path = FieldPath::from_dot_separated(field)?;
        let value = parse_query_value(value.into())?;
        let value = if path.is_key_field() {
            self.key_filter_value(op, value)?
        } else {
            value
        };
        Ok(self.with(self.query.where_field(path, op, value)?))
    }

    pub fn order_by(&self, field: &str, direction: Direction) -> FirestoreResult<Self> {
        let path = FieldPath::from_dot_separated(field)?;
        Ok(self.with(self.query.with_order_by(OrderBy::new(path, direction))?))
    }

    pub fn limit(&self, limit: i64) -> FirestoreResult<Self> {
        Ok(self.with(self.query.with_limit(limit, LimitType::First)?))
    }

    pub fn limit_to_last(&self, limit: i64) -> FirestoreResult<Self> {
        Ok(self.with(self.query.with_limit(limit, LimitType::Last)?))
    }

    pub fn start_at(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound(values, true)?;
        Ok(self.with(self.query.with_start_at(bound)))
    }

    pub fn start_after(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound(values, false)?;
        Ok(self.with(self.query.with_start_at(bound)))
    }

    pub fn end_at(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound(values, true)?;
        Ok(self.with(self.query.with_end_at(bound)))
    }

    pub fn end_before(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        let bound = self.bound(values, false)?;
        Ok(self.with(self.query.with_end_at(bound)))
    }

    /// Rejects queries the backend cannot serve as a listener target.
    pub(crate) fn validate_has_explicit_order_by_for_limit_to_last(&self) -> FirestoreResult<()> {
        if self.query.has_limit_to_last() && self.query.explicit_order_by.is_empty() {
            return Err(invalid_argument(
                "limit_to_last() queries require specifying at least one order_by() clause",
            ));
        }
        Ok(())
    }

    fn with(&self, query: CoreQuery) -> Self {
        Self {
            firestore: self.firestore.clone(),
            query,
        }
    }

    fn bound(&self, values: Vec<FirestoreValue>, inclusive: bool) -> FirestoreResult<Bound> {
        let order_by = self.query.normalized_order_by();
        if values.len() > order_by.len() {
            return Err(invalid_argument(
                "Too many arguments provided to a cursor. The number of arguments must be less than or equal \
                 to the number of order_by() clauses.",
            ));
        }
        let mut position = Vec::with_capacity(values.len());
        for (value, order_by) in values.into_iter().zip(order_by.iter()) {
            let value = parse_query_value(value)?;
            if order_by.field.is_key_field() {
                position.push(self.document_id_value(value)?);
            } else {
                position.push(value);
            }
        }
        Ok(Bound::new(position, inclusive))
    }

    fn key_filter_value(&self, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<FirestoreValue> {
        match op {
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny => Err(invalid_argument(format!(
                "Invalid query. You can't perform '{}' queries on the document id.",
                op.as_str()
            ))),
            FilterOperator::In | FilterOperator::NotIn => {
                let Some(array) = value.as_array() else {
                    return Err(invalid_argument(format!(
                        "Invalid query. A non-empty array is required for '{}' filters.",
                        op.as_str()
                    )));
                };
                let references = array
                    .values()
                    .iter()
                    .cloned()
                    .map(|element| self.document_id_value(element))
                    .collect::<FirestoreResult<Vec<_>>>()?;
                Ok(FirestoreValue::from_array(references))
            }
            _ => self.document_id_value(value),
        }
    }

    /// Turns a document id (or a relative path for collection groups) into a
    /// reference value.
    fn document_id_value(&self, value: FirestoreValue) -> FirestoreResult<FirestoreValue> {
        let id = match value.kind() {
            ValueKind::Reference(_) => return Ok(value),
            ValueKind::String(id) => id.clone(),
            _ => {
                return Err(invalid_argument(
                    "Invalid query. When querying by document id you must provide a valid document id string.",
                ))
            }
        };
        if id.is_empty() {
            return Err(invalid_argument(
                "Invalid query. When querying by document id you must provide a valid document id, \
                 not an empty string.",
            ));
        }
        let path = if self.query.is_collection_group_query() {
            ResourcePath::from_string(&id)?
        } else {
            if id.contains('/') {
                return Err(invalid_argument(format!(
                    "Invalid query. When querying a collection by document id you must provide a plain \
                     document id, but '{id}' contains a '/' character."
                )));
            }
            self.query.path.child([id])
        };
        let key = DocumentKey::from_path(path)?;
        let serializer = JsonProtoSerializer::new(self.firestore.database_id().clone());
        Ok(FirestoreValue::from_reference(serializer.document_name(&key)))
    }
}

/// A document-level change between two query snapshots.
#[derive(Clone, Debug)]
pub struct DocumentChange {
    pub change_type: DocumentChangeType,
    pub document: DocumentSnapshot,
    /// Position before the change; `None` for additions.
    pub old_index: Option<usize>,
    /// Position after the change; `None` for removals.
    pub new_index: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

/// The results of a query at one point in time.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    snapshot: ViewSnapshot,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub(crate) fn new(query: Query, snapshot: ViewSnapshot) -> Self {
        let metadata = SnapshotMetadata::new(snapshot.from_cache, snapshot.has_pending_writes());
        Self {
            query,
            snapshot,
            metadata,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Document snapshots in query order.
    pub fn documents(&self) -> Vec<DocumentSnapshot> {
        self.snapshot
            .documents
            .iter()
            .map(|document| self.document_snapshot(document.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot.documents.len()
    }

    /// Changes since the previous snapshot. Metadata-only changes are
    /// reported as `Modified` when `include_metadata_changes` is set and
    /// skipped otherwise.
    pub fn doc_changes(&self, include_metadata_changes: bool) -> Vec<DocumentChange> {
        let mut documents = self.snapshot.old_documents.clone();
        let mut changes = Vec::with_capacity(self.snapshot.document_changes.len());
        for change in &self.snapshot.document_changes {
            if change.change_type == ChangeType::Metadata && !include_metadata_changes {
                continue;
            }
            let key = change.document.key();
            let (change_type, old_index, new_index) = match change.change_type {
                ChangeType::Added => {
                    documents.add(change.document.clone());
                    (DocumentChangeType::Added, None, documents.index_of(key))
                }
                ChangeType::Removed => {
                    let old_index = documents.index_of(key);
                    documents.delete(key);
                    (DocumentChangeType::Removed, old_index, None)
                }
                ChangeType::Modified | ChangeType::Metadata => {
                    let old_index = documents.index_of(key);
                    documents.delete(key);
                    documents.add(change.document.clone());
                    (DocumentChangeType::Modified, old_index, documents.index_of(key))
                }
            };
            changes.push(DocumentChange {
                change_type,
                document: self.document_snapshot(change.document.clone()),
                old_index,
                new_index,
            });
        }
        changes
    }

    fn document_snapshot(&self, document: MutableDocument) -> DocumentSnapshot {
        let key = document.key().clone();
        let metadata = SnapshotMetadata::new(self.snapshot.from_cache, self.snapshot.mutated_keys.contains(&key));
        DocumentSnapshot::new(self.query.firestore.clone(), key, Some(document), metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::DocumentViewChange;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{DocumentKeySet, DocumentSet};
    use crate::firestore::test_support::{doc, test_firestore};

    #[tokio::test]
    async fn builders_validate_arguments() {
        let (firestore, _connection) = test_firestore();
        let rooms = firestore.collection("rooms").unwrap().query();

        let err = rooms.limit(0).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        let err = rooms
            .where_field("n", FilterOperator::Equal, FirestoreValue::server_timestamp())
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        let err = rooms.start_at(vec![FirestoreValue::from_integer(1)]).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);

        let ordered = rooms
            .order_by("rank", Direction::Descending)
            .unwrap()
            .limit_to_last(2)
            .unwrap();
        assert!(ordered.validate_has_explicit_order_by_for_limit_to_last().is_ok());
        assert!(rooms
            .limit_to_last(2)
            .unwrap()
            .validate_has_explicit_order_by_for_limit_to_last()
            .is_err());
    }

    #[tokio::test]
    async fn document_id_filters_become_references() {
        let (firestore, _connection) = test_firestore();
        let rooms = firestore.collection("rooms").unwrap().query();
        let query = rooms.where_field("__name__", FilterOperator::Equal, "a").unwrap();
        assert!(query.core_query().matches(&doc("rooms/a", 1, &[])));
        assert!(!query.core_query().matches(&doc("rooms/b", 1, &[])));

        let err = rooms
            .where_field("__name__", FilterOperator::Equal, "a/b")
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn doc_changes_carry_indexes() {
        let (firestore, _connection) = test_firestore();
        let query = firestore
            .collection("rooms")
            .unwrap()
            .query()
            .order_by("rank", Direction::Ascending)
            .unwrap();
        let comparator = query.core_query().comparator();
        let mut old_documents = DocumentSet::new(comparator.clone());
        old_documents.add(doc("rooms/a", 1, &[("rank", 1)]));
        old_documents.add(doc("rooms/b", 1, &[("rank", 2)]));
        let mut documents = DocumentSet::new(comparator);
        documents.add(doc("rooms/c", 2, &[("rank", 0)]));
        documents.add(doc("rooms/a", 1, &[("rank", 1)]));

        let snapshot = ViewSnapshot {
            query: query.core_query().clone(),
            documents,
            old_documents,
            document_changes: vec![
                DocumentViewChange::new(ChangeType::Removed, doc("rooms/b", 1, &[("rank", 2)])),
                DocumentViewChange::new(ChangeType::Added, doc("rooms/c", 2, &[("rank", 0)])),
            ],
            mutated_keys: DocumentKeySet::new(),
            from_cache: false,
            sync_state_changed: false,
            excludes_metadata_changes: false,
            has_cached_results: true,
        };
        let snapshot = QuerySnapshot::new(query, snapshot);
        let changes = snapshot.doc_changes(false);
        assert_eq!(changes[0].change_type, DocumentChangeType::Removed);
        assert_eq!(changes[0].old_index, Some(1));
        assert_eq!(changes[1].change_type, DocumentChangeType::Added);
        assert_eq!(changes[1].new_index, Some(0));

        let ids: Vec<String> = snapshot
            .documents()
            .iter()
            .map(|document| document.id().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
