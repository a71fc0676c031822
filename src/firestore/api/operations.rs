use std::collections::BTreeMap;

use crate::firestore::core::{Source, ViewSnapshot, WriteAcknowledgement};
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, Mutation, Precondition};
use crate::firestore::value::FirestoreValue;

use super::query::{Query, QuerySnapshot};
use super::reference::{CollectionReference, DocumentReference};
use super::snapshot::{DocumentSnapshot, SnapshotMetadata};
use super::user_data::{parse_set_data, parse_update_data, SetOptions};
use super::Firestore;

impl Firestore {
    /// Writes `data` to `reference`, replacing any existing document.
    ///
    /// Resolves once the write is queued locally. Await the returned
    /// acknowledgement to learn whether the backend accepted it.
    pub async fn set_doc(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<WriteAcknowledgement> {
        self.set_doc_with_options(reference, data, SetOptions::default())
            .await
    }

    pub async fn set_doc_with_options(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
        options: SetOptions,
    ) -> FirestoreResult<WriteAcknowledgement> {
        let parsed = parse_set_data(data, &options)?;
        let mutation = parsed.into_mutation(reference.key().clone(), Precondition::None);
        self.client().write(vec![mutation]).await
    }

    /// Adds a document with an auto-generated id to `collection`.
    pub async fn add_doc(
        &self,
        collection: &CollectionReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<DocumentReference> {
        let reference = collection.doc(None)?;
        let parsed = parse_set_data(data, &SetOptions::default())?;
        let mutation = parsed.into_mutation(reference.key().clone(), Precondition::None);
        self.client().write(vec![mutation]).await?;
        Ok(reference)
    }

    /// Updates fields of an existing document. Keys are dot-separated field
    /// paths. Fails on the backend when the document does not exist.
    pub async fn update_doc(
        &self,
        reference: &DocumentReference,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<WriteAcknowledgement> {
        let parsed = parse_update_data(data)?;
        let mutation = parsed.into_mutation(reference.key().clone(), Precondition::Exists(true));
        self.client().write(vec![mutation]).await
    }

    pub async fn delete_doc(&self, reference: &DocumentReference) -> FirestoreResult<WriteAcknowledgement> {
        self.client()
            .write(vec![Mutation::delete(reference.key().clone())])
            .await
    }

    /// Reads a document, from the backend when reachable and the cache
    /// otherwise.
    pub async fn get_doc(&self, reference: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        self.get_doc_from(reference, Source::Default).await
    }

    pub async fn get_doc_from(
        &self,
        reference: &DocumentReference,
        source: Source,
    ) -> FirestoreResult<DocumentSnapshot> {
        let key = reference.key().clone();
        if source == Source::Cache {
            let document = self
                .client()
                .get_document_from_local_cache(key.clone())
                .await?;
            let metadata = SnapshotMetadata::new(true, document.has_local_mutations());
            return Ok(DocumentSnapshot::new(self.clone(), key, Some(document), metadata));
        }
        let snapshot = self
            .client()
            .get_document_via_snapshot_listener(key.clone(), source)
            .await?;
        Ok(self.document_snapshot_from_view(key, &snapshot))
    }

    /// Runs `query`, from the backend when reachable and the cache otherwise.
    pub async fn get_docs(&self, query: &Query) -> FirestoreResult<QuerySnapshot> {
        self.get_docs_from(query, Source::Default).await
    }

    pub async fn get_docs_from(&self, query: &Query, source: Source) -> FirestoreResult<QuerySnapshot> {
        query.validate_has_explicit_order_by_for_limit_to_last()?;
        let core_query = query.core_query().clone();
        let snapshot = if source == Source::Cache {
            self.client()
                .get_documents_from_local_cache(core_query)
                .await?
        } else {
            self.client()
                .execute_query_via_snapshot_listener(core_query, source)
                .await?
        };
        Ok(QuerySnapshot::new(query.clone(), snapshot))
    }

    pub(crate) fn document_snapshot_from_view(&self, key: DocumentKey, snapshot: &ViewSnapshot) -> DocumentSnapshot {
        let document = snapshot.documents.get(&key).cloned();
        let metadata = SnapshotMetadata::new(snapshot.from_cache, snapshot.mutated_keys.contains(&key));
        DocumentSnapshot::new(self.clone(), key, document, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::FilterOperator;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::test_support::test_firestore;

    fn data(entries: Vec<(&str, FirestoreValue)>) -> BTreeMap<String, FirestoreValue> {
        entries
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    #[tokio::test]
    async fn writes_are_visible_in_the_cache_before_acknowledgement() {
        let (firestore, _connection) = test_firestore();
        firestore.disable_network().await.unwrap();
        let reference = firestore.doc("rooms/a").unwrap();
        firestore
            .set_doc(&reference, data(vec![("name", FirestoreValue::from_string("x"))]))
            .await
            .unwrap();

        let snapshot = firestore.get_doc_from(&reference, Source::Cache).await.unwrap();
        assert!(snapshot.exists());
        assert!(snapshot.from_cache());
        assert!(snapshot.has_pending_writes());
        assert_eq!(snapshot.get("name").unwrap(), Some(FirestoreValue::from_string("x")));

        let snapshot = firestore.get_doc(&reference).await.unwrap();
        assert!(snapshot.exists());
        assert!(snapshot.from_cache());
    }

    #[tokio::test]
    async fn merge_and_update_combine_locally() {
        let (firestore, _connection) = test_firestore();
        firestore.disable_network().await.unwrap();
        let reference = firestore.doc("rooms/a").unwrap();
        firestore
            .set_doc(
                &reference,
                data(vec![
                    ("name", FirestoreValue::from_string("x")),
                    ("count", FirestoreValue::from_integer(1)),
                ]),
            )
            .await
            .unwrap();
        firestore
            .set_doc_with_options(
                &reference,
                data(vec![("topic", FirestoreValue::from_string("rust"))]),
                SetOptions::merge_all(),
            )
            .await
            .unwrap();
        firestore
            .update_doc(
                &reference,
                data(vec![
                    ("count", FirestoreValue::numeric_increment(FirestoreValue::from_integer(2))),
                    ("name", FirestoreValue::delete_field()),
                ]),
            )
            .await
            .unwrap();

        let snapshot = firestore.get_doc_from(&reference, Source::Cache).await.unwrap();
        assert_eq!(snapshot.get("count").unwrap(), Some(FirestoreValue::from_integer(3)));
        assert_eq!(snapshot.get("topic").unwrap(), Some(FirestoreValue::from_string("rust")));
        assert_eq!(snapshot.get("name").unwrap(), None);
    }

    #[tokio::test]
    async fn deleted_documents_read_as_missing() {
        let (firestore, _connection) = test_firestore();
        firestore.disable_network().await.unwrap();
        let reference = firestore.doc("rooms/a").unwrap();
        firestore
            .set_doc(&reference, data(vec![("n", FirestoreValue::from_integer(1))]))
            .await
            .unwrap();
        firestore.delete_doc(&reference).await.unwrap();

        let snapshot = firestore.get_doc_from(&reference, Source::Cache).await.unwrap();
        assert!(!snapshot.exists());
        assert!(snapshot.has_pending_writes());
    }

    #[tokio::test]
    async fn uncached_reads_fail_offline() {
        let (firestore, _connection) = test_firestore();
        firestore.disable_network().await.unwrap();
        let reference = firestore.doc("rooms/missing").unwrap();

        let err = firestore.get_doc(&reference).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
        let err = firestore
            .get_doc_from(&reference, Source::Cache)
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn cached_query_results_honor_filters() {
        let (firestore, _connection) = test_firestore();
        firestore.disable_network().await.unwrap();
        let rooms = firestore.collection("rooms").unwrap();
        for (id, rank) in [("a", 1), ("b", 5), ("c", 3)] {
            let reference = rooms.doc(Some(id)).unwrap();
            firestore
                .set_doc(&reference, data(vec![("rank", FirestoreValue::from_integer(rank))]))
                .await
                .unwrap();
        }

        let query = rooms
            .query()
            .where_field("rank", FilterOperator::GreaterThan, 2i64)
            .unwrap();
        let snapshot = firestore.get_docs_from(&query, Source::Cache).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.metadata().has_pending_writes());

        let snapshot = firestore.get_docs(&query).await.unwrap();
        assert!(snapshot.metadata().from_cache());
        assert_eq!(snapshot.len(), 2);

        let err = firestore
            .get_docs_from(&query, Source::Server)
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn limit_to_last_requires_order_by() {
        let (firestore, _connection) = test_firestore();
        let query = firestore
            .collection("rooms")
            .unwrap()
            .query()
            .limit_to_last(1)
            .unwrap();
        let err = firestore.get_docs(&query).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }
}
