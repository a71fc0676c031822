use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::firestore::core::{FirestoreClient, ListenOptions, ListenSource, Query as CoreQuery, ViewSnapshot};
use crate::firestore::error::FirestoreResult;

use super::query::{Query, QuerySnapshot};
use super::reference::DocumentReference;
use super::snapshot::DocumentSnapshot;
use super::Firestore;

/// Options for [`Firestore::on_snapshot`] and
/// [`Firestore::on_document_snapshot`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotListenOptions {
    /// Also raise snapshots whose only change is `from_cache` or
    /// `has_pending_writes`.
    pub include_metadata_changes: bool,
    pub source: ListenSource,
}

impl From<SnapshotListenOptions> for ListenOptions {
    fn from(options: SnapshotListenOptions) -> Self {
        ListenOptions {
            include_metadata_changes: options.include_metadata_changes,
            wait_for_sync_when_online: false,
            source: options.source,
        }
    }
}

/// Returned by the `on_*snapshot` methods; call [`ListenerRegistration::remove`]
/// to stop receiving snapshots.
pub struct ListenerRegistration {
    client: FirestoreClient,
    query: CoreQuery,
    listener_id: u64,
    removed: AtomicBool,
}

impl ListenerRegistration {
    /// Detaches the listener. Later calls are no-ops.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.client.unlisten(self.query.clone(), self.listener_id);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

impl Firestore {
    /// Listens to the results of `query`. The observer runs on the client's
    /// queue and must not block.
    pub async fn on_snapshot<F>(
        &self,
        query: &Query,
        options: SnapshotListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<QuerySnapshot>) + Send + Sync + 'static,
    {
        query.validate_has_explicit_order_by_for_limit_to_last()?;
        let api_query = query.clone();
        self.listen(query.core_query().clone(), options, move |result: FirestoreResult<ViewSnapshot>| {
            observer(result.map(|snapshot| QuerySnapshot::new(api_query.clone(), snapshot)));
        })
        .await
    }

    /// Listens to a single document.
    pub async fn on_document_snapshot<F>(
        &self,
        reference: &DocumentReference,
        options: SnapshotListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<DocumentSnapshot>) + Send + Sync + 'static,
    {
        let key = reference.key().clone();
        let firestore = self.clone();
        self.listen(
            CoreQuery::for_document(&key),
            options,
            move |result: FirestoreResult<ViewSnapshot>| {
                observer(result.map(|snapshot| firestore.document_snapshot_from_view(key.clone(), &snapshot)));
            },
        )
        .await
    }

    async fn listen(
        &self,
        query: CoreQuery,
        options: SnapshotListenOptions,
        observer: impl Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    ) -> FirestoreResult<ListenerRegistration> {
        let client = self.client().clone();
        let listener_id = client
            .listen(query.clone(), options.into(), Arc::new(observer))
            .await?;
        Ok(ListenerRegistration {
            client,
            query,
            listener_id,
            removed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_channel::Receiver;
    use serde_json::json;

    use super::*;
    use crate::firestore::remote::{ServerStream, StreamKind};
    use crate::firestore::test_support::test_firestore;
    use crate::firestore::value::FirestoreValue;

    async fn next<T>(receiver: &Receiver<FirestoreResult<T>>) -> T {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .unwrap()
            .unwrap()
    }

    fn observer<T: Send + 'static>(
    ) -> (impl Fn(FirestoreResult<T>) + Send + Sync + 'static, Receiver<FirestoreResult<T>>) {
        let (sender, receiver) = async_channel::unbounded();
        (
            move |result| {
                let _ = sender.try_send(result);
            },
            receiver,
        )
    }

    async fn target_id(listen: &ServerStream) -> i64 {
        let request = listen.next_request().await.unwrap();
        request["addTarget"]["targetId"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn added_document_is_pending_until_the_backend_confirms_it() {
        let (firestore, connection) = test_firestore();
        let rooms = firestore.collection("rooms").unwrap();
        let reference = firestore
            .add_doc(
                &rooms,
                BTreeMap::from([("name".to_string(), FirestoreValue::from_string("x"))]),
            )
            .await
            .unwrap();

        let (callback, snapshots) = observer::<QuerySnapshot>();
        let options = SnapshotListenOptions {
            include_metadata_changes: true,
            ..SnapshotListenOptions::default()
        };
        let registration = firestore
            .on_snapshot(&rooms.query(), options, callback)
            .await
            .unwrap();

        let first = next(&snapshots).await;
        assert_eq!(first.len(), 1);
        assert!(first.metadata().from_cache());
        assert!(first.metadata().has_pending_writes());
        assert!(first.documents()[0].has_pending_writes());
        assert_eq!(first.documents()[0].id(), reference.id());

        // Play the backend: acknowledge the write, then confirm the document
        // through the watch stream at the same version.
        let write = connection.accept(StreamKind::Write).await.unwrap();
        let _handshake = write.next_request().await.unwrap();
        write.send(json!({"streamToken": "AQ=="})).unwrap();
        let request = write.next_request().await.unwrap();
        assert_eq!(request["writes"].as_array().unwrap().len(), 1);
        write
            .send(json!({
                "streamToken": "Ag==",
                "commitTime": "1970-01-01T00:00:05Z",
                "writeResults": [{"updateTime": "1970-01-01T00:00:05Z"}]
            }))
            .unwrap();

        let listen = connection.accept(StreamKind::Listen).await.unwrap();
        let target_id = target_id(&listen).await;
        let name = format!(
            "projects/p/databases/(default)/documents/rooms/{}",
            reference.id()
        );
        for message in [
            json!({"targetChange": {"targetChangeType": "ADD", "targetIds": [target_id]}}),
            json!({"documentChange": {
                "document": {
                    "name": name,
                    "fields": {"name": {"stringValue": "x"}},
                    "updateTime": "1970-01-01T00:00:05Z"
                },
                "targetIds": [target_id]
            }}),
            json!({"targetChange": {"targetChangeType": "CURRENT", "targetIds": [target_id], "resumeToken": "AQ=="}}),
            json!({"targetChange": {"readTime": "1970-01-01T00:00:05Z"}}),
        ] {
            listen.send(message).unwrap();
        }

        let mut latest = next(&snapshots).await;
        while latest.metadata().has_pending_writes() || latest.metadata().from_cache() {
            latest = next(&snapshots).await;
        }
        assert_eq!(latest.len(), 1);
        assert!(!latest.documents()[0].has_pending_writes());
        assert_eq!(
            latest.documents()[0].get("name").unwrap(),
            Some(FirestoreValue::from_string("x"))
        );

        registration.remove();
        assert!(registration.is_removed());
        registration.remove();
    }

    #[tokio::test]
    async fn document_listener_reports_missing_documents_offline() {
        let (firestore, _connection) = test_firestore();
        firestore.disable_network().await.unwrap();
        let reference = firestore.doc("rooms/a").unwrap();

        let (callback, snapshots) = observer::<DocumentSnapshot>();
        let registration = firestore
            .on_document_snapshot(&reference, SnapshotListenOptions::default(), callback)
            .await
            .unwrap();
        let snapshot = next(&snapshots).await;
        assert!(!snapshot.exists());
        assert!(snapshot.from_cache());

        firestore
            .set_doc(
                &reference,
                BTreeMap::from([("n".to_string(), FirestoreValue::from_integer(1))]),
            )
            .await
            .unwrap();
        let snapshot = next(&snapshots).await;
        assert!(snapshot.exists());
        assert!(snapshot.has_pending_writes());
        registration.remove();
    }

    #[tokio::test]
    async fn cache_only_listeners_never_open_a_target() {
        let (firestore, connection) = test_firestore();
        let rooms = firestore.collection("rooms").unwrap();
        let (callback, snapshots) = observer::<QuerySnapshot>();
        let options = SnapshotListenOptions {
            source: ListenSource::Cache,
            ..SnapshotListenOptions::default()
        };
        let _registration = firestore
            .on_snapshot(&rooms.query(), options, callback)
            .await
            .unwrap();
        let snapshot = next(&snapshots).await;
        assert!(snapshot.is_empty());
        assert!(snapshot.metadata().from_cache());
        assert_eq!(connection.pending_streams(StreamKind::Listen), 0);
    }
}
