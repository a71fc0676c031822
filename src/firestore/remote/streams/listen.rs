use crate::firestore::core::TargetId;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::scheduler::StreamEvent;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, StreamNotification};
use crate::firestore::remote::watch_change::{decode_watch_change, snapshot_version_from_listen_response, WatchChange};

const LOG_TARGET: &str = "firestore::watch_stream";

/// Notifications raised by the [`WatchStream`].
#[derive(Debug)]
pub enum WatchStreamEvent {
    Open,
    Change {
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    },
    Close(Option<FirestoreError>),
}

/// The listen RPC: sends `addTarget`/`removeTarget` requests and decodes
/// `ListenResponse` messages.
pub struct WatchStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
}

impl WatchStream {
    pub fn new(stream: PersistentStream, serializer: JsonProtoSerializer) -> Self {
        Self { stream, serializer }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut PersistentStream {
        &mut self.stream
    }

    pub fn start(&mut self) {
        self.stream.start();
    }

    pub fn stop(&mut self) {
        self.stream.stop();
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&mut self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&mut self) {
        self.stream.inhibit_backoff();
    }

    pub fn watch(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = self.serializer.encode_listen_request(target_data);
        self.stream.send(request)
    }

    pub fn unwatch(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        let request = self.serializer.encode_unlisten_request(target_id);
        self.stream.send(request)
    }

    pub fn handle_event(&mut self, generation: u64, event: StreamEvent) -> Option<WatchStreamEvent> {
        match self.stream.handle_event(generation, event)? {
            StreamNotification::Opened => Some(WatchStreamEvent::Open),
            StreamNotification::Closed(error) => Some(WatchStreamEvent::Close(error)),
            StreamNotification::Message(message) => {
                // Any decodable response proves the connection works.
                self.stream.reset_backoff();
                let decoded = decode_watch_change(&self.serializer, &message).and_then(|change| {
                    let version = snapshot_version_from_listen_response(&self.serializer, &message)?;
                    Ok(change.map(|change| (change, version)))
                });
                match decoded {
                    Ok(Some((change, snapshot_version))) => Some(WatchStreamEvent::Change {
                        change,
                        snapshot_version,
                    }),
                    Ok(None) => {
                        log::debug!(target: LOG_TARGET, "ignoring listen response without a change");
                        None
                    }
                    Err(err) => {
                        log::error!(target: LOG_TARGET, "failed to decode listen response: {err}");
                        self.stream.fail(&err);
                        Some(WatchStreamEvent::Close(Some(err)))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::connection::{EmptyCredentialsProvider, StreamKind};
    use crate::firestore::remote::in_memory_connection::InMemoryConnection;
    use crate::firestore::remote::scheduler::RemoteStoreEvent;
    use crate::firestore::remote::stream::test_util::next_event;
    use crate::firestore::remote::watch_change::WatchTargetChangeState;
    use crate::firestore::settings::FirestoreSettings;
    use crate::util::async_queue::AsyncQueue;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn sends_targets_and_decodes_changes() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let database_id = DatabaseId::new("p", "(default)");
        let stream = PersistentStream::new(
            StreamKind::Listen,
            connection.clone(),
            Arc::new(EmptyCredentialsProvider),
            Arc::new(queue.clone()),
            &FirestoreSettings::default(),
        );
        let mut watch = WatchStream::new(stream, JsonProtoSerializer::new(database_id));

        watch.start();
        let server = connection.accept(StreamKind::Listen).await.unwrap();
        let RemoteStoreEvent::Stream { generation, event, .. } = next_event(&queue).await else {
            panic!("expected a stream event");
        };
        assert!(matches!(watch.handle_event(generation, event), Some(WatchStreamEvent::Open)));

        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        watch
            .watch(&TargetData::new(target, 2, TargetPurpose::Listen, 1))
            .unwrap();
        let request = server.next_request().await.unwrap();
        assert_eq!(request["addTarget"]["targetId"], json!(2));

        server
            .send(json!({"targetChange": {"targetChangeType": "ADD", "targetIds": [2]}}))
            .unwrap();
        let RemoteStoreEvent::Stream { generation, event, .. } = next_event(&queue).await else {
            panic!("expected a stream event");
        };
        match watch.handle_event(generation, event) {
            Some(WatchStreamEvent::Change {
                change: WatchChange::TargetChange(change),
                snapshot_version,
            }) => {
                assert_eq!(change.state, WatchTargetChangeState::Added);
                assert!(snapshot_version.is_min());
            }
            other => panic!("unexpected event {other:?}"),
        }

        watch.unwatch(2).unwrap();
        let request = server.next_request().await.unwrap();
        assert_eq!(request["removeTarget"], json!(2));
    }

    #[tokio::test]
    async fn undecodable_response_fails_the_stream() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let stream = PersistentStream::new(
            StreamKind::Listen,
            connection.clone(),
            Arc::new(EmptyCredentialsProvider),
            Arc::new(queue.clone()),
            &FirestoreSettings::default(),
        );
        let mut watch = WatchStream::new(stream, JsonProtoSerializer::new(DatabaseId::new("p", "(default)")));

        watch.start();
        let server = connection.accept(StreamKind::Listen).await.unwrap();
        for message in [None, Some(json!({"targetChange": {"targetChangeType": "BOGUS"}}))] {
            if let Some(message) = message {
                server.send(message).unwrap();
            }
            let RemoteStoreEvent::Stream { generation, event, .. } = next_event(&queue).await else {
                panic!("expected a stream event");
            };
            watch.handle_event(generation, event);
        }
        assert!(!watch.is_started());
        assert!(server.is_closed_by_client());
    }
}
