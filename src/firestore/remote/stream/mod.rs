pub mod persistent;

pub use persistent::{PersistentStream, PersistentStreamState, StreamNotification};

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::firestore::error::FirestoreResult;
    use crate::firestore::remote::connection::CredentialsProvider;
    use crate::firestore::remote::scheduler::RemoteStoreEvent;
    use crate::platform::runtime;
    use crate::util::async_queue::AsyncQueue;

    pub type EventQueue = AsyncQueue<Vec<RemoteStoreEvent>>;

    /// Waits until an event lands on the queue and takes the oldest one.
    pub async fn next_event(queue: &EventQueue) -> RemoteStoreEvent {
        for _ in 0..500 {
            let event = queue
                .enqueue(|events| (!events.is_empty()).then(|| events.remove(0)))
                .await
                .unwrap();
            if let Some(event) = event {
                return event;
            }
            runtime::sleep(Duration::from_millis(2)).await;
        }
        panic!("no remote store event arrived");
    }

    #[derive(Default)]
    pub struct RecordingCredentials {
        invalidations: AtomicUsize,
    }

    impl RecordingCredentials {
        pub fn invalidations(&self) -> usize {
            self.invalidations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialsProvider for RecordingCredentials {
        async fn get_token(&self) -> FirestoreResult<Option<String>> {
            Ok(Some(format!("token-{}", self.invalidations())))
        }

        fn invalidate_token(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }
}
