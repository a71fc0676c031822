use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::firestore::error::FirestoreError;
use crate::firestore::remote::connection::{StreamHandle, StreamKind};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Something that happened to a persistent stream outside the queue.
pub enum StreamEvent {
    Opened(Arc<dyn StreamHandle>),
    Message(JsonValue),
    Closed(Option<FirestoreError>),
    BackoffElapsed,
    IdleTimeout,
    HealthCheck,
}

impl Debug for StreamEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StreamEvent::Opened(_) => write!(f, "Opened"),
            StreamEvent::Message(message) => f.debug_tuple("Message").field(message).finish(),
            StreamEvent::Closed(error) => f.debug_tuple("Closed").field(error).finish(),
            StreamEvent::BackoffElapsed => write!(f, "BackoffElapsed"),
            StreamEvent::IdleTimeout => write!(f, "IdleTimeout"),
            StreamEvent::HealthCheck => write!(f, "HealthCheck"),
        }
    }
}

/// Events the remote store receives back on the queue.
#[derive(Debug)]
pub enum RemoteStoreEvent {
    /// `generation` is the stream's close count when the event was scheduled.
    Stream {
        kind: StreamKind,
        generation: u64,
        event: StreamEvent,
    },
    OnlineStateTimeout,
    /// Retries a persistence read after a recoverable failure disabled the
    /// network.
    RecoveryProbe,
}

/// Routes remote events back onto the serialized queue.
pub trait RemoteScheduler: Send + Sync + 'static {
    fn dispatch(&self, event: RemoteStoreEvent);

    fn dispatch_after_delay(&self, timer_id: TimerId, delay: Duration, event: RemoteStoreEvent) -> DelayedOperation;
}

/// Queue state able to take remote events.
pub trait RemoteEventSink {
    fn on_remote_store_event(&mut self, event: RemoteStoreEvent);
}

impl RemoteEventSink for Vec<RemoteStoreEvent> {
    fn on_remote_store_event(&mut self, event: RemoteStoreEvent) {
        self.push(event);
    }
}

impl<S> RemoteScheduler for AsyncQueue<S>
where
    S: RemoteEventSink + Send + 'static,
{
    fn dispatch(&self, event: RemoteStoreEvent) {
        self.enqueue_and_forget(move |state| state.on_remote_store_event(event));
    }

    fn dispatch_after_delay(&self, timer_id: TimerId, delay: Duration, event: RemoteStoreEvent) -> DelayedOperation {
        self.enqueue_after_delay(timer_id, delay, move |state| state.on_remote_store_event(event))
    }
}

pub type RemoteSchedulerArc = Arc<dyn RemoteScheduler>;
