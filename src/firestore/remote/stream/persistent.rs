use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::firestore::error::{failed_precondition, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::connection::{
    Connection, CredentialsProvider, EmptyCredentialsProvider, StreamHandle, StreamKind, StreamTokens,
};
use crate::firestore::remote::scheduler::{RemoteScheduler, RemoteStoreEvent, StreamEvent};
use crate::firestore::settings::FirestoreSettings;
use crate::platform::runtime;
use crate::util::async_queue::{DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

const LOG_TARGET: &str = "firestore::persistent_stream";

/// Lifecycle of a [`PersistentStream`].
///
/// `Initial → Starting → Open → Healthy`, with `Error` after a failure and
/// `Backoff` while waiting to retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    Initial,
    Starting,
    Open,
    Healthy,
    Error,
    Backoff,
}

/// What a handled [`StreamEvent`] means for the owner of the stream.
#[derive(Debug)]
pub enum StreamNotification {
    Opened,
    Message(JsonValue),
    Closed(Option<FirestoreError>),
}

/// A stream that reopens itself with backoff after failures.
///
/// All state lives on the queue. The physical stream is opened and read by
/// detached tasks that report back through the [`RemoteScheduler`] tagged with
/// the stream's close count, so reports from a previous incarnation are
/// ignored.
pub struct PersistentStream {
    kind: StreamKind,
    state: PersistentStreamState,
    close_count: u64,
    stream: Option<Arc<dyn StreamHandle>>,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
    health_check: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
    idle_timeout: Duration,
    health_check_timeout: Duration,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    app_check: Arc<dyn CredentialsProvider>,
    scheduler: Arc<dyn RemoteScheduler>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        scheduler: Arc<dyn RemoteScheduler>,
        settings: &FirestoreSettings,
    ) -> Self {
        Self {
            kind,
            state: PersistentStreamState::Initial,
            close_count: 0,
            stream: None,
            backoff: ExponentialBackoff::new(settings.backoff),
            idle_timer: None,
            health_check: None,
            backoff_timer: None,
            idle_timeout: settings.idle_stream_timeout,
            health_check_timeout: settings.health_check_timeout,
            connection,
            credentials,
            app_check: Arc::new(EmptyCredentialsProvider),
            scheduler,
        }
    }

    /// App Check tokens are sent with every open once a provider is set.
    pub fn set_app_check_provider(&mut self, provider: Arc<dyn CredentialsProvider>) {
        self.app_check = provider;
    }

    #[cfg(test)]
    pub(crate) fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> PersistentStreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.close_count
    }

    /// True from `start()` until the stream is stopped or fails.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            PersistentStreamState::Starting
                | PersistentStreamState::Backoff
                | PersistentStreamState::Open
                | PersistentStreamState::Healthy
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, PersistentStreamState::Open | PersistentStreamState::Healthy)
    }

    /// Opens the stream, or waits out the backoff first after a failure.
    pub fn start(&mut self) {
        if self.state == PersistentStreamState::Error {
            self.perform_backoff();
            return;
        }
        if self.state != PersistentStreamState::Initial {
            log::warn!(target: LOG_TARGET, "{} stream already started ({:?})", self.kind, self.state);
            return;
        }
        self.state = PersistentStreamState::Starting;

        let kind = self.kind;
        let generation = self.close_count;
        let connection = Arc::clone(&self.connection);
        let credentials = Arc::clone(&self.credentials);
        let app_check = Arc::clone(&self.app_check);
        let scheduler = Arc::clone(&self.scheduler);
        log::debug!(target: LOG_TARGET, "opening {kind} stream (generation {generation})");
        runtime::spawn_detached(async move {
            let dispatch = |event| {
                scheduler.dispatch(RemoteStoreEvent::Stream {
                    kind,
                    generation,
                    event,
                })
            };
            let (auth_token, app_check_token) =
                futures::future::join(credentials.get_token(), app_check.get_token()).await;
            let tokens = match (auth_token, app_check_token) {
                (Ok(auth_token), Ok(app_check_token)) => StreamTokens {
                    auth_token,
                    app_check_token,
                },
                (Err(err), _) | (_, Err(err)) => {
                    dispatch(StreamEvent::Closed(Some(err)));
                    return;
                }
            };
            let handle = match connection.open_stream(kind, tokens).await {
                Ok(handle) => handle,
                Err(err) => {
                    dispatch(StreamEvent::Closed(Some(err)));
                    return;
                }
            };
            dispatch(StreamEvent::Opened(Arc::clone(&handle)));
            while let Some(message) = handle.next().await {
                match message {
                    Ok(message) => dispatch(StreamEvent::Message(message)),
                    Err(err) => {
                        dispatch(StreamEvent::Closed(Some(err)));
                        return;
                    }
                }
            }
            dispatch(StreamEvent::Closed(Some(unavailable(format!(
                "The {kind} stream was closed by the server"
            )))));
        });
    }

    /// Applies an event reported for this stream.
    pub fn handle_event(&mut self, generation: u64, event: StreamEvent) -> Option<StreamNotification> {
        if generation != self.close_count {
            match event {
                StreamEvent::Opened(handle) => handle.close(),
                event => log::debug!(target: LOG_TARGET, "ignoring stale {} stream event {event:?}", self.kind),
            }
            return None;
        }

        match event {
            StreamEvent::Opened(handle) => {
                log::debug!(target: LOG_TARGET, "{} stream opened", self.kind);
                self.stream = Some(handle);
                self.state = PersistentStreamState::Open;
                self.health_check = Some(self.schedule(
                    TimerId::HealthCheckTimeout,
                    self.health_check_timeout,
                    StreamEvent::HealthCheck,
                ));
                Some(StreamNotification::Opened)
            }
            StreamEvent::Message(message) => {
                if self.state == PersistentStreamState::Open {
                    self.mark_healthy();
                }
                Some(StreamNotification::Message(message))
            }
            StreamEvent::Closed(error) => {
                log::debug!(target: LOG_TARGET, "{} stream closed: {error:?}", self.kind);
                self.close(PersistentStreamState::Error, error.as_ref());
                Some(StreamNotification::Closed(error))
            }
            StreamEvent::BackoffElapsed => {
                self.backoff_timer = None;
                if self.state == PersistentStreamState::Backoff {
                    self.state = PersistentStreamState::Initial;
                    self.start();
                }
                None
            }
            StreamEvent::IdleTimeout => {
                self.idle_timer = None;
                if self.is_open() {
                    log::debug!(target: LOG_TARGET, "closing idle {} stream", self.kind);
                    self.close(PersistentStreamState::Initial, None);
                    return Some(StreamNotification::Closed(None));
                }
                None
            }
            StreamEvent::HealthCheck => {
                self.health_check = None;
                if self.state == PersistentStreamState::Open {
                    self.mark_healthy();
                }
                None
            }
        }
    }

    fn mark_healthy(&mut self) {
        self.state = PersistentStreamState::Healthy;
        if let Some(timer) = self.health_check.take() {
            timer.cancel();
        }
    }

    pub fn send(&mut self, message: JsonValue) -> FirestoreResult<()> {
        self.cancel_idle_timer();
        match &self.stream {
            Some(stream) => stream.send(message),
            None => Err(failed_precondition(format!("The {} stream is not open", self.kind))),
        }
    }

    /// Schedules a graceful close after the idle timeout unless the stream
    /// is used again first.
    pub fn mark_idle(&mut self) {
        if self.is_open() && self.idle_timer.is_none() {
            let timer_id = match self.kind {
                StreamKind::Listen => TimerId::ListenStreamIdle,
                StreamKind::Write => TimerId::WriteStreamIdle,
            };
            self.idle_timer = Some(self.schedule(timer_id, self.idle_timeout, StreamEvent::IdleTimeout));
        }
    }

    /// Closes the stream without an error. Does nothing if not started.
    pub fn stop(&mut self) {
        if self.is_started() {
            self.close(PersistentStreamState::Initial, None);
        }
    }

    /// Closes the stream with `error`, as if the server had failed it.
    pub fn fail(&mut self, error: &FirestoreError) {
        self.close(PersistentStreamState::Error, Some(error));
    }

    /// Lets the next `start()` connect immediately after a failure.
    pub fn inhibit_backoff(&mut self) {
        if self.is_started() {
            log::warn!(target: LOG_TARGET, "cannot inhibit backoff of a started {} stream", self.kind);
            return;
        }
        self.state = PersistentStreamState::Initial;
        self.backoff.reset();
    }

    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    fn close(&mut self, final_state: PersistentStreamState, error: Option<&FirestoreError>) {
        self.cancel_idle_timer();
        if let Some(timer) = self.health_check.take() {
            timer.cancel();
        }
        if let Some(timer) = self.backoff_timer.take() {
            timer.cancel();
        }
        self.close_count += 1;

        if final_state != PersistentStreamState::Error {
            self.backoff.reset();
        } else if let Some(error) = error {
            if error.code == FirestoreErrorCode::ResourceExhausted {
                log::error!(
                    target: LOG_TARGET,
                    "{} stream exhausted its resources, using maximum backoff: {error}",
                    self.kind
                );
                self.backoff.reset_to_max();
            } else if error.code == FirestoreErrorCode::Unauthenticated
                && self.state != PersistentStreamState::Healthy
            {
                self.credentials.invalidate_token();
                self.app_check.invalidate_token();
            }
        }

        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.state = final_state;
    }

    fn perform_backoff(&mut self) {
        self.state = PersistentStreamState::Backoff;
        let delay = self.backoff.next_delay();
        let timer_id = match self.kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        };
        log::debug!(target: LOG_TARGET, "backing off {} stream for {delay:?}", self.kind);
        self.backoff_timer = Some(self.schedule(timer_id, delay, StreamEvent::BackoffElapsed));
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    fn schedule(&self, timer_id: TimerId, delay: Duration, event: StreamEvent) -> DelayedOperation {
        self.scheduler.dispatch_after_delay(
            timer_id,
            delay,
            RemoteStoreEvent::Stream {
                kind: self.kind,
                generation: self.close_count,
                event,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, unauthenticated};
    use crate::firestore::remote::in_memory_connection::InMemoryConnection;
    use crate::firestore::remote::stream::test_util::{next_event, EventQueue, RecordingCredentials};
    use crate::util::async_queue::AsyncQueue;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn stream_with(
        connection: Arc<InMemoryConnection>,
        credentials: Arc<dyn CredentialsProvider>,
        queue: &EventQueue,
    ) -> PersistentStream {
        PersistentStream::new(
            StreamKind::Listen,
            connection,
            credentials,
            Arc::new(queue.clone()),
            &FirestoreSettings::default(),
        )
        .with_backoff(ExponentialBackoff::with_rng(
            FirestoreSettings::default().backoff,
            StdRng::seed_from_u64(1),
        ))
    }

    async fn apply_next(stream: &mut PersistentStream, queue: &EventQueue) -> Option<StreamNotification> {
        match next_event(queue).await {
            RemoteStoreEvent::Stream { generation, event, .. } => stream.handle_event(generation, event),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn opens_and_becomes_healthy_on_first_message() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let mut stream = stream_with(Arc::clone(&connection), Arc::new(EmptyCredentialsProvider), &queue);

        stream.start();
        assert_eq!(stream.state(), PersistentStreamState::Starting);
        let server = connection.accept(StreamKind::Listen).await.unwrap();
        assert!(matches!(apply_next(&mut stream, &queue).await, Some(StreamNotification::Opened)));
        assert_eq!(stream.state(), PersistentStreamState::Open);

        server.send(json!({"hello": true})).unwrap();
        assert!(matches!(
            apply_next(&mut stream, &queue).await,
            Some(StreamNotification::Message(_))
        ));
        assert_eq!(stream.state(), PersistentStreamState::Healthy);
    }

    #[tokio::test]
    async fn stale_events_from_closed_generation_are_ignored() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let mut stream = stream_with(Arc::clone(&connection), Arc::new(EmptyCredentialsProvider), &queue);

        stream.start();
        let old_generation = stream.generation();
        stream.stop();
        assert_eq!(stream.state(), PersistentStreamState::Initial);

        // The open from the stopped attempt still lands on the queue.
        let _server = connection.accept(StreamKind::Listen).await.unwrap();
        let RemoteStoreEvent::Stream { generation, event, .. } = next_event(&queue).await else {
            panic!("expected a stream event");
        };
        assert_eq!(generation, old_generation);
        assert!(stream.handle_event(generation, event).is_none());
        assert_eq!(stream.state(), PersistentStreamState::Initial);
        assert!(stream
            .handle_event(old_generation, StreamEvent::Closed(None))
            .is_none());
    }

    #[tokio::test]
    async fn idle_close_returns_to_initial_without_error() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let mut stream = stream_with(Arc::clone(&connection), Arc::new(EmptyCredentialsProvider), &queue);

        stream.start();
        let server = connection.accept(StreamKind::Listen).await.unwrap();
        apply_next(&mut stream, &queue).await;
        stream.mark_idle();
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));

        queue
            .run_delayed_operations_early(Some(TimerId::ListenStreamIdle))
            .await
            .unwrap();
        let mut notification = None;
        while notification.is_none() {
            notification = apply_next(&mut stream, &queue).await;
        }
        assert!(matches!(notification, Some(StreamNotification::Closed(None))));
        assert_eq!(stream.state(), PersistentStreamState::Initial);
        assert!(server.is_closed_by_client());
    }

    #[tokio::test]
    async fn failure_then_restart_backs_off() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let mut stream = stream_with(Arc::clone(&connection), Arc::new(EmptyCredentialsProvider), &queue);

        connection.fail_next_open(unavailable("offline")).await;
        stream.start();
        let notification = apply_next(&mut stream, &queue).await;
        assert!(matches!(notification, Some(StreamNotification::Closed(Some(_)))));
        assert_eq!(stream.state(), PersistentStreamState::Error);

        stream.start();
        assert_eq!(stream.state(), PersistentStreamState::Backoff);
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
        queue
            .run_delayed_operations_early(Some(TimerId::ListenStreamConnectionBackoff))
            .await
            .unwrap();
        assert!(apply_next(&mut stream, &queue).await.is_none());
        assert_eq!(stream.state(), PersistentStreamState::Starting);
        connection.accept(StreamKind::Listen).await.unwrap();
    }

    #[tokio::test]
    async fn resource_exhausted_uses_maximum_backoff() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let mut stream = stream_with(Arc::clone(&connection), Arc::new(EmptyCredentialsProvider), &queue);

        stream.start();
        let server = connection.accept(StreamKind::Listen).await.unwrap();
        apply_next(&mut stream, &queue).await;
        server.fail(resource_exhausted("quota"));
        apply_next(&mut stream, &queue).await;
        assert_eq!(stream.backoff.current_base(), FirestoreSettings::default().backoff.max_delay);
    }

    #[tokio::test]
    async fn unauthenticated_before_healthy_invalidates_token() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let credentials = Arc::new(RecordingCredentials::default());
        let mut stream = stream_with(Arc::clone(&connection), credentials.clone(), &queue);

        stream.start();
        let server = connection.accept(StreamKind::Listen).await.unwrap();
        apply_next(&mut stream, &queue).await;
        server.fail(unauthenticated("expired"));
        apply_next(&mut stream, &queue).await;
        assert_eq!(credentials.invalidations(), 1);
    }

    #[tokio::test]
    async fn unauthenticated_after_healthy_keeps_token() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let credentials = Arc::new(RecordingCredentials::default());
        let mut stream = stream_with(Arc::clone(&connection), credentials.clone(), &queue);

        stream.start();
        let server = connection.accept(StreamKind::Listen).await.unwrap();
        apply_next(&mut stream, &queue).await;
        server.send(json!({})).unwrap();
        apply_next(&mut stream, &queue).await;
        server.fail(unauthenticated("expired"));
        apply_next(&mut stream, &queue).await;
        assert_eq!(credentials.invalidations(), 0);
    }

    #[tokio::test]
    async fn app_check_token_is_sent_and_invalidated_with_auth() {
        let connection = InMemoryConnection::new();
        let queue = AsyncQueue::start(Vec::new());
        let credentials = Arc::new(RecordingCredentials::default());
        let app_check = Arc::new(RecordingCredentials::default());
        let mut stream = stream_with(Arc::clone(&connection), credentials.clone(), &queue);
        stream.set_app_check_provider(app_check.clone());

        stream.start();
        let server = connection.accept(StreamKind::Listen).await.unwrap();
        assert_eq!(
            connection.tokens().await,
            vec![StreamTokens {
                auth_token: Some("token-0".into()),
                app_check_token: Some("token-0".into()),
            }]
        );
        apply_next(&mut stream, &queue).await;
        server.fail(unauthenticated("expired"));
        apply_next(&mut stream, &queue).await;
        assert_eq!(credentials.invalidations(), 1);
        assert_eq!(app_check.invalidations(), 1);
    }
}
