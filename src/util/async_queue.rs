use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::channel::oneshot;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::firestore::remote::is_transaction_error;
use crate::firestore::settings::BackoffSettings;
use crate::platform::runtime;
use crate::util::backoff::ExponentialBackoff;

const LOG_TARGET: &str = "firestore::async_queue";

/// Identifies the kind of a delayed operation so tests can fast-forward to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    HealthCheckTimeout,
    OnlineStateTimeout,
    LruGarbageCollection,
    AsyncQueueRetry,
}

type Operation<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

struct DelayedEntry<S> {
    timer_id: TimerId,
    due_millis: i64,
    operation: Operation<S>,
}

trait DelayedRegistry: Send + Sync {
    fn cancel(&self, id: u64);
}

struct Shared<S> {
    sender: async_channel::Sender<Operation<S>>,
    delayed: Mutex<BTreeMap<u64, DelayedEntry<S>>>,
    next_delayed_id: AtomicU64,
    restricted: AtomicBool,
}

impl<S: Send + 'static> Shared<S> {
    fn submit(&self, operation: Operation<S>) {
        if self.restricted.load(Ordering::SeqCst) {
            log::debug!(target: LOG_TARGET, "dropping operation enqueued after shutdown");
            return;
        }
        if self.sender.try_send(operation).is_err() {
            log::debug!(target: LOG_TARGET, "queue worker is gone; operation dropped");
        }
    }

    fn fire(&self, id: u64) {
        let entry = match self.delayed.lock() {
            Ok(mut delayed) => delayed.remove(&id),
            Err(_) => None,
        };
        if let Some(entry) = entry {
            self.submit(entry.operation);
        }
    }
}

impl<S: Send + 'static> DelayedRegistry for Shared<S> {
    fn cancel(&self, id: u64) {
        if let Ok(mut delayed) = self.delayed.lock() {
            delayed.remove(&id);
        }
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    registry: Weak<dyn DelayedRegistry>,
}

impl Debug for DelayedOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Cancelling before the timer fires guarantees the operation never runs.
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.cancel(self.id);
        }
    }
}

/// Serialized task queue owning the state `S`.
///
/// Operations run one at a time in submission order on a single worker task,
/// so they never interleave and need no locking around `S`.
pub struct AsyncQueue<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    /// Spawns the worker that owns `state`.
    pub fn start(state: S) -> Self {
        Self::start_with(|_| state)
    }

    /// Like [`AsyncQueue::start`], for state that needs a handle to its own
    /// queue.
    pub fn start_with(build: impl FnOnce(&AsyncQueue<S>) -> S) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Operation<S>>();
        let queue = Self {
            shared: Arc::new(Shared {
                sender,
                delayed: Mutex::new(BTreeMap::new()),
                next_delayed_id: AtomicU64::new(0),
                restricted: AtomicBool::new(false),
            }),
        };
        let mut state = build(&queue);
        runtime::spawn_detached(async move {
            while let Ok(operation) = receiver.recv().await {
                operation(&mut state);
            }
            log::debug!(target: LOG_TARGET, "queue worker stopped");
        });
        queue
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.restricted.load(Ordering::SeqCst)
    }

    pub fn enqueue_and_forget(&self, operation: impl FnOnce(&mut S) + Send + 'static) {
        self.shared.submit(Box::new(operation));
    }

    /// Runs `operation` on the queue and resolves with its result. Resolves
    /// with `cancelled` when the queue shuts down first.
    pub fn enqueue<T, F>(&self, operation: F) -> impl Future<Output = FirestoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.shared.submit(Box::new(move |state| {
            let _ = sender.send(operation(state));
        }));
        async move {
            receiver
                .await
                .map_err(|_| cancelled("The client has already been terminated."))
        }
    }

    pub fn enqueue_after_delay(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: impl FnOnce(&mut S) + Send + 'static,
    ) -> DelayedOperation {
        let id = self.shared.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let due_millis = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        if let Ok(mut delayed) = self.shared.delayed.lock() {
            delayed.insert(
                id,
                DelayedEntry {
                    timer_id,
                    due_millis,
                    operation: Box::new(operation),
                },
            );
        }

        let weak = Arc::downgrade(&self.shared);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.fire(id);
            }
        });

        let registry: Weak<dyn DelayedRegistry> = Arc::downgrade(&self.shared) as Weak<dyn DelayedRegistry>;
        DelayedOperation {
            id,
            timer_id,
            registry,
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.shared
            .delayed
            .lock()
            .map(|delayed| delayed.values().any(|entry| entry.timer_id == timer_id))
            .unwrap_or(false)
    }

    /// Runs pending delayed operations now, in due order, stopping after the
    /// first one tagged `last` (all of them when `None`).
    pub async fn run_delayed_operations_early(&self, last: Option<TimerId>) -> FirestoreResult<()> {
        let ready = {
            let mut delayed = self
                .shared
                .delayed
                .lock()
                .map_err(|_| cancelled("delayed operations are unavailable"))?;
            let mut order: Vec<(i64, u64, TimerId)> = delayed
                .iter()
                .map(|(id, entry)| (entry.due_millis, *id, entry.timer_id))
                .collect();
            order.sort();

            let mut ready = Vec::new();
            for (_, id, timer_id) in order {
                if let Some(entry) = delayed.remove(&id) {
                    ready.push(entry.operation);
                }
                if Some(timer_id) == last {
                    break;
                }
            }
            ready
        };

        for operation in ready {
            self.shared.submit(operation);
        }
        self.enqueue(|_| ()).await
    }

    /// Runs `operation` until it stops failing with a transient persistence
    /// error, backing off between attempts.
    pub fn enqueue_retryable<F>(&self, operation: F)
    where
        F: FnMut(&mut S) -> FirestoreResult<()> + Send + 'static,
    {
        let queue = self.clone();
        let backoff = ExponentialBackoff::new(BackoffSettings::default());
        self.enqueue_and_forget(move |state| Self::attempt(queue, operation, backoff, state));
    }

    fn attempt<F>(queue: AsyncQueue<S>, mut operation: F, mut backoff: ExponentialBackoff, state: &mut S)
    where
        F: FnMut(&mut S) -> FirestoreResult<()> + Send + 'static,
    {
        match operation(state) {
            Ok(()) => {}
            Err(err) if is_transaction_error(&err) => {
                let delay = backoff.next_delay();
                log::debug!(target: LOG_TARGET, "retryable operation failed ({err}); retrying in {delay:?}");
                let next = queue.clone();
                queue.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move |state| {
                    Self::attempt(next, operation, backoff, state)
                });
            }
            Err(err) => {
                log::error!(target: LOG_TARGET, "retryable operation failed permanently: {err}");
            }
        }
    }

    /// Stops accepting new work; operations already queued still run.
    pub fn enter_restricted_mode(&self) {
        self.shared.restricted.store(true, Ordering::SeqCst);
        if let Ok(mut delayed) = self.shared.delayed.lock() {
            delayed.clear();
        }
    }

    /// Queues a final operation, then shuts the queue down. The worker drops
    /// its state once the final operation has run.
    pub fn enqueue_and_initiate_shutdown<T, F>(&self, operation: F) -> impl Future<Output = FirestoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        let result = self.enqueue(operation);
        self.enter_restricted_mode();
        self.shared.sender.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{failed_precondition, FirestoreErrorCode};
    use crate::firestore::remote::PRIMARY_LEASE_LOST_ERROR_MSG;

    #[tokio::test]
    async fn operations_run_in_fifo_order() {
        let queue = AsyncQueue::start(Vec::<u32>::new());
        for value in 0..5 {
            queue.enqueue_and_forget(move |log| log.push(value));
        }
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn runs_without_an_ambient_runtime() {
        let queue = AsyncQueue::start(1u32);
        let value = futures::executor::block_on(queue.enqueue(|state| {
            *state += 1;
            *state
        }))
        .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::start(Vec::<&'static str>::new());
        let first = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(60), |log| {
            log.push("idle")
        });
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(120), |log| {
            log.push("timeout")
        });
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        first.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));

        queue.run_delayed_operations_early(None).await.unwrap();
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(log, vec!["timeout"]);
    }

    #[tokio::test]
    async fn run_early_stops_after_requested_timer() {
        let queue = AsyncQueue::start(Vec::<&'static str>::new());
        queue.enqueue_after_delay(TimerId::WriteStreamIdle, Duration::from_secs(10), |log| log.push("a"));
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(20), |log| log.push("b"));
        queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(30), |log| log.push("c"));

        queue
            .run_delayed_operations_early(Some(TimerId::OnlineStateTimeout))
            .await
            .unwrap();
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(log, vec!["a", "b"]);
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
    }

    #[tokio::test]
    async fn retryable_operations_retry_lease_errors() {
        let queue = AsyncQueue::start(0u32);
        queue.enqueue_retryable(|attempts| {
            *attempts += 1;
            if *attempts < 3 {
                Err(failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG))
            } else {
                Ok(())
            }
        });
        queue.enqueue(|_| ()).await.unwrap();
        queue.run_delayed_operations_early(None).await.unwrap();
        queue.run_delayed_operations_early(None).await.unwrap();
        assert_eq!(queue.enqueue(|attempts| *attempts).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_cancelled() {
        let queue = AsyncQueue::start(());
        queue.enqueue_and_initiate_shutdown(|_| ()).await.unwrap();
        let err = queue.enqueue(|_| ()).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }
}
