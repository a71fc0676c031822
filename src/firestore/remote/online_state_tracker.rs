use std::sync::Arc;
use std::time::Duration;

use crate::firestore::core::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::firestore::remote::scheduler::{RemoteScheduler, RemoteStoreEvent};
use crate::util::async_queue::{DelayedOperation, TimerId};

const LOG_TARGET: &str = "firestore::online_state";

/// Listen stream failures tolerated before reporting `Offline`.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Derives the client's [`OnlineState`] from listen stream activity.
///
/// Starts out `Unknown`. Turns `Offline` once the listen stream has failed
/// [`MAX_WATCH_STREAM_FAILURES`] times or connecting takes longer than the
/// online state timeout, and `Online` once the remote store reports a
/// successful message. Every method returns the new state when it changed.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
    timeout: Duration,
    scheduler: Arc<dyn RemoteScheduler>,
}

impl OnlineStateTracker {
    pub fn new(scheduler: Arc<dyn RemoteScheduler>, timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timer: None,
            should_warn_client_is_offline: true,
            timeout,
            scheduler,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called whenever the listen stream is (re)started.
    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        self.clear_timer();
        self.timer = Some(self.scheduler.dispatch_after_delay(
            TimerId::OnlineStateTimeout,
            self.timeout,
            RemoteStoreEvent::OnlineStateTimeout,
        ));
        changed
    }

    /// The watchdog scheduled by [`Self::handle_watch_stream_start`] fired.
    pub fn handle_timeout(&mut self) -> Option<OnlineState> {
        self.timer = None;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_offline_warning(&format!(
            "Backend didn't respond within {} seconds.",
            self.timeout.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: Option<&FirestoreError>) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // A healthy stream dropped; reconnecting decides what happens next.
            return self.set_and_broadcast(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures < MAX_WATCH_STREAM_FAILURES {
            return None;
        }
        self.clear_timer();
        let detail = error.map(ToString::to_string).unwrap_or_default();
        self.log_offline_warning(&format!(
            "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {detail}"
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    /// Explicit transition from the remote store. Resets the failure count.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        log::debug!(target: LOG_TARGET, "online state {:?} -> {state:?}", self.state);
        self.state = state;
        Some(state)
    }

    fn log_offline_warning(&mut self, details: &str) {
        let message = format!(
            "Could not reach Cloud Firestore backend. {details}\n\
             This typically indicates that your device does not have a healthy Internet connection at the moment. \
             The client will operate in offline mode until it is able to successfully connect to the backend."
        );
        if self.should_warn_client_is_offline {
            log::warn!(target: LOG_TARGET, "{message}");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!(target: LOG_TARGET, "{message}");
        }
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use crate::util::async_queue::AsyncQueue;

    fn tracker() -> (OnlineStateTracker, AsyncQueue<Vec<RemoteStoreEvent>>) {
        let queue = AsyncQueue::start(Vec::new());
        let tracker = OnlineStateTracker::new(Arc::new(queue.clone()), Duration::from_secs(10));
        (tracker, queue)
    }

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let (mut tracker, queue) = tracker();
        assert_eq!(tracker.handle_watch_stream_start(), None);
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        let error = unavailable("down");
        assert_eq!(
            tracker.handle_watch_stream_failure(Some(&error)),
            Some(OnlineState::Offline)
        );
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }

    #[tokio::test]
    async fn watchdog_goes_offline() {
        let (mut tracker, queue) = tracker();
        tracker.handle_watch_stream_start();
        queue
            .run_delayed_operations_early(Some(TimerId::OnlineStateTimeout))
            .await
            .unwrap();
        let events = queue.enqueue(std::mem::take).await.unwrap();
        assert!(matches!(events.as_slice(), [RemoteStoreEvent::OnlineStateTimeout]));
        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
    }

    #[tokio::test]
    async fn online_failure_drops_to_unknown_only() {
        let (mut tracker, _queue) = tracker();
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(
            tracker.handle_watch_stream_failure(None),
            Some(OnlineState::Unknown)
        );
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
    }

    #[tokio::test]
    async fn restart_after_failure_keeps_offline() {
        let (mut tracker, queue) = tracker();
        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(None);
        assert_eq!(tracker.handle_watch_stream_start(), None);
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }
}
