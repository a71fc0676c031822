use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::{ChangeType, OnlineState, Query, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

const LOG_TARGET: &str = "firestore::event_manager";

pub type ViewSnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

/// Where a listener wants its results from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ListenSource {
    /// Local cache plus the backend.
    #[default]
    Default,
    /// Local cache only; never opens a watch target.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (pending writes, from-cache).
    pub include_metadata_changes: bool,
    /// Hold back the first cached snapshot while the client might be online.
    pub wait_for_sync_when_online: bool,
    pub source: ListenSource,
}

/// One user listener for a query. Decides which view snapshots are worth
/// raising.
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    observer: ViewSnapshotObserver,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl Debug for QueryListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryListener")
            .field("id", &self.id)
            .field("query", &self.query.canonical_id())
            .field("options", &self.options)
            .field("raised_initial_event", &self.raised_initial_event)
            .finish()
    }
}

impl QueryListener {
    pub fn new(id: u64, query: Query, options: ListenOptions, observer: ViewSnapshotObserver) -> Self {
        Self {
            id,
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let document_changes = snapshot
                .document_changes
                .into_iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .collect();
            ViewSnapshot {
                document_changes,
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            (self.observer)(Ok(snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    /// Going offline can release a cached first snapshot that was held back.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is not worth raising unless the backend
        // cannot be reached.
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        (self.observer)(Ok(initial));
    }
}

/// Hooks the event manager uses to start and stop query targets.
pub trait ListenCallbacks {
    /// Starts a local view of `query`, optionally with a watch target, and
    /// returns its first snapshot.
    fn on_listen(&mut self, query: &Query, enable_remote_listen: bool) -> FirestoreResult<Option<ViewSnapshot>>;

    fn on_unlisten(&mut self, query: &Query, disable_remote_listen: bool) -> FirestoreResult<()>;

    /// A cache-only query gained its first listener that needs the backend.
    fn on_first_remote_store_listen(&mut self, query: &Query) -> FirestoreResult<()>;

    /// The last listener needing the backend went away; cache-only ones remain.
    fn on_last_remote_store_unlisten(&mut self, query: &Query) -> FirestoreResult<()>;
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners
            .iter()
            .any(QueryListener::listens_to_remote_store)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupAction {
    None,
    InitializeLocalListenAndRequireWatchConnection,
    InitializeLocalListenOnly,
    RequireWatchConnectionOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownAction {
    None,
    TerminateLocalListenAndRequireWatchDisconnection,
    TerminateLocalListenOnly,
    RequireWatchDisconnectionOnly,
}

/// Fans view snapshots out to every listener of the same query and starts
/// or stops targets as listeners come and go.
#[derive(Default)]
pub struct EventManager {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_listeners(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    pub fn listen(&mut self, mut listener: QueryListener, callbacks: &mut dyn ListenCallbacks) {
        let canonical_id = listener.query.canonical_id();
        let existing = self.queries.get(&canonical_id);
        let action = match existing {
            None if listener.listens_to_remote_store() => {
                SetupAction::InitializeLocalListenAndRequireWatchConnection
            }
            None => SetupAction::InitializeLocalListenOnly,
            Some(info) if !info.has_remote_listeners() && listener.listens_to_remote_store() => {
                SetupAction::RequireWatchConnectionOnly
            }
            Some(_) => SetupAction::None,
        };

        let query = listener.query.clone();
        let result = match action {
            SetupAction::InitializeLocalListenAndRequireWatchConnection => {
                callbacks.on_listen(&query, true).map(Some)
            }
            SetupAction::InitializeLocalListenOnly => callbacks.on_listen(&query, false).map(Some),
            SetupAction::RequireWatchConnectionOnly => {
                callbacks.on_first_remote_store_listen(&query).map(|_| None)
            }
            SetupAction::None => Ok(None),
        };
        let initial_snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(error) => {
                log::warn!(
                    target: LOG_TARGET,
                    "initialization of query '{}' failed: {error}",
                    query.canonical_id()
                );
                listener.on_error(error);
                return;
            }
        };

        let info = self.queries.entry(canonical_id).or_default();
        if let Some(Some(snapshot)) = initial_snapshot {
            info.view_snapshot = Some(snapshot);
        }
        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = info.view_snapshot.clone() {
            listener.on_view_snapshot(snapshot);
        }
        info.listeners.push(listener);
    }

    pub fn unlisten(
        &mut self,
        query: &Query,
        listener_id: u64,
        callbacks: &mut dyn ListenCallbacks,
    ) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let mut action = TeardownAction::None;
        if let Some(info) = self.queries.get_mut(&canonical_id) {
            if let Some(index) = info.listeners.iter().position(|l| l.id == listener_id) {
                let listener = info.listeners.remove(index);
                if info.listeners.is_empty() {
                    action = if listener.listens_to_remote_store() {
                        TeardownAction::TerminateLocalListenAndRequireWatchDisconnection
                    } else {
                        TeardownAction::TerminateLocalListenOnly
                    };
                } else if !info.has_remote_listeners() && listener.listens_to_remote_store() {
                    action = TeardownAction::RequireWatchDisconnectionOnly;
                }
            }
        }

        match action {
            TeardownAction::TerminateLocalListenAndRequireWatchDisconnection => {
                self.queries.remove(&canonical_id);
                callbacks.on_unlisten(query, true)
            }
            TeardownAction::TerminateLocalListenOnly => {
                self.queries.remove(&canonical_id);
                callbacks.on_unlisten(query, false)
            }
            TeardownAction::RequireWatchDisconnectionOnly => {
                callbacks.on_last_remote_store_unlisten(query)
            }
            TeardownAction::None => Ok(()),
        }
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
            info.view_snapshot = Some(snapshot);
        }
    }

    /// Fails every listener of `query`; the query is forgotten.
    pub fn on_watch_error(&mut self, query: &Query, error: FirestoreError) {
        if let Some(info) = self.queries.remove(&query.canonical_id()) {
            for listener in &info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    /// Fails every listener and releases every query's target. Used when
    /// remote changes could not be applied locally, after which no snapshot
    /// can be trusted.
    pub fn on_unrecoverable_error(&mut self, error: FirestoreError, callbacks: &mut dyn ListenCallbacks) {
        for info in std::mem::take(&mut self.queries).into_values() {
            for listener in &info.listeners {
                listener.on_error(error.clone());
            }
            let Some(query) = info.listeners.first().map(|listener| listener.query.clone()) else {
                continue;
            };
            if let Err(err) = callbacks.on_unlisten(&query, info.has_remote_listeners()) {
                log::warn!(
                    target: LOG_TARGET,
                    "failed to release query '{}' after an unrecoverable error: {err}",
                    query.canonical_id()
                );
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{DocumentViewChange, View};
    use crate::firestore::error::{internal_error, unavailable};
    use crate::firestore::model::{
        DocumentKey, DocumentKeySet, DocumentSet, MutableDocument, ObjectValue, ResourcePath,
        SnapshotVersion, Timestamp,
    };
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn recorder() -> (Events, ViewSnapshotObserver) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, Arc::new(move |event| sink.lock().unwrap().push(event)))
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        )
    }

    fn snapshot(documents: Vec<MutableDocument>, from_cache: bool) -> ViewSnapshot {
        let mut set = DocumentSet::new(rooms().comparator());
        for document in &documents {
            set.add(document.clone());
        }
        ViewSnapshot {
            query: rooms(),
            old_documents: set.empty_like(),
            documents: set,
            document_changes: documents
                .into_iter()
                .map(|d| DocumentViewChange::new(ChangeType::Added, d))
                .collect(),
            mutated_keys: DocumentKeySet::new(),
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results: false,
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        calls: Vec<String>,
        initial: Option<ViewSnapshot>,
    }

    impl ListenCallbacks for RecordingCallbacks {
        fn on_listen(&mut self, _query: &Query, enable_remote_listen: bool) -> FirestoreResult<Option<ViewSnapshot>> {
            self.calls.push(format!("listen:{enable_remote_listen}"));
            Ok(self.initial.clone())
        }

        fn on_unlisten(&mut self, _query: &Query, disable_remote_listen: bool) -> FirestoreResult<()> {
            self.calls.push(format!("unlisten:{disable_remote_listen}"));
            Ok(())
        }

        fn on_first_remote_store_listen(&mut self, _query: &Query) -> FirestoreResult<()> {
            self.calls.push("first-remote".to_string());
            Ok(())
        }

        fn on_last_remote_store_unlisten(&mut self, _query: &Query) -> FirestoreResult<()> {
            self.calls.push("last-remote".to_string());
            Ok(())
        }
    }

    #[test]
    fn empty_cached_snapshot_waits_until_offline() {
        let (events, observer) = recorder();
        let mut listener = QueryListener::new(1, rooms(), ListenOptions::default(), observer);
        assert!(!listener.on_view_snapshot(snapshot(Vec::new(), true)));
        assert!(events.lock().unwrap().is_empty());
        assert!(listener.apply_online_state_change(OnlineState::Offline));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let (events, observer) = recorder();
        let mut listener = QueryListener::new(1, rooms(), ListenOptions::default(), observer);
        assert!(listener.on_view_snapshot(snapshot(vec![doc("rooms/a")], true)));

        let mut synced = snapshot(Vec::new(), false);
        synced.documents.add(doc("rooms/a"));
        assert!(!listener.on_view_snapshot(synced.clone()));

        let (events_with_metadata, observer) = recorder();
        let options = ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        };
        let mut with_metadata = QueryListener::new(2, rooms(), options, observer);
        with_metadata.on_view_snapshot(snapshot(vec![doc("rooms/a")], true));
        assert!(with_metadata.on_view_snapshot(synced));
        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(events_with_metadata.lock().unwrap().len(), 2);
    }

    #[test]
    fn remote_listen_starts_with_first_listener_and_stops_with_last() {
        let mut manager = EventManager::new();
        let mut callbacks = RecordingCallbacks {
            initial: Some(snapshot(vec![doc("rooms/a")], true)),
            ..RecordingCallbacks::default()
        };
        let (first_events, observer) = recorder();
        manager.listen(QueryListener::new(1, rooms(), ListenOptions::default(), observer), &mut callbacks);
        let (_, observer) = recorder();
        manager.listen(QueryListener::new(2, rooms(), ListenOptions::default(), observer), &mut callbacks);
        assert_eq!(callbacks.calls, vec!["listen:true"]);
        assert_eq!(first_events.lock().unwrap().len(), 1);

        manager.unlisten(&rooms(), 1, &mut callbacks).unwrap();
        assert_eq!(callbacks.calls.len(), 1);
        manager.unlisten(&rooms(), 2, &mut callbacks).unwrap();
        assert_eq!(callbacks.calls, vec!["listen:true", "unlisten:true"]);
        assert!(!manager.has_listeners(&rooms()));
    }

    #[test]
    fn cache_only_listener_upgrades_to_remote() {
        let mut manager = EventManager::new();
        let mut callbacks = RecordingCallbacks::default();
        let cache_only = ListenOptions {
            source: ListenSource::Cache,
            ..ListenOptions::default()
        };
        let (_, observer) = recorder();
        manager.listen(QueryListener::new(1, rooms(), cache_only, observer), &mut callbacks);
        let (_, observer) = recorder();
        manager.listen(QueryListener::new(2, rooms(), ListenOptions::default(), observer), &mut callbacks);
        manager.unlisten(&rooms(), 2, &mut callbacks).unwrap();
        manager.unlisten(&rooms(), 1, &mut callbacks).unwrap();
        assert_eq!(
            callbacks.calls,
            vec!["listen:false", "first-remote", "last-remote", "unlisten:false"]
        );
    }

    #[test]
    fn watch_errors_reach_every_listener() {
        let mut manager = EventManager::new();
        let mut callbacks = RecordingCallbacks::default();
        let (events, observer) = recorder();
        manager.listen(QueryListener::new(1, rooms(), ListenOptions::default(), observer), &mut callbacks);
        manager.on_watch_error(&rooms(), unavailable("gone"));
        assert!(events.lock().unwrap()[0].is_err());
        assert!(!manager.has_listeners(&rooms()));

        let view = View::new(rooms(), DocumentKeySet::new());
        assert!(view.limbo_documents().is_empty());
    }

    #[test]
    fn unrecoverable_errors_fail_and_release_every_query() {
        let mut manager = EventManager::new();
        let mut callbacks = RecordingCallbacks::default();
        let (remote_events, remote_observer) = recorder();
        let (cache_events, cache_observer) = recorder();
        let cache_only = ListenOptions {
            source: ListenSource::Cache,
            ..ListenOptions::default()
        };
        let users = Query::new(ResourcePath::from_string("users").unwrap());
        manager.listen(QueryListener::new(1, rooms(), ListenOptions::default(), remote_observer), &mut callbacks);
        manager.listen(QueryListener::new(2, users.clone(), cache_only, cache_observer), &mut callbacks);
        callbacks.calls.clear();

        manager.on_unrecoverable_error(internal_error("local store failed"), &mut callbacks);

        assert!(remote_events.lock().unwrap().last().unwrap().is_err());
        assert!(cache_events.lock().unwrap().last().unwrap().is_err());
        assert!(!manager.has_listeners(&rooms()));
        assert!(!manager.has_listeners(&users));
        let mut calls = callbacks.calls.clone();
        calls.sort();
        assert_eq!(calls, vec!["unlisten:false", "unlisten:true"]);
    }
}
