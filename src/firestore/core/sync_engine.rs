use std::collections::{BTreeMap, HashMap, VecDeque};

use futures::channel::oneshot;

use crate::firestore::core::{
    LimboDocumentChange, OnlineState, Query, TargetId, TargetIdGenerator, User, View, ViewSnapshot,
};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, LocalViewChanges, ReferenceSet, TargetData, TargetPurpose, INVALID_SEQUENCE_NUMBER};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{is_primary_lease_lost, RemoteEvent, RemoteStore, RemoteSyncer, TargetChange};
use crate::firestore::settings::FirestoreSettings;

const LOG_TARGET: &str = "firestore::sync_engine";

/// Resolves once a write is acknowledged or rejected by the backend.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// What the sync engine has for the event manager after an operation.
#[derive(Debug)]
pub enum SyncEngineEvent {
    Snapshots(Vec<ViewSnapshot>),
    QueryError(Query, FirestoreError),
    OnlineStateChanged(OnlineState),
}

/// A query with its target and view.
#[derive(Debug)]
pub struct QueryView {
    pub query: Query,
    pub target_id: TargetId,
    pub view: View,
}

#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Set once the resolution target reported the document; a target that
    /// turns current without it confirms the deletion.
    received_document: bool,
}

/// Connects views, the local store and the remote store.
///
/// Remote events and write results come in through [`RemoteSyncer`]; user
/// listens and writes through the methods below. Snapshots and errors for
/// listeners are buffered and collected with [`SyncEngine::take_events`].
pub struct SyncEngine {
    local_store: LocalStore,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Keys waiting for a free limbo resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views hold each limbo document.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    /// Write callbacks per user, keyed by batch id.
    mutation_user_callbacks: HashMap<String, BTreeMap<BatchId, WriteCallback>>,
    /// Waiting for every batch up to the key to be acknowledged or rejected.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    current_user: User,
    online_state: OnlineState,
    is_primary: bool,
    events: Vec<SyncEngineEvent>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, settings: &FirestoreSettings) -> Self {
        let current_user = local_store.user().clone();
        Self {
            local_store,
            query_views: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
            mutation_user_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            current_user,
            online_state: OnlineState::Unknown,
            is_primary: true,
            events: Vec::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn local_store_mut(&mut self) -> &mut LocalStore {
        &mut self.local_store
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn query_view(&self, query: &Query) -> Option<&QueryView> {
        self.query_views.get(&query.canonical_id())
    }

    /// Drains the events raised since the last call.
    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Limbo documents with a resolution target, and that target's id.
    pub fn active_limbo_document_resolutions(&self) -> &BTreeMap<DocumentKey, TargetId> {
        &self.active_limbo_targets_by_key
    }

    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Starts a view of `query` and returns its first snapshot. The target is
    /// watched on the backend when `should_listen_to_remote` is set.
    pub fn listen(
        &mut self,
        remote: &mut RemoteStore,
        query: Query,
        should_listen_to_remote: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        // A query sharing a target that is already current gets no new
        // CURRENT from watch, so it inherits the existing view's state.
        let current = self.is_target_current(target_data.target_id);
        let snapshot = self.initialize_view_and_compute_snapshot(
            remote,
            query,
            target_data.target_id,
            current,
            &target_data,
        )?;
        if should_listen_to_remote && self.is_primary {
            remote.listen(target_data, self);
        }
        Ok(snapshot)
    }

    fn is_target_current(&self, target_id: TargetId) -> bool {
        self.queries_by_target
            .get(&target_id)
            .and_then(|queries| queries.first())
            .and_then(|query| self.query_views.get(&query.canonical_id()))
            .is_some_and(|query_view| query_view.view.is_current())
    }

    /// Starts watching an existing cache-only query on the backend.
    pub fn listen_to_remote_store(&mut self, remote: &mut RemoteStore, query: &Query) -> FirestoreResult<()> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        if self.is_primary {
            remote.listen(target_data, self);
        }
        Ok(())
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        remote: &mut RemoteStore,
        query: Query,
        target_id: TargetId,
        current: bool,
        target_data: &TargetData,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized = TargetChange::synthesized_for_current_change(
            current && self.online_state != OnlineState::Offline,
            target_data.resume_token.clone(),
        );
        let view_change = view.apply_changes(doc_changes, self.is_primary, Some(&synthesized), false);
        let snapshot = view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot());
        self.update_tracked_limbos(remote, target_id, view_change.limbo_changes);

        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query,
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    /// Drops the view of `query`. The target is released once no other query
    /// uses it.
    pub fn unlisten(
        &mut self,
        remote: &mut RemoteStore,
        query: &Query,
        should_unlisten_to_remote: bool,
    ) -> FirestoreResult<()> {
        let Some(query_view) = self.query_views.remove(&query.canonical_id()) else {
            return Err(internal_error(format!(
                "Trying to unlisten on query not found: {}",
                query.canonical_id()
            )));
        };
        let target_id = query_view.target_id;
        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            queries.retain(|other| other != query);
            if !queries.is_empty() {
                return Ok(());
            }
        }

        ignore_if_primary_lease_loss(self.local_store.release_target(target_id, false))?;
        if should_unlisten_to_remote && self.is_primary {
            remote.unlisten(target_id, self);
        }
        self.remove_and_clean_up_target(remote, target_id, None);
        Ok(())
    }

    /// Stops watching `query` on the backend while cache-only listeners remain.
    pub fn unlisten_from_remote_store(&mut self, remote: &mut RemoteStore, query: &Query) {
        let Some(query_view) = self.query_views.get(&query.canonical_id()) else {
            return;
        };
        let target_id = query_view.target_id;
        let shared = self
            .queries_by_target
            .get(&target_id)
            .is_some_and(|queries| queries.len() > 1);
        if !shared && self.is_primary {
            remote.unlisten(target_id, self);
        }
    }

    /// Queues `mutations` locally, shows them in every affected view and
    /// hands the batch to the write pipeline. `callback` settles once the
    /// backend answers.
    pub fn write(
        &mut self,
        remote: &mut RemoteStore,
        mutations: Vec<Mutation>,
        callback: WriteCallback,
    ) -> FirestoreResult<()> {
        let result = match self.local_store.write_locally(mutations, Timestamp::now()) {
            Ok(result) => result,
            Err(err) => {
                log::warn!(target: LOG_TARGET, "dropping write that cannot be persisted: {err}");
                let _ = callback.send(Err(err.clone()));
                return Err(err);
            }
        };
        self.mutation_user_callbacks
            .entry(self.current_user.to_key())
            .or_default()
            .insert(result.batch_id, callback);
        self.emit_new_snaps_and_notify_local_store(remote, &result.changes, None)?;
        remote.fill_write_pipeline(self)
    }

    /// Settles `callback` once every write queued so far has been answered.
    pub fn register_pending_writes_callback(
        &mut self,
        remote: &RemoteStore,
        callback: WriteCallback,
    ) -> FirestoreResult<()> {
        if !remote.can_use_network() {
            log::debug!(
                target: LOG_TARGET,
                "the network is disabled; pending writes will only resolve once it is enabled"
            );
        }
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id()?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return Ok(());
        }
        self.pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
        Ok(())
    }

    /// Makes this client drive the network, or hands the network over to
    /// another client.
    pub fn apply_primary_state(&mut self, remote: &mut RemoteStore, is_primary: bool) -> FirestoreResult<()> {
        if is_primary == self.is_primary {
            return Ok(());
        }
        self.is_primary = is_primary;
        if is_primary {
            remote.apply_primary_state(true, self)?;
            let targets: Vec<TargetId> = self.queries_by_target.keys().copied().collect();
            for target_id in targets {
                if let Some(target_data) = self.local_store.get_target_data(target_id).cloned() {
                    remote.listen(target_data, self);
                }
            }
        } else {
            let limbo_keys: Vec<DocumentKey> = self.active_limbo_targets_by_key.keys().cloned().collect();
            for key in limbo_keys {
                self.remove_limbo_target(remote, &key);
            }
            self.enqueued_limbo_resolutions.clear();
            self.limbo_document_refs.remove_all_references();
            remote.apply_primary_state(false, self)?;
        }
        Ok(())
    }

    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        remote: &mut RemoteStore,
        changes: &MutableDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let mut limbo_changes = Vec::new();

        for query_view in self.query_views.values_mut() {
            let target_id = query_view.target_id;
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                let result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes));
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let target_is_pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, self.is_primary, target_change, target_is_pending_reset);
            limbo_changes.push((target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(LocalViewChanges::from_view_snapshot(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, changes) in limbo_changes {
            self.update_tracked_limbos(remote, target_id, changes);
        }
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
        ignore_if_primary_lease_loss(self.local_store.notify_local_view_changes(&local_view_changes))
    }

    fn update_tracked_limbos(
        &mut self,
        remote: &mut RemoteStore,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs
                        .add_reference(key.clone(), target_id);
                    self.track_limbo_change(remote, key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!(target: LOG_TARGET, "document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(remote, &key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, remote: &mut RemoteStore, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        log::debug!(target: LOG_TARGET, "new document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(remote);
    }

    /// Starts resolution targets for queued limbo documents while slots are
    /// free.
    fn pump_enqueued_limbo_resolutions(&mut self, remote: &mut RemoteStore) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_id_generator.next();
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            let target_data = TargetData::new(
                Query::for_document(&key).to_target(),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            );
            remote.listen(target_data, self);
        }
    }

    fn remove_limbo_target(&mut self, remote: &mut RemoteStore, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        remote.unlisten(target_id, self);
        self.active_limbo_resolutions_by_target.remove(&target_id);
        self.pump_enqueued_limbo_resolutions(remote);
    }

    fn remove_and_clean_up_target(
        &mut self,
        remote: &mut RemoteStore,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.events
                    .push(SyncEngineEvent::QueryError(query, error.clone()));
            }
        }
        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(remote, &key);
            }
        }
    }

    fn process_user_callback(&mut self, batch_id: BatchId, error: Option<FirestoreError>) {
        let callback = self
            .mutation_user_callbacks
            .get_mut(&self.current_user.to_key())
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            let _ = callback.send(match error {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        if let Some(callbacks) = self.pending_writes_callbacks.remove(&batch_id) {
            for callback in callbacks {
                let _ = callback.send(Ok(()));
            }
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = callback.send(Err(cancelled(message)));
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&mut self, remote: &mut RemoteStore, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let reported =
                change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len();
            if reported > 1 {
                return Err(internal_error(
                    "Limbo resolution for a single document contained multiple changes",
                ));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received change for limbo target document without add"));
                }
            } else if !change.removed_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received remove for limbo target document without add"));
                }
                resolution.received_document = false;
            }
        }

        let changes = match self.local_store.apply_remote_event(&event) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(Err(err)),
        };
        self.emit_new_snaps_and_notify_local_store(remote, &changes, Some(&event))
    }

    fn reject_listen(&mut self, remote: &mut RemoteStore, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.remove(&target_id) {
            // The backend refused to watch the document; treat it as deleted
            // so the views stop waiting for it.
            let key = resolution.key;
            self.active_limbo_targets_by_key.remove(&key);
            self.pump_enqueued_limbo_resolutions(remote);

            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event(remote, event);
        }

        log::debug!(target: LOG_TARGET, "listen for target {target_id} rejected: {error}");
        ignore_if_primary_lease_loss(self.local_store.release_target(target_id, false))?;
        self.remove_and_clean_up_target(remote, target_id, Some(error));
        Ok(())
    }

    fn apply_successful_write(&mut self, remote: &mut RemoteStore, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = match self.local_store.acknowledge_batch(&result) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(Err(err)),
        };
        self.process_user_callback(batch_id, None);
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(remote, &changes, None)
    }

    fn reject_failed_write(&mut self, remote: &mut RemoteStore, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = match self.local_store.reject_batch(batch_id) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(Err(err)),
        };
        self.process_user_callback(batch_id, Some(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(remote, &changes, None)
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return std::iter::once(resolution.key.clone()).collect();
            }
            return DocumentKeySet::new();
        }
        let mut keys = DocumentKeySet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.local_store.next_mutation_batch(after_batch_id)
    }

    fn last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        self.local_store.get_last_remote_snapshot_version()
    }

    fn apply_online_state_change(&mut self, state: OnlineState) {
        let mut snapshots = Vec::new();
        for query_view in self.query_views.values_mut() {
            let view_change = query_view.view.apply_online_state_change(state);
            if let Some(snapshot) = view_change.snapshot {
                snapshots.push(snapshot);
            }
        }
        self.online_state = state;
        self.events.push(SyncEngineEvent::OnlineStateChanged(state));
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
    }

    fn handle_credential_change(&mut self, remote: &mut RemoteStore, user: User) -> FirestoreResult<()> {
        if user == self.current_user {
            return Ok(());
        }
        log::debug!(target: LOG_TARGET, "user change, new user: {}", user.to_key());
        let result = self.local_store.handle_user_change(user.clone())?;
        self.current_user = user;
        self.reject_outstanding_pending_writes_callbacks(
            "'waitForPendingWrites' promise is rejected due to a user change.",
        );
        self.emit_new_snaps_and_notify_local_store(remote, &result.affected_documents, None)
    }
}

/// Losing the primary lease means another client took over; that is not an
/// error for this one.
fn ignore_if_primary_lease_loss(result: FirestoreResult<()>) -> FirestoreResult<()> {
    match result {
        Err(err) if is_primary_lease_lost(&err) => {
            log::debug!(target: LOG_TARGET, "unexpectedly lost primary lease");
            Ok(())
        }
        other => other,
    }
}
