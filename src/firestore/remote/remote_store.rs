use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::firestore::core::{OnlineState, TargetId, User};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{DatabaseId, DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::connection::{Connection, CredentialsProvider, StreamKind};
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::rpc_error::{is_permanent_write_error, is_transaction_error};
use crate::firestore::remote::scheduler::{RemoteScheduler, RemoteStoreEvent};
use crate::firestore::remote::serializer::{JsonProtoSerializer, WriteResponse};
use crate::firestore::remote::stream::PersistentStream;
use crate::firestore::remote::streams::{WatchStream, WatchStreamEvent, WriteStream, WriteStreamEvent};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::value::BytesValue;
use crate::util::async_queue::{DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

const LOG_TARGET: &str = "firestore::remote_store";

/// Reasons the remote store keeps the network off. The network is used only
/// while none applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OfflineCause {
    UserDisabled,
    /// Persistence failed; a probe re-enables the network once it recovers.
    IndexedDbFailed,
    IsSecondary,
    CredentialChange,
    Shutdown,
    ConnectivityChange,
}

struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
    database_id: &'a DatabaseId,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.listen_targets.get(&target_id)
    }

    fn database_id(&self) -> &DatabaseId {
        self.database_id
    }
}

/// Owns the listen and write streams.
///
/// Tracks the targets the client listens to and the batches in flight to the
/// backend, restarting streams as the network allows. Everything runs on the
/// client's queue; stream activity arrives through
/// [`RemoteStore::handle_event`].
pub struct RemoteStore {
    database_id: DatabaseId,
    /// Active listens. Entries carry the latest resume token.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Batches sent or about to be sent, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    watch_change_aggregator: Option<WatchChangeAggregator>,
    offline_causes: BTreeSet<OfflineCause>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    max_pending_writes: usize,
    scheduler: Arc<dyn RemoteScheduler>,
    recovery_backoff: ExponentialBackoff,
    recovery_probe: Option<DelayedOperation>,
}

impl RemoteStore {
    pub fn new(
        database_id: DatabaseId,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        scheduler: Arc<dyn RemoteScheduler>,
        settings: &FirestoreSettings,
    ) -> Self {
        let open = |kind| {
            PersistentStream::new(
                kind,
                Arc::clone(&connection),
                Arc::clone(&credentials),
                Arc::clone(&scheduler),
                settings,
            )
        };
        let watch_stream = WatchStream::new(open(StreamKind::Listen), JsonProtoSerializer::new(database_id.clone()));
        let write_stream = WriteStream::new(open(StreamKind::Write), JsonProtoSerializer::new(database_id.clone()));
        Self {
            database_id,
            listen_targets: BTreeMap::new(),
            write_pipeline: VecDeque::new(),
            watch_change_aggregator: None,
            offline_causes: BTreeSet::new(),
            watch_stream,
            write_stream,
            online_state_tracker: OnlineStateTracker::new(Arc::clone(&scheduler), settings.online_state_timeout),
            max_pending_writes: settings.max_pending_writes,
            scheduler,
            recovery_backoff: ExponentialBackoff::new(settings.backoff),
            recovery_probe: None,
        }
    }

    /// Both streams present tokens from `provider` on every open.
    pub fn set_app_check_provider(&mut self, provider: Arc<dyn CredentialsProvider>) {
        self.watch_stream.stream_mut().set_app_check_provider(Arc::clone(&provider));
        self.write_stream.stream_mut().set_app_check_provider(provider);
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn listen_targets(&self) -> &BTreeMap<TargetId, TargetData> {
        &self.listen_targets
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn offline_causes(&self) -> &BTreeSet<OfflineCause> {
        &self.offline_causes
    }

    pub fn watch_stream(&self) -> &WatchStream {
        &self.watch_stream
    }

    pub fn write_stream(&self) -> &WriteStream {
        &self.write_stream
    }

    /// Starts using the network.
    pub fn start(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.enable_network_internal(syncer)
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn enable_network(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(syncer)
    }

    /// Stops both streams and reports the client offline until
    /// [`RemoteStore::enable_network`].
    pub fn disable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        // Offline right away rather than after the watchdog.
        broadcast(self.online_state_tracker.set(OnlineState::Offline), syncer);
    }

    pub fn shutdown(&mut self, syncer: &mut dyn RemoteSyncer) {
        log::debug!(target: LOG_TARGET, "remote store shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        if let Some(probe) = self.recovery_probe.take() {
            probe.cancel();
        }
        broadcast(self.online_state_tracker.set(OnlineState::Unknown), syncer);
    }

    /// Tears the streams down and back up, as after a connectivity change.
    pub fn restart_network(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        log::debug!(target: LOG_TARGET, "restarting streams for network reachability change");
        self.offline_causes.insert(OfflineCause::ConnectivityChange);
        self.disable_network_internal();
        broadcast(self.online_state_tracker.set(OnlineState::Unknown), syncer);
        self.offline_causes.remove(&OfflineCause::ConnectivityChange);
        self.enable_network_internal(syncer)
    }

    /// Recreates both streams for `user` so they pick up new credentials and
    /// the new user's mutation queue.
    pub fn handle_credential_change(&mut self, user: User, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        log::debug!(target: LOG_TARGET, "remote store received new credentials");
        let used_network = self.can_use_network();
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        if used_network {
            broadcast(self.online_state_tracker.set(OnlineState::Unknown), syncer);
        }
        let result = syncer.handle_credential_change(self, user);
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        result?;
        self.enable_network_internal(syncer)
    }

    /// A secondary client leaves the network to the primary.
    pub fn apply_primary_state(&mut self, is_primary: bool, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if is_primary {
            self.offline_causes.remove(&OfflineCause::IsSecondary);
            self.enable_network_internal(syncer)
        } else {
            self.offline_causes.insert(OfflineCause::IsSecondary);
            self.disable_network_internal();
            broadcast(self.online_state_tracker.set(OnlineState::Unknown), syncer);
            Ok(())
        }
    }

    fn enable_network_internal(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        // Reconnect right away even if a stream failed before going offline.
        if !self.watch_stream.is_started() {
            self.watch_stream.inhibit_backoff();
        }
        if !self.write_stream.is_started() {
            self.write_stream.inhibit_backoff();
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else {
            broadcast(self.online_state_tracker.set(OnlineState::Unknown), syncer);
        }
        self.fill_write_pipeline(syncer)
    }

    fn disable_network_internal(&mut self) {
        self.write_stream.stop();
        self.watch_stream.stop();
        if !self.write_pipeline.is_empty() {
            log::debug!(
                target: LOG_TARGET,
                "stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.clean_up_watch_stream_state();
    }

    /// Starts watching `target_data` unless it is already watched.
    pub fn listen(&mut self, target_data: TargetData, syncer: &mut dyn RemoteSyncer) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(target_data, &*syncer);
        }
    }

    pub fn unlisten(&mut self, target_id: TargetId, syncer: &mut dyn RemoteSyncer) {
        if self.listen_targets.remove(&target_id).is_none() {
            log::debug!(target: LOG_TARGET, "unlisten for unknown target {target_id}");
        }
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // Nothing to listen to; leave the online state undetermined
                // rather than waiting on a stream that will not start.
                broadcast(self.online_state_tracker.set(OnlineState::Unknown), syncer);
            }
        }
    }

    fn send_watch_request(&mut self, target_data: TargetData, syncer: &dyn RemoteSyncer) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let target_data = if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min() {
            let expected_count = syncer.remote_keys_for_target(target_id).len() as i32;
            target_data.with_expected_count(expected_count)
        } else {
            target_data
        };
        if let Err(err) = self.watch_stream.watch(&target_data) {
            log::warn!(target: LOG_TARGET, "failed to send watch request for target {target_id}: {err}");
        }
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        if let Err(err) = self.watch_stream.unwatch(target_id) {
            log::warn!(target: LOG_TARGET, "failed to send unwatch request for target {target_id}: {err}");
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.watch_change_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        broadcast(self.online_state_tracker.handle_watch_stream_start(), syncer);
    }

    fn clean_up_watch_stream_state(&mut self) {
        self.watch_change_aggregator = None;
    }

    /// Applies an event that arrived on the queue for this store.
    pub fn handle_event(&mut self, event: RemoteStoreEvent, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        match event {
            RemoteStoreEvent::Stream {
                kind: StreamKind::Listen,
                generation,
                event,
            } => match self.watch_stream.handle_event(generation, event) {
                Some(WatchStreamEvent::Open) => {
                    self.on_watch_stream_open(syncer);
                    Ok(())
                }
                Some(WatchStreamEvent::Change {
                    change,
                    snapshot_version,
                }) => self.on_watch_stream_change(change, snapshot_version, syncer),
                Some(WatchStreamEvent::Close(error)) => {
                    self.on_watch_stream_close(error, syncer);
                    Ok(())
                }
                None => Ok(()),
            },
            RemoteStoreEvent::Stream {
                kind: StreamKind::Write,
                generation,
                event,
            } => match self.write_stream.handle_event(generation, event) {
                Some(WriteStreamEvent::Open) => {
                    if let Err(err) = self.write_stream.write_handshake() {
                        log::warn!(target: LOG_TARGET, "failed to send write handshake: {err}");
                    }
                    Ok(())
                }
                Some(WriteStreamEvent::HandshakeComplete) => {
                    self.on_write_handshake_complete();
                    Ok(())
                }
                Some(WriteStreamEvent::Response(response)) => self.on_mutation_result(response, syncer),
                Some(WriteStreamEvent::Close(error)) => self.on_write_stream_close(error, syncer),
                None => Ok(()),
            },
            RemoteStoreEvent::OnlineStateTimeout => {
                broadcast(self.online_state_tracker.handle_timeout(), syncer);
                Ok(())
            }
            RemoteStoreEvent::RecoveryProbe => {
                self.recovery_probe = None;
                self.probe_recovery(syncer)
            }
        }
    }

    fn on_watch_stream_open(&mut self, syncer: &mut dyn RemoteSyncer) {
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data, &*syncer);
        }
    }

    fn on_watch_stream_close(&mut self, error: Option<FirestoreError>, syncer: &mut dyn RemoteSyncer) {
        if error.is_none() && self.should_start_watch_stream() {
            log::warn!(target: LOG_TARGET, "watch stream closed gracefully while targets are active");
        }
        self.clean_up_watch_stream_state();
        if self.should_start_watch_stream() {
            broadcast(
                self.online_state_tracker
                    .handle_watch_stream_failure(error.as_ref()),
                syncer,
            );
            self.start_watch_stream(syncer);
        } else {
            // No targets; the stream will start again once one is added.
            broadcast(self.online_state_tracker.set(OnlineState::Unknown), syncer);
        }
    }

    fn on_watch_stream_change(
        &mut self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        // Any message proves connectivity.
        broadcast(self.online_state_tracker.set(OnlineState::Online), syncer);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = &target_change.cause {
                    return self.handle_target_error(target_change, cause.clone(), syncer);
                }
            }
        }

        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            log::debug!(target: LOG_TARGET, "dropping watch change without an active aggregator");
            return Ok(());
        };
        let metadata = ListenMetadata {
            listen_targets: &self.listen_targets,
            syncer: &*syncer,
            database_id: &self.database_id,
        };
        match change {
            WatchChange::Document(document_change) => aggregator.handle_document_change(&metadata, document_change),
            WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&metadata, &filter),
            WatchChange::TargetChange(target_change) => aggregator.handle_target_change(&metadata, &target_change),
        }

        if snapshot_version.is_min() {
            return Ok(());
        }
        match syncer.last_remote_snapshot_version() {
            Ok(last_remote_version) if snapshot_version >= last_remote_version => {
                self.raise_watch_snapshot(snapshot_version, syncer)
            }
            Ok(_) => Ok(()),
            Err(err) => self.disable_network_until_recovery(err, syncer),
        }
    }

    /// Hands the accumulated changes to the syncer as one consistent event.
    fn raise_watch_snapshot(&mut self, snapshot_version: SnapshotVersion, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            return Ok(());
        };
        let metadata = ListenMetadata {
            listen_targets: &self.listen_targets,
            syncer: &*syncer,
            database_id: &self.database_id,
        };
        let event = aggregator.create_remote_event(&metadata, snapshot_version);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Forget the resume token so the re-listen starts from scratch.
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(BytesValue::default(), target_data.snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(request, &*syncer);
        }

        match syncer.apply_remote_event(self, event) {
            Ok(()) => Ok(()),
            Err(err) => self.disable_network_until_recovery(err, syncer),
        }
    }

    fn handle_target_error(
        &mut self,
        change: &WatchTargetChange,
        cause: FirestoreError,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        for target_id in &change.target_ids {
            if self.listen_targets.remove(target_id).is_none() {
                continue;
            }
            log::debug!(target: LOG_TARGET, "target {target_id} removed by the backend: {cause}");
            if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            syncer.reject_listen(self, *target_id, cause.clone())?;
        }
        Ok(())
    }

    /// Recoverable persistence failures turn the network off until a probe
    /// read succeeds. Anything else is returned to the caller.
    fn disable_network_until_recovery(&mut self, error: FirestoreError, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !is_transaction_error(&error) {
            return Err(error);
        }
        log::debug!(target: LOG_TARGET, "persistence failed, disabling network until it recovers: {error}");
        self.offline_causes.insert(OfflineCause::IndexedDbFailed);
        self.disable_network_internal();
        broadcast(self.online_state_tracker.set(OnlineState::Offline), syncer);
        self.schedule_recovery_probe();
        Ok(())
    }

    fn schedule_recovery_probe(&mut self) {
        let delay = self.recovery_backoff.next_delay();
        self.recovery_probe = Some(self.scheduler.dispatch_after_delay(
            TimerId::AsyncQueueRetry,
            delay,
            RemoteStoreEvent::RecoveryProbe,
        ));
    }

    fn probe_recovery(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.offline_causes.contains(&OfflineCause::IndexedDbFailed) {
            return Ok(());
        }
        match syncer.last_remote_snapshot_version() {
            Ok(_) => {
                log::debug!(target: LOG_TARGET, "persistence recovered, re-enabling network");
                self.recovery_backoff.reset();
                self.offline_causes.remove(&OfflineCause::IndexedDbFailed);
                self.enable_network_internal(syncer)
            }
            Err(err) if is_transaction_error(&err) => {
                self.schedule_recovery_probe();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Pulls batches from the mutation queue until the pipeline is full and
    /// starts the write stream if needed.
    pub fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            let batch = match syncer.next_mutation_batch(last_batch_id) {
                Ok(batch) => batch,
                Err(err) => return self.disable_network_until_recovery(err, syncer),
            };
            let Some(batch) = batch else {
                if self.write_pipeline.is_empty() {
                    self.write_stream.mark_idle();
                }
                break;
            };
            last_batch_id = Some(batch.batch_id);
            self.add_to_write_pipeline(batch);
        }
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            if let Err(err) = self.write_stream.write_mutations(&batch.mutations) {
                log::warn!(target: LOG_TARGET, "failed to send batch {}: {err}", batch.batch_id);
            }
        }
        self.write_pipeline.push_back(batch);
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn on_write_handshake_complete(&mut self) {
        for batch in &self.write_pipeline {
            if let Err(err) = self.write_stream.write_mutations(&batch.mutations) {
                log::warn!(target: LOG_TARGET, "failed to send batch {}: {err}", batch.batch_id);
                break;
            }
        }
    }

    fn on_mutation_result(&mut self, response: WriteResponse, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let Some(batch) = self.write_pipeline.pop_front() else {
            log::warn!(target: LOG_TARGET, "write response without a pending batch");
            return Ok(());
        };
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.write_results,
            response.stream_token,
        )?;
        if let Err(err) = syncer.apply_successful_write(self, result) {
            return self.disable_network_until_recovery(err, syncer);
        }
        self.fill_write_pipeline(syncer)
    }

    fn on_write_stream_close(&mut self, error: Option<FirestoreError>, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if let Some(error) = error {
            if self.write_stream.handshake_complete() {
                self.handle_write_error(error, syncer)?;
            } else {
                log::debug!(target: LOG_TARGET, "write stream failed before the handshake: {error}");
            }
        }
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    fn handle_write_error(&mut self, error: FirestoreError, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Ok(());
        };
        log::warn!(target: LOG_TARGET, "batch {} rejected by the backend: {error}", batch.batch_id);
        // The request was at fault, not the connection.
        self.write_stream.inhibit_backoff();
        if let Err(err) = syncer.reject_failed_write(self, batch.batch_id, error) {
            return self.disable_network_until_recovery(err, syncer);
        }
        self.fill_write_pipeline(syncer)
    }
}

fn broadcast(change: Option<OnlineState>, syncer: &mut dyn RemoteSyncer) {
    if let Some(state) = change {
        syncer.apply_online_state_change(state);
    }
}
