use crate::firestore::core::{OnlineState, TargetId, User};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_store::RemoteStore;

/// What the [`RemoteStore`] calls back into.
///
/// Implemented by the sync engine. Callbacks that may start or stop listens
/// receive the remote store itself instead of holding a reference to it.
pub trait RemoteSyncer {
    /// Applies a consistent snapshot from the watch stream.
    fn apply_remote_event(&mut self, remote: &mut RemoteStore, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend removed `target_id` with `error`.
    fn reject_listen(&mut self, remote: &mut RemoteStore, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    fn apply_successful_write(&mut self, remote: &mut RemoteStore, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend refused the batch with a permanent error.
    fn reject_failed_write(&mut self, remote: &mut RemoteStore, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys the client currently believes match the target on the backend.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>>;

    fn last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion>;

    fn apply_online_state_change(&mut self, state: OnlineState);

    /// Switches the local state to `user` while the network is down.
    fn handle_credential_change(&mut self, remote: &mut RemoteStore, user: User) -> FirestoreResult<()>;
}
