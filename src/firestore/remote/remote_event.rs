use std::collections::BTreeMap;

use crate::firestore::core::TargetId;
use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{DocumentKeySet, MutableDocumentMap, SnapshotVersion};
use crate::firestore::value::BytesValue;

/// Consistent batch of watch changes at one snapshot version.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; they must be re-listened
    /// without a resume token.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: MutableDocumentMap,
    /// Updates that only concern limbo resolution targets.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// Event carrying only a `current` transition for one target, as raised
    /// when a target is added or rejected while the client is offline.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: BytesValue,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }
}

/// What changed for one target within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server sent no new token.
    pub resume_token: BytesValue,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: BytesValue) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }
}
