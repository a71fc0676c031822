use crate::firestore::core::{ChangeType, TargetId, ViewSnapshot};
use crate::firestore::model::DocumentKeySet;

/// Documents a view started or stopped showing, used to pin them in the
/// local store while they are visible.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_view_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut changes = Self {
            target_id,
            from_cache: snapshot.from_cache,
            ..Self::default()
        };
        for change in &snapshot.document_changes {
            let key = change.document.key().clone();
            match change.change_type {
                ChangeType::Added => {
                    changes.added_keys.insert(key);
                }
                ChangeType::Removed => {
                    changes.removed_keys.insert(key);
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        changes
    }
}
