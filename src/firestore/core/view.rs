use std::cmp::Ordering;

use crate::firestore::core::{
    ChangeType, DocumentChangeSet, DocumentViewChange, LimitType, OnlineState, Query, ViewSnapshot,
};
use crate::firestore::model::{DocumentKey, DocumentKeySet, DocumentSet, MutableDocument, MutableDocumentMap};
use crate::firestore::remote::TargetChange;

/// Whether a view reflects the backend or only the local cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// A document entering or leaving limbo for one view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Proposed new state of a view, before it is applied.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit boundary may have moved; the caller has to re-run the query
    /// against the local store and compute the changes again.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Per-query result set maintained from local and remote changes.
#[derive(Clone, Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    /// Whether the target reported `current` for its last change.
    current: bool,
    document_set: DocumentSet,
    limbo_documents: DocumentKeySet,
    /// Keys the backend says belong to the target.
    synced_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let document_set = DocumentSet::new(query.comparator());
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            limbo_documents: DocumentKeySet::new(),
            synced_documents,
            mutated_keys: DocumentKeySet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Works out how `changes` alter the view. Passing the result of a
    /// previous call continues from that state, as done after a refill.
    pub fn compute_doc_changes(
        &self,
        changes: &MutableDocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let at_limit = self
            .query
            .limit
            .is_some_and(|limit| old_document_set.len() as i64 == limit);
        let last_doc_in_limit = match self.query.limit_type {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };
        let comparator = old_document_set.comparator().clone();

        for (key, entry) in changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations = old_doc.is_some() && self.mutated_keys.contains(key);
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new_doc.clone()));
                            change_applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| comparator(new_doc, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| comparator(new_doc, first) == Ordering::Less);
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new_doc.clone()));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        // A document outside the limit may take the freed slot.
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.add(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit {
            while document_set.len() as i64 > limit {
                let trimmed = match self.query.limit_type {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(trimmed) = trimmed else {
                    break;
                };
                document_set.delete(trimmed.key());
                mutated_keys.remove(trimmed.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, trimmed));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Commits `doc_changes` and builds the snapshot for listeners, if
    /// anything visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let comparator = self.document_set.comparator().clone();
        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| comparator(&left.document, &right.document))
                .then_with(|| left.document.key().cmp(right.document.key()))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            document_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline makes a current view fall back to cache.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    /// Snapshot of the current state with every document reported as added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo_documents = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes = Vec::new();
        for key in old_limbo_documents.difference(&self.limbo_documents) {
            changes.push(LimboDocumentChange::Removed(key.clone()));
        }
        for key in self.limbo_documents.difference(&old_limbo_documents) {
            changes.push(LimboDocumentChange::Added(key.clone()));
        }
        changes
    }

    /// A visible document the backend has not confirmed and that no local
    /// write explains.
    fn should_be_in_limbo(&self, document: &MutableDocument) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// A document going from local to committed mutations keeps its old
/// contents until the backend sends the synced version.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Direction, OrderBy};
    use crate::firestore::model::{FieldPath, ObjectValue, ResourcePath, SnapshotVersion, Timestamp};
    use crate::firestore::value::{BytesValue, FirestoreValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn ranked(path: &str, rank: i64, seconds: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(
            &FieldPath::from_dot_separated("rank").unwrap(),
            FirestoreValue::from_integer(rank),
        );
        MutableDocument::new_found(key(path), SnapshotVersion::new(Timestamp::new(seconds, 0)), data)
    }

    fn by_rank(limit: Option<i64>) -> Query {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(OrderBy::new(
                FieldPath::from_dot_separated("rank").unwrap(),
                Direction::Ascending,
            ))
            .unwrap();
        match limit {
            Some(limit) => query.with_limit(limit, LimitType::First).unwrap(),
            None => query,
        }
    }

    fn changes(documents: Vec<MutableDocument>) -> MutableDocumentMap {
        documents
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect()
    }

    fn apply(view: &mut View, documents: Vec<MutableDocument>, target_change: Option<&TargetChange>) -> ViewChange {
        let doc_changes = view.compute_doc_changes(&changes(documents), None);
        view.apply_changes(doc_changes, true, target_change, false)
    }

    fn current_change(added: &[&str]) -> TargetChange {
        TargetChange {
            resume_token: BytesValue::from(b"token".to_vec()),
            current: true,
            added_documents: added.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    fn summary(snapshot: &ViewSnapshot) -> Vec<(ChangeType, String)> {
        snapshot
            .document_changes
            .iter()
            .map(|change| (change.change_type, change.document.key().to_string()))
            .collect()
    }

    #[test]
    fn limit_boundary_swaps_documents() {
        let mut view = View::new(by_rank(Some(2)), DocumentKeySet::new());
        let initial = apply(
            &mut view,
            vec![ranked("rooms/a", 1, 1), ranked("rooms/b", 2, 1), ranked("rooms/c", 3, 1)],
            None,
        );
        let keys: Vec<_> = initial.snapshot.unwrap().documents.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["rooms/a", "rooms/b"]);

        let update = apply(&mut view, vec![ranked("rooms/c", 0, 2)], None);
        let snapshot = update.snapshot.unwrap();
        assert_eq!(
            summary(&snapshot),
            vec![
                (ChangeType::Removed, "rooms/b".to_string()),
                (ChangeType::Added, "rooms/c".to_string()),
            ]
        );
        let keys: Vec<_> = snapshot.documents.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["rooms/c", "rooms/a"]);
    }

    #[test]
    fn removal_at_limit_requests_refill() {
        let mut view = View::new(by_rank(Some(2)), DocumentKeySet::new());
        apply(&mut view, vec![ranked("rooms/a", 1, 1), ranked("rooms/b", 2, 1)], None);

        let mut deleted = ranked("rooms/a", 1, 1);
        deleted.convert_to_no_document(SnapshotVersion::new(Timestamp::new(2, 0)));
        let doc_changes = view.compute_doc_changes(&changes(vec![deleted]), None);
        assert!(doc_changes.needs_refill);

        let refill = changes(vec![ranked("rooms/c", 3, 1)]);
        let doc_changes = view.compute_doc_changes(&refill, Some(doc_changes));
        let keys: Vec<_> = doc_changes.document_set.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["rooms/b", "rooms/c"]);
    }

    #[test]
    fn unconfirmed_documents_enter_limbo_once_current() {
        let mut view = View::new(by_rank(None), DocumentKeySet::new());
        let first = apply(&mut view, vec![ranked("rooms/a", 1, 1), ranked("rooms/b", 2, 1)], None);
        assert!(first.limbo_changes.is_empty());
        assert!(first.snapshot.unwrap().from_cache);

        let change = current_change(&["rooms/a"]);
        let result = apply(&mut view, Vec::new(), Some(&change));
        assert_eq!(result.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(result.snapshot.is_none());

        let confirm = TargetChange {
            current: true,
            added_documents: [key("rooms/b")].into_iter().collect(),
            ..TargetChange::default()
        };
        let result = apply(&mut view, Vec::new(), Some(&confirm));
        assert_eq!(result.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        let snapshot = result.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.document_changes.is_empty());
    }

    #[test]
    fn committed_write_waits_for_synced_document() {
        let mut view = View::new(by_rank(None), DocumentKeySet::new());
        let mut local = ranked("rooms/a", 1, 0);
        local.set_has_local_mutations();
        apply(&mut view, vec![local], None);

        let mut committed = ranked("rooms/a", 5, 2);
        committed.set_has_committed_mutations();
        let doc_changes = view.compute_doc_changes(&changes(vec![committed]), None);
        assert!(doc_changes.change_set.changes().is_empty());
    }

    #[test]
    fn metadata_change_when_pending_write_is_acknowledged() {
        let mut view = View::new(by_rank(None), DocumentKeySet::new());
        let mut local = ranked("rooms/a", 1, 0);
        local.set_has_local_mutations();
        let first = apply(&mut view, vec![local], None).snapshot.unwrap();
        assert!(first.has_pending_writes());

        let synced = ranked("rooms/a", 1, 2);
        let change = current_change(&["rooms/a"]);
        let snapshot = apply(&mut view, vec![synced], Some(&change)).snapshot.unwrap();
        assert_eq!(
            summary(&snapshot),
            vec![(ChangeType::Metadata, "rooms/a".to_string())]
        );
        assert!(!snapshot.has_pending_writes());
        assert!(!snapshot.from_cache);
    }

    #[test]
    fn going_offline_marks_view_from_cache() {
        let mut view = View::new(by_rank(None), DocumentKeySet::new());
        let change = current_change(&["rooms/a"]);
        let synced = apply(&mut view, vec![ranked("rooms/a", 1, 1)], Some(&change));
        assert!(!synced.snapshot.unwrap().from_cache);

        let offline = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = offline.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
