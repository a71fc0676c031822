use std::collections::{BTreeMap, HashMap};

use crate::firestore::local::persistence::DocumentOverlayCache;
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, Overlay, OverlayMap, ResourcePath,
};

#[derive(Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    overlay_keys_by_batch_id: HashMap<BatchId, DocumentKeySet>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key().clone();
        if let Some(existing) = self.overlays.get(&key) {
            if let Some(keys) = self
                .overlay_keys_by_batch_id
                .get_mut(&existing.largest_batch_id)
            {
                keys.remove(&key);
            }
        }
        self.overlays
            .insert(key.clone(), Overlay::new(largest_batch_id, mutation));
        self.overlay_keys_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key);
    }
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.get(key).cloned()
    }

    fn get_overlays(&self, keys: &DocumentKeySet) -> OverlayMap {
        keys.iter()
            .filter_map(|key| self.get_overlay(key).map(|overlay| (key.clone(), overlay)))
            .collect()
    }

    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>) {
        for mutation in overlays.into_values() {
            self.save_overlay(largest_batch_id, mutation);
        }
    }

    fn remove_overlays_for_batch_id(&mut self, keys: &DocumentKeySet, batch_id: BatchId) {
        if let Some(batch_keys) = self.overlay_keys_by_batch_id.remove(&batch_id) {
            for key in batch_keys {
                self.overlays.remove(&key);
            }
        }
        for key in keys {
            if self
                .overlays
                .get(key)
                .is_some_and(|overlay| overlay.largest_batch_id == batch_id)
            {
                self.overlays.remove(key);
            }
        }
    }

    fn get_overlays_for_collection(&self, collection: &ResourcePath, since_batch_id: BatchId) -> OverlayMap {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path())
                    && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
    ) -> OverlayMap {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                key.has_collection_id(collection_group) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }
}
