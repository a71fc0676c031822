use std::collections::BTreeSet;

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::MutationQueue;
use crate::firestore::local::ReferenceSet;
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::value::BytesValue;

#[derive(Debug)]
pub struct MemoryMutationQueue {
    /// Ordered by batch id; acknowledged batches are removed from the front.
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: BytesValue,
    batches_by_document_key: ReferenceSet,
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            last_stream_token: BytesValue::default(),
            batches_by_document_key: ReferenceSet::new(),
        }
    }

    fn index_of_batch_id(&self, batch_id: BatchId) -> Result<usize, usize> {
        self.queue
            .binary_search_by(|batch| batch.batch_id.cmp(&batch_id))
    }

    fn batches_for_ids(&self, ids: impl IntoIterator<Item = BatchId>) -> Vec<MutationBatch> {
        ids.into_iter()
            .filter_map(|id| self.lookup_mutation_batch(id))
            .collect()
    }
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: BytesValue) -> FirestoreResult<()> {
        match self.index_of_batch_id(batch.batch_id) {
            Ok(0) => {
                self.last_stream_token = stream_token;
                Ok(())
            }
            _ => Err(internal_error(format!(
                "Can only acknowledge the first batch in the mutation queue, got {}",
                batch.batch_id
            ))),
        }
    }

    fn get_last_stream_token(&self) -> BytesValue {
        self.last_stream_token.clone()
    }

    fn set_last_stream_token(&mut self, stream_token: BytesValue) {
        self.last_stream_token = stream_token;
    }

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(internal_error("Mutation batches should not be empty"));
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        if let Some(previous) = self.queue.last() {
            if previous.batch_id >= batch_id {
                return Err(internal_error("Mutation batch ids must be monotonically increasing"));
            }
        }

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        self.batches_by_document_key
            .add_references(batch.mutations.iter().map(Mutation::key), batch_id);
        self.queue.push(batch.clone());
        Ok(batch)
    }

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.index_of_batch_id(batch_id)
            .ok()
            .map(|index| self.queue[index].clone())
    }

    fn get_next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        let index = self.queue.partition_point(|batch| batch.batch_id <= batch_id);
        self.queue.get(index).cloned()
    }

    fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.queue
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    fn get_all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.queue.clone()
    }

    fn get_all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.batches_for_ids(self.batches_by_document_key.ids_for_key(key))
    }

    fn get_all_mutation_batches_affecting_document_keys(&self, keys: &DocumentKeySet) -> Vec<MutationBatch> {
        let ids: BTreeSet<BatchId> = keys
            .iter()
            .flat_map(|key| self.batches_by_document_key.ids_for_key(key))
            .collect();
        self.batches_for_ids(ids)
    }

    fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let affects = |key: &DocumentKey| match &query.collection_group {
            Some(group) => key.has_collection_id(group) && query.path.is_prefix_of(key.path()),
            None if DocumentKey::is_document_key(&query.path) => key.path() == &query.path,
            None => query.path.is_immediate_parent_of(key.path()),
        };
        self.queue
            .iter()
            .filter(|batch| batch.mutations.iter().any(|mutation| affects(mutation.key())))
            .cloned()
            .collect()
    }

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        if self.index_of_batch_id(batch.batch_id) != Ok(0) {
            return Err(internal_error(
                "Can only remove the first entry of the mutation queue",
            ));
        }
        self.queue.remove(0);
        for mutation in &batch.mutations {
            self.batches_by_document_key
                .remove_reference(mutation.key(), batch.batch_id);
        }
        Ok(())
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_document_key.contains_key(key)
    }

    fn perform_consistency_check(&self) -> FirestoreResult<()> {
        if self.queue.is_empty() && !self.batches_by_document_key.is_empty() {
            return Err(internal_error(
                "Document leak -- detected dangling mutation references when queue is empty.",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::ResourcePath;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add(queue: &mut MemoryMutationQueue, path: &str) -> MutationBatch {
        queue
            .add_mutation_batch(Timestamp::new(1, 0), Vec::new(), vec![Mutation::delete(key(path))])
            .unwrap()
    }

    #[test]
    fn batch_ids_increase_and_lookup_works() {
        let mut queue = MemoryMutationQueue::new();
        let first = add(&mut queue, "rooms/a");
        let second = add(&mut queue, "rooms/b");
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), 2);
        assert_eq!(queue.lookup_mutation_batch(2), Some(second.clone()));
        assert_eq!(
            queue.get_next_mutation_batch_after_batch_id(BATCH_ID_UNKNOWN),
            Some(first.clone())
        );
        assert_eq!(queue.get_next_mutation_batch_after_batch_id(1), Some(second));
        assert_eq!(queue.get_next_mutation_batch_after_batch_id(2), None);
    }

    #[test]
    fn only_the_front_batch_can_be_removed() {
        let mut queue = MemoryMutationQueue::new();
        let first = add(&mut queue, "rooms/a");
        let second = add(&mut queue, "rooms/b");
        assert!(queue.remove_mutation_batch(&second).is_err());
        assert!(queue.acknowledge_batch(&second, BytesValue::default()).is_err());

        queue
            .acknowledge_batch(&first, BytesValue::new(vec![1]))
            .unwrap();
        assert_eq!(queue.get_last_stream_token(), BytesValue::new(vec![1]));
        queue.remove_mutation_batch(&first).unwrap();
        assert!(!queue.contains_key(&key("rooms/a")));
        assert!(queue.contains_key(&key("rooms/b")));
        queue.remove_mutation_batch(&second).unwrap();
        assert!(queue.is_empty());
        queue.perform_consistency_check().unwrap();
    }

    #[test]
    fn finds_batches_by_key_and_query() {
        let mut queue = MemoryMutationQueue::new();
        add(&mut queue, "rooms/a");
        add(&mut queue, "rooms/a/messages/1");
        add(&mut queue, "rooms/b");

        let by_key = queue.get_all_mutation_batches_affecting_document_key(&key("rooms/a"));
        assert_eq!(by_key.len(), 1);

        let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        let ids: Vec<BatchId> = queue
            .get_all_mutation_batches_affecting_document_keys(&keys)
            .iter()
            .map(|batch| batch.batch_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);

        let rooms = Query::new(ResourcePath::from_string("rooms").unwrap());
        assert_eq!(queue.get_all_mutation_batches_affecting_query(&rooms).len(), 2);
        let messages = Query::collection_group("messages");
        assert_eq!(queue.get_all_mutation_batches_affecting_query(&messages).len(), 1);
    }
}
