mod local_documents_view;
mod local_store;
mod local_view_changes;
mod lru_garbage_collector;
mod memory_document_overlay_cache;
mod memory_mutation_queue;
mod memory_remote_document_cache;
mod memory_target_cache;
mod persistence;
mod query_engine;
mod reference_delegate;
mod reference_set;
mod target_data;

pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalWriteResult, QueryResult, UserChangeResult};
pub use local_view_changes::LocalViewChanges;
pub use lru_garbage_collector::{LruDelegate, LruGarbageCollector, LruResults, INVALID_SEQUENCE_NUMBER};
pub use memory_document_overlay_cache::MemoryDocumentOverlayCache;
pub use memory_mutation_queue::MemoryMutationQueue;
pub use memory_remote_document_cache::MemoryRemoteDocumentCache;
pub use memory_target_cache::MemoryTargetCache;
pub use persistence::{
    DocumentOverlayCache, IndexOffset, MemoryPersistence, MutationQueue, PersistenceCaches,
    PersistenceTransaction, RemoteDocumentCache, TargetCache,
};
pub use query_engine::QueryEngine;
pub use reference_delegate::{MemoryEagerDelegate, MemoryLruDelegate, ReferenceDelegate};
pub use reference_set::ReferenceSet;
pub use target_data::{TargetData, TargetPurpose};
