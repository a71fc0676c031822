pub mod bloom_filter;
pub mod connection;
pub mod in_memory_connection;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod scheduler;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::{BloomFilter, BloomFilterError};
pub use connection::{
    Connection, ConnectionArc, CredentialsProvider, CredentialsProviderArc, EmptyCredentialsProvider, StreamHandle,
    StreamKind, StreamTokens,
};
pub use in_memory_connection::{InMemoryConnection, ServerStream};
pub use online_state_tracker::{OnlineStateTracker, MAX_WATCH_STREAM_FAILURES};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{OfflineCause, RemoteStore};
pub use remote_syncer::RemoteSyncer;
pub use rpc_error::{
    is_permanent_error, is_permanent_write_error, is_primary_lease_lost, is_transaction_error,
    PRIMARY_LEASE_LOST_ERROR_MSG,
};
pub use scheduler::{RemoteEventSink, RemoteScheduler, RemoteSchedulerArc, RemoteStoreEvent, StreamEvent};
pub use serializer::{JsonProtoSerializer, WriteResponse};
pub use stream::{PersistentStream, PersistentStreamState, StreamNotification};
pub use streams::{WatchStream, WatchStreamEvent, WriteStream, WriteStreamEvent};
pub use watch_change::{
    DocumentWatchChange, ExistenceFilter, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
pub use watch_change_aggregator::{BloomFilterApplicationStatus, TargetMetadataProvider, WatchChangeAggregator};
