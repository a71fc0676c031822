//! Client-side Firestore: a local cache with latency-compensated writes kept
//! in sync with the backend over the watch and write streams.

pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{
    CollectionReference, DocumentChange, DocumentChangeType, DocumentReference, DocumentSnapshot, Firestore,
    ListenerRegistration, Query, QuerySnapshot, ServerTimestampBehavior, SetOptions, SnapshotListenOptions,
    SnapshotMetadata,
};
pub use self::core::{Direction, FilterOperator, ListenSource, Source, User, WriteAcknowledgement};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use model::DatabaseId;
pub use remote::{Connection, CredentialsProvider, EmptyCredentialsProvider, InMemoryConnection, StreamTokens};
pub use settings::FirestoreSettings;
pub use value::FirestoreValue;
