mod database;
mod listener;
mod operations;
mod query;
mod reference;
mod snapshot;
mod user_data;

pub use database::Firestore;
pub use listener::{ListenerRegistration, SnapshotListenOptions};
pub use query::{DocumentChange, DocumentChangeType, Query, QuerySnapshot};
pub use reference::{CollectionReference, DocumentReference};
pub use snapshot::{DocumentSnapshot, ServerTimestampBehavior, SnapshotMetadata};
pub use user_data::SetOptions;
