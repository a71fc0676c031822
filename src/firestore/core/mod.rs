mod event_manager;
mod filter;
mod firestore_client;
mod online_state;
mod order_by;
mod query;
mod sync_engine;
mod target;
mod user;
mod view;
mod view_snapshot;

pub use event_manager::{
    EventManager, ListenCallbacks, ListenOptions, ListenSource, QueryListener, ViewSnapshotObserver,
};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, FilterOperator};
pub use firestore_client::{ClientCore, FirestoreClient, Source, WriteAcknowledgement};
pub use online_state::OnlineState;
pub use order_by::{Bound, Direction, OrderBy};
pub use query::{LimitType, Query};
pub use sync_engine::{QueryView, SyncEngine, SyncEngineEvent, WriteCallback};
pub use target::{ListenSequenceNumber, Target, TargetId, TargetIdGenerator};
pub use user::User;
pub use view::{LimboDocumentChange, SyncState, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
