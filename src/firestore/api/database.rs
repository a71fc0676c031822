use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::{FirestoreClient, Query as CoreQuery, User};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DatabaseId, ResourcePath};
use crate::firestore::remote::{ConnectionArc, CredentialsProviderArc};
use crate::firestore::settings::FirestoreSettings;

use super::query::Query;
use super::reference::{CollectionReference, DocumentReference};

const LOG_TARGET: &str = "firestore::api";

/// Handle to one database. Cheap to clone; clones share the same client.
#[derive(Clone)]
pub struct Firestore {
    inner: Arc<FirestoreInner>,
}

struct FirestoreInner {
    database_id: DatabaseId,
    settings: FirestoreSettings,
    client: FirestoreClient,
}

impl Firestore {
    /// Starts a client for `database_id` that reaches the backend through
    /// `connection`.
    pub fn new(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
    ) -> Self {
        Self::start(database_id, settings, connection, credentials, None)
    }

    /// Like [`Firestore::new`], also presenting App Check tokens from
    /// `app_check` whenever a stream opens.
    pub fn new_with_app_check(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        app_check: CredentialsProviderArc,
    ) -> Self {
        Self::start(database_id, settings, connection, credentials, Some(app_check))
    }

    fn start(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        app_check: Option<CredentialsProviderArc>,
    ) -> Self {
        log::debug!(
            target: LOG_TARGET,
            "starting client for {} (host {})",
            database_id.database_name(),
            settings.host
        );
        let client = FirestoreClient::new(database_id.clone(), settings.clone(), connection, credentials, app_check);
        let inner = FirestoreInner {
            database_id,
            settings,
            client,
        };
        Self { inner: Arc::new(inner) }
    }

    /// The fully qualified database identifier (project + database name).
    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn project_id(&self) -> &str {
        self.inner.database_id.project_id()
    }

    /// Returns the logical database name (usually `"(default)"`).
    pub fn database(&self) -> &str {
        self.inner.database_id.database()
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    pub(crate) fn client(&self) -> &FirestoreClient {
        &self.inner.client
    }

    /// Creates a `CollectionReference` pointing at `path`.
    ///
    /// The path is interpreted relative to the database root using forward
    /// slashes to separate segments (e.g. `"users/alovelace/repos"`).
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let resource = ResourcePath::from_string(path)?;
        CollectionReference::new(self.clone(), resource)
    }

    /// Creates a `DocumentReference` pointing at `path`.
    ///
    /// The path must contain an even number of segments (collection/doc pairs).
    pub fn doc(&self, path: &str) -> FirestoreResult<DocumentReference> {
        let resource = ResourcePath::from_string(path)?;
        DocumentReference::new(self.clone(), resource)
    }

    /// Creates a query over every collection named `collection_id`,
    /// regardless of its parent path.
    pub fn collection_group(&self, collection_id: &str) -> FirestoreResult<Query> {
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(format!(
                "Invalid collection ID '{collection_id}' passed to collection_group(). \
                 Collection IDs must not contain '/'."
            )));
        }
        Ok(Query::new(self.clone(), CoreQuery::collection_group(collection_id)))
    }

    /// Re-enables network usage after [`Firestore::disable_network`].
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.client.enable_network().await
    }

    /// Stops all network traffic. Listeners keep receiving cached results and
    /// writes stay queued until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.client.disable_network().await
    }

    /// Switches the client to `user`, swapping the visible mutation queue and
    /// restarting the streams with the new credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.client.handle_credential_change(user).await
    }

    /// Resolves once every write issued so far has been acknowledged by the
    /// backend. Writes issued afterwards are not waited for.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.inner.client.wait_for_pending_writes().await
    }

    /// Shuts the client down. Every later call fails with `cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        log::debug!(target: LOG_TARGET, "terminating {}", self.inner.database_id.database_name());
        self.inner.client.terminate().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.client.is_terminated()
    }
}

impl Debug for Firestore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firestore")
            .field("database_id", &self.inner.database_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::test_support::test_firestore;

    #[tokio::test]
    async fn app_check_tokens_reach_the_connection() {
        use crate::firestore::api::SnapshotListenOptions;
        use crate::firestore::remote::{CredentialsProvider, EmptyCredentialsProvider, InMemoryConnection, StreamKind};

        struct StaticAppCheck;

        #[async_trait::async_trait]
        impl CredentialsProvider for StaticAppCheck {
            async fn get_token(&self) -> FirestoreResult<Option<String>> {
                Ok(Some("app-check".into()))
            }

            fn invalidate_token(&self) {}
        }

        let connection = InMemoryConnection::new();
        let firestore = Firestore::new_with_app_check(
            DatabaseId::new("p", "(default)"),
            FirestoreSettings::default(),
            connection.clone(),
            Arc::new(EmptyCredentialsProvider),
            Arc::new(StaticAppCheck),
        );
        let rooms = firestore.collection("rooms").unwrap();
        let _registration = firestore
            .on_snapshot(&rooms.query(), SnapshotListenOptions::default(), |_| {})
            .await
            .unwrap();

        let _server = connection.accept(StreamKind::Listen).await.unwrap();
        let tokens = connection.tokens().await;
        assert_eq!(tokens[0].auth_token, None);
        assert_eq!(tokens[0].app_check_token.as_deref(), Some("app-check"));
    }

    #[tokio::test]
    async fn exposes_database_identity() {
        let (firestore, _connection) = test_firestore();
        assert_eq!(firestore.project_id(), "p");
        assert_eq!(firestore.database(), "(default)");
        assert_eq!(firestore.settings().max_pending_writes, 10);
    }

    #[tokio::test]
    async fn collection_group_rejects_paths() {
        let (firestore, _connection) = test_firestore();
        assert!(firestore.collection_group("landmarks").is_ok());
        let err = firestore.collection_group("cities/sf/landmarks").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (firestore, _connection) = test_firestore();
        firestore.terminate().await.unwrap();
        firestore.terminate().await.unwrap();
        assert!(firestore.is_terminated());
        let err = firestore.disable_network().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }
}
