use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::core::User;
use crate::firestore::error::FirestoreResult;

/// The two long-lived RPCs the remote store keeps open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Listen => write!(f, "listen"),
            StreamKind::Write => write!(f, "write"),
        }
    }
}

/// One open bidirectional stream carrying JSON-encoded protocol messages.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamHandle: Send + Sync + 'static {
    /// Queues a request. Fails once the stream is closed.
    fn send(&self, message: JsonValue) -> FirestoreResult<()>;

    /// Next server message; `None` once the server ended the stream.
    async fn next(&self) -> Option<FirestoreResult<JsonValue>>;

    fn close(&self);
}

/// Tokens presented when opening a stream. Either may be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamTokens {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

/// Transport able to open listen and write streams against the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(&self, kind: StreamKind, tokens: StreamTokens) -> FirestoreResult<Arc<dyn StreamHandle>>;
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Forces the next [`CredentialsProvider::get_token`] to fetch a fresh
    /// token.
    fn invalidate_token(&self);

    fn current_user(&self) -> User {
        User::unauthenticated()
    }
}

#[derive(Default, Clone, Debug)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type ConnectionArc = Arc<dyn Connection>;
pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;
