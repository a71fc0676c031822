use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;

use crate::firestore::core::{
    EventManager, ListenCallbacks, ListenOptions, Query, QueryListener, SyncEngine, SyncEngineEvent, User, View,
    ViewSnapshot, ViewSnapshotObserver,
};
use crate::firestore::error::{cancelled, unavailable, FirestoreResult};
use crate::firestore::local::LocalStore;
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::{
    ConnectionArc, CredentialsProviderArc, RemoteEventSink, RemoteStore, RemoteStoreEvent,
};
use crate::firestore::settings::FirestoreSettings;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TARGET: &str = "firestore::client";

/// Where a one-shot read may take its data from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Source {
    /// The backend when reachable, the cache otherwise.
    #[default]
    Default,
    /// Fail with `unavailable` rather than return cached data.
    Server,
    Cache,
}

/// Everything owned by the client's queue.
pub struct ClientCore {
    sync_engine: SyncEngine,
    remote_store: RemoteStore,
    event_manager: EventManager,
    queue: AsyncQueue<ClientCore>,
    gc_task: Option<DelayedOperation>,
    settings: FirestoreSettings,
}

/// Hands the event manager's listen hooks to the sync engine.
struct ListenHandler<'a> {
    sync_engine: &'a mut SyncEngine,
    remote_store: &'a mut RemoteStore,
}

impl ListenCallbacks for ListenHandler<'_> {
    fn on_listen(&mut self, query: &Query, enable_remote_listen: bool) -> FirestoreResult<Option<ViewSnapshot>> {
        self.sync_engine
            .listen(self.remote_store, query.clone(), enable_remote_listen)
            .map(Some)
    }

    fn on_unlisten(&mut self, query: &Query, disable_remote_listen: bool) -> FirestoreResult<()> {
        self.sync_engine
            .unlisten(self.remote_store, query, disable_remote_listen)
    }

    fn on_first_remote_store_listen(&mut self, query: &Query) -> FirestoreResult<()> {
        self.sync_engine
            .listen_to_remote_store(self.remote_store, query)
    }

    fn on_last_remote_store_unlisten(&mut self, query: &Query) -> FirestoreResult<()> {
        self.sync_engine
            .unlisten_from_remote_store(self.remote_store, query);
        Ok(())
    }
}

impl ClientCore {
    fn new(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        app_check: Option<CredentialsProviderArc>,
        queue: &AsyncQueue<ClientCore>,
    ) -> Self {
        let mut remote_store = RemoteStore::new(
            database_id,
            connection,
            credentials,
            Arc::new(queue.clone()),
            &settings,
        );
        if let Some(provider) = app_check {
            remote_store.set_app_check_provider(provider);
        }
        Self {
            sync_engine: SyncEngine::new(LocalStore::new(&settings), &settings),
            remote_store,
            event_manager: EventManager::new(),
            queue: queue.clone(),
            gc_task: None,
            settings,
        }
    }

    fn initialize(&mut self, user: User) {
        let result = if &user == self.sync_engine.current_user() {
            self.remote_store.start(&mut self.sync_engine)
        } else {
            self.remote_store
                .handle_credential_change(user, &mut self.sync_engine)
        };
        if let Err(err) = result {
            log::error!(target: LOG_TARGET, "failed to start the remote store: {err}");
        }
        self.schedule_garbage_collection(true);
        self.dispatch_sync_events();
    }

    fn listen_handler(&mut self) -> (ListenHandler<'_>, &mut EventManager) {
        (
            ListenHandler {
                sync_engine: &mut self.sync_engine,
                remote_store: &mut self.remote_store,
            },
            &mut self.event_manager,
        )
    }

    fn listen(&mut self, listener: QueryListener) {
        let (mut handler, event_manager) = self.listen_handler();
        event_manager.listen(listener, &mut handler);
        self.dispatch_sync_events();
    }

    fn unlisten(&mut self, query: &Query, listener_id: u64) {
        let (mut handler, event_manager) = self.listen_handler();
        if let Err(err) = event_manager.unlisten(query, listener_id, &mut handler) {
            log::warn!(target: LOG_TARGET, "failed to stop listening to '{}': {err}", query.canonical_id());
        }
        self.dispatch_sync_events();
    }

    fn write(&mut self, mutations: Vec<Mutation>, callback: oneshot::Sender<FirestoreResult<()>>) -> FirestoreResult<()> {
        let result = self
            .sync_engine
            .write(&mut self.remote_store, mutations, callback);
        self.dispatch_sync_events();
        result
    }

    fn read_document(&mut self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let document = self.sync_engine.local_store_mut().read_document(key)?;
        if document.is_found_document() || document.is_no_document() {
            return Ok(document);
        }
        Err(unavailable(
            "Failed to get document from cache. (However, this document may exist on the server. \
             Run again without setting 'source' in the GetOptions to attempt to retrieve the document \
             from the server.)",
        ))
    }

    fn execute_query_from_cache(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let result = self
            .sync_engine
            .local_store_mut()
            .execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let view_change = view.apply_changes(doc_changes, false, None, false);
        Ok(view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot()))
    }

    fn with_network<T>(&mut self, operation: impl FnOnce(&mut RemoteStore, &mut SyncEngine) -> T) -> T {
        let result = operation(&mut self.remote_store, &mut self.sync_engine);
        self.dispatch_sync_events();
        result
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.gc_task.take() {
            task.cancel();
        }
        self.remote_store.shutdown(&mut self.sync_engine);
        self.sync_engine.local_store_mut().shutdown();
        self.dispatch_sync_events();
    }

    /// Forwards buffered sync engine output to the listeners.
    fn dispatch_sync_events(&mut self) {
        for event in self.sync_engine.take_events() {
            match event {
                SyncEngineEvent::Snapshots(snapshots) => self.event_manager.on_watch_change(snapshots),
                SyncEngineEvent::QueryError(query, error) => self.event_manager.on_watch_error(&query, error),
                SyncEngineEvent::OnlineStateChanged(state) => self.event_manager.on_online_state_change(state),
            }
        }
    }

    fn schedule_garbage_collection(&mut self, initial: bool) {
        if self.sync_engine.local_store().garbage_collector().is_none() {
            return;
        }
        let delay = if initial {
            self.settings.lru.initial_collection_delay
        } else {
            self.settings.lru.regular_collection_delay
        };
        log::debug!(target: LOG_TARGET, "garbage collection scheduled in {delay:?}");
        let queue = self.queue.clone();
        self.gc_task = Some(self.queue.enqueue_after_delay(
            TimerId::LruGarbageCollection,
            delay,
            move |core: &mut ClientCore| {
                core.gc_task = None;
                queue.enqueue_retryable(|core: &mut ClientCore| {
                    let results = core.sync_engine.local_store_mut().collect_garbage()?;
                    log::debug!(
                        target: LOG_TARGET,
                        "garbage collection removed {} targets and {} documents",
                        results.targets_removed,
                        results.documents_removed
                    );
                    core.schedule_garbage_collection(false);
                    Ok(())
                });
            },
        ));
    }
}

impl RemoteEventSink for ClientCore {
    fn on_remote_store_event(&mut self, event: RemoteStoreEvent) {
        if let Err(err) = self
            .remote_store
            .handle_event(event, &mut self.sync_engine)
        {
            log::error!(target: LOG_TARGET, "remote event could not be applied: {err}");
            self.dispatch_sync_events();
            let (mut handler, event_manager) = self.listen_handler();
            event_manager.on_unrecoverable_error(err, &mut handler);
        }
        self.dispatch_sync_events();
    }
}

/// Settles once the backend accepted or rejected a write.
#[derive(Debug)]
pub struct WriteAcknowledgement(oneshot::Receiver<FirestoreResult<()>>);

impl WriteAcknowledgement {
    pub async fn wait(self) -> FirestoreResult<()> {
        self.0
            .await
            .unwrap_or_else(|_| Err(cancelled("The write was abandoned before the backend answered.")))
    }
}

/// Client handle. Cheap to clone; every call is run on the client's queue.
#[derive(Clone)]
pub struct FirestoreClient {
    queue: AsyncQueue<ClientCore>,
    next_listener_id: Arc<AtomicU64>,
}

impl FirestoreClient {
    pub fn new(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        app_check: Option<CredentialsProviderArc>,
    ) -> Self {
        let user = credentials.current_user();
        let queue = AsyncQueue::start_with(|queue| {
            ClientCore::new(database_id, settings, connection, credentials, app_check, queue)
        });
        queue.enqueue_and_forget(move |core| core.initialize(user));
        Self {
            queue,
            next_listener_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Registers `observer` for snapshots of `query` and returns the
    /// listener id to pass to [`FirestoreClient::unlisten`].
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: ViewSnapshotObserver,
    ) -> FirestoreResult<u64> {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.queue
            .enqueue(move |core| core.listen(QueryListener::new(id, query, options, observer)))
            .await?;
        Ok(id)
    }

    pub fn unlisten(&self, query: Query, listener_id: u64) {
        self.queue
            .enqueue_and_forget(move |core| core.unlisten(&query, listener_id));
    }

    /// Queues `mutations` as one batch. Resolves once the batch is applied
    /// locally; the returned handle settles with the backend's answer.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteAcknowledgement> {
        let (sender, receiver) = oneshot::channel();
        self.queue
            .enqueue(move |core| core.write(mutations, sender))
            .await??;
        Ok(WriteAcknowledgement(receiver))
    }

    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<MutableDocument> {
        self.queue
            .enqueue(move |core| core.read_document(&key))
            .await?
    }

    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.queue
            .enqueue(move |core| core.execute_query_from_cache(&query))
            .await?
    }

    /// Reads one document through a temporary listener.
    pub async fn get_document_via_snapshot_listener(
        &self,
        key: DocumentKey,
        source: Source,
    ) -> FirestoreResult<ViewSnapshot> {
        let query = Query::for_document(&key);
        self.read_via_snapshot_listener(query, move |snapshot| {
            let exists = snapshot.documents.get(&key).is_some();
            if !exists && snapshot.from_cache {
                return Err(unavailable("Failed to get document because the client is offline."));
            }
            if exists && snapshot.from_cache && source == Source::Server {
                return Err(unavailable(
                    "Failed to get document from server. (However, this document does exist in the \
                     local cache. Run again without setting source to \"server\" to retrieve the \
                     cached document.)",
                ));
            }
            Ok(())
        })
        .await
    }

    /// Runs `query` through a temporary listener.
    pub async fn execute_query_via_snapshot_listener(
        &self,
        query: Query,
        source: Source,
    ) -> FirestoreResult<ViewSnapshot> {
        self.read_via_snapshot_listener(query, move |snapshot| {
            if snapshot.from_cache && source == Source::Server {
                return Err(unavailable(
                    "Failed to get documents from server. (However, these documents may exist in the \
                     local cache. Run again without setting source to \"server\" to retrieve the \
                     cached documents.)",
                ));
            }
            Ok(())
        })
        .await
    }

    async fn read_via_snapshot_listener(
        &self,
        query: Query,
        accept: impl Fn(&ViewSnapshot) -> FirestoreResult<()> + Send + Sync + 'static,
    ) -> FirestoreResult<ViewSnapshot> {
        let (sender, receiver) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let observer: ViewSnapshotObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            let outcome = result.and_then(|snapshot| accept(&snapshot).map(|()| snapshot));
            let pending = sender.lock().ok().and_then(|mut sender| sender.take());
            if let Some(sender) = pending {
                let _ = sender.send(outcome);
            }
        });
        let options = ListenOptions {
            include_metadata_changes: true,
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let listener_id = self.listen(query.clone(), options, observer).await?;
        let result = receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("The client has already been terminated.")));
        self.unlisten(query, listener_id);
        result
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|core| core.with_network(|remote, engine| remote.enable_network(engine)))
            .await?
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|core| core.with_network(|remote, engine| remote.disable_network(engine)))
            .await
    }

    /// Tells the client the signed-in user changed.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |core| core.with_network(|remote, engine| remote.handle_credential_change(user, engine)))
            .await?
    }

    /// Resolves once every write queued so far has been answered.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.queue
            .enqueue(move |core| {
                core.sync_engine
                    .register_pending_writes_callback(&core.remote_store, sender)
            })
            .await??;
        receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("The client has already been terminated.")))
    }

    /// Shuts the client down. Later calls fail with `cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.queue.is_shutting_down() {
            return Ok(());
        }
        self.queue
            .enqueue_and_initiate_shutdown(|core| core.shutdown())
            .await
    }
}
