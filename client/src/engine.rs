//! The engine facade.
//!
//! [`SyncEngine`] is a cheap handle over shared state. Writes are
//! synchronous: they validate, update the cache, append to the queue and
//! persist before returning. Everything that touches the network is async.

use crate::{
    clock::{Clock, SystemClock},
    config::SyncConfig,
    error::Result,
    network::NetworkMonitor,
    path,
    persist::PersistedState,
    query::{matches_all, Filter},
    remote::{Document, RemoteStore},
    retry::RetryEntry,
    scheduler::{PeriodicTask, TaskHandle},
    schema::Schema,
    state::{Action, Outcome, SyncState, SyncStatus},
    storage::LocalStorage,
    subscription::SubscriptionRegistry,
    ActorId, DocPath, Error, OfflineOperation, OperationId, OperationKind, Timestamp,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

pub(crate) struct Inner {
    pub(crate) config: SyncConfig,
    pub(crate) remote: Arc<dyn RemoteStore>,
    storage: Arc<dyn LocalStorage>,
    clock: Arc<dyn Clock>,
    schema: Option<Schema>,
    network: NetworkMonitor,
    state: Mutex<SyncState>,
    status_tx: watch::Sender<SyncStatus>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) replay_lock: tokio::sync::Mutex<()>,
    next_token: AtomicU64,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builds a [`SyncEngine`].
pub struct SyncEngineBuilder {
    remote: Arc<dyn RemoteStore>,
    storage: Arc<dyn LocalStorage>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    schema: Option<Schema>,
    network: Option<NetworkMonitor>,
}

impl SyncEngineBuilder {
    pub fn new(remote: Arc<dyn RemoteStore>, storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            remote,
            storage,
            clock: Arc::new(SystemClock),
            config: SyncConfig::default(),
            schema: None,
            network: None,
        }
    }

    /// Use a different clock (tests use [`ManualClock`](crate::ManualClock)).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate writes against a schema.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Share a network monitor with the host. Defaults to a new, online one.
    pub fn network(mut self, network: NetworkMonitor) -> Self {
        self.network = Some(network);
        self
    }

    /// Load persisted state and create the engine.
    ///
    /// No background work starts until [`SyncEngine::start`].
    pub fn build(self) -> Result<SyncEngine> {
        let mut state = match self.storage.read(&self.config.storage_key)? {
            Some(bytes) => SyncState::restore(PersistedState::from_slice(&bytes)?),
            None => SyncState::default(),
        };

        let network = self.network.unwrap_or_default();
        let now = self.clock.now();
        state.reduce(Action::SetOnline(network.is_online()), now, &self.config);
        state.reduce(Action::SetActor(self.config.actor_id.clone()), now, &self.config);

        tracing::info!(
            queued = state.queue().len(),
            failed = state.queue().list_permanently_failed().len(),
            cached = state.cache().len(),
            conflicts = state.conflicts().pending_count(),
            online = network.is_online(),
            "sync engine loaded"
        );

        let (status_tx, _) = watch::channel(state.status());
        Ok(SyncEngine {
            inner: Arc::new(Inner {
                config: self.config,
                remote: self.remote,
                storage: self.storage,
                clock: self.clock,
                schema: self.schema,
                network,
                state: Mutex::new(state),
                status_tx,
                subscriptions: SubscriptionRegistry::default(),
                replay_lock: tokio::sync::Mutex::new(()),
                next_token: AtomicU64::new(1),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// Offline-first sync engine.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder(
        remote: Arc<dyn RemoteStore>,
        storage: Arc<dyn LocalStorage>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder::new(remote, storage)
    }

    pub(crate) fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the replay timer, the optimistic sweep and the network watcher.
    ///
    /// Calling it again while running does nothing.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let weak = self.downgrade();
        tasks.push(PeriodicTask::spawn(
            "replay",
            self.inner.config.replay_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(engine) = SyncEngine::from_weak(&weak) {
                        engine.replay().await;
                    }
                }
            },
        ));

        let weak = self.downgrade();
        tasks.push(PeriodicTask::spawn(
            "optimistic-sweep",
            self.inner.config.sweep_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(engine) = SyncEngine::from_weak(&weak) {
                        engine.sweep_optimistic();
                    }
                }
            },
        ));

        tasks.push(TaskHandle::spawn(
            "network-watch",
            watch_network(self.downgrade(), self.inner.network.subscribe()),
        ));
        tracing::info!("sync engine started");
    }

    /// Stop background work and close every subscription.
    pub fn shutdown(&self) {
        let tasks: Vec<TaskHandle> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.cancel();
        }
        self.unsubscribe_all();
        tracing::info!("sync engine stopped");
    }

    /// Drop all local state: queue, cache, conflicts, retries, subscriptions.
    /// The acting identity goes back to the configured one.
    ///
    /// Waits for an in-flight replay pass to finish first.
    pub async fn clear_all(&self) -> Result<()> {
        let _pass = self.inner.replay_lock.lock().await;
        self.unsubscribe_all();
        self.dispatch(Action::Reset);
        self.inner.storage.remove(&self.inner.config.storage_key)?;
        tracing::info!("local sync state cleared");
        Ok(())
    }

    // ========================================================================
    // Network
    // ========================================================================

    /// The monitor the engine watches.
    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    /// Whether the engine considers itself online.
    pub fn is_online(&self) -> bool {
        self.with_state(SyncState::is_online)
    }

    /// Report a connectivity change and handle the transition before
    /// returning: on going online, detached subscriptions are reopened and
    /// the queue is replayed.
    pub async fn set_online(&self, online: bool) {
        self.inner.network.set_online(online);
        self.handle_network_change(online).await;
    }

    pub(crate) async fn handle_network_change(&self, online: bool) {
        if !matches!(self.dispatch(Action::SetOnline(online)), Outcome::Changed(true)) {
            return;
        }
        if online {
            tracing::info!(queued = self.status().queued_count, "network online");
            self.reattach_subscriptions().await;
            self.replay().await;
        } else {
            tracing::info!(queued = self.status().queued_count, "network offline; writes will queue");
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Set the identity stamped on writes that do not name one.
    pub fn set_actor(&self, actor_id: Option<&str>) {
        self.dispatch(Action::SetActor(actor_id.map(str::to_string)));
    }

    pub fn actor_id(&self) -> Option<ActorId> {
        self.with_state(|s| s.actor_id().map(str::to_string))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read a document, cache first.
    ///
    /// A fresh cached value is returned as is, with a background refresh when
    /// online. Without one the remote store is asked directly; if that fails
    /// the (possibly stale) cached value is returned.
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        path::validate_document_path(path)?;

        let fresh = self.with_state(|s| s.cache().get(path).is_some_and(|e| !e.stale));
        if !self.is_online() {
            return Ok(self.cached(path));
        }

        if fresh {
            let engine = self.clone();
            let owned = path.to_string();
            tokio::spawn(async move { engine.refresh(&owned).await });
            return Ok(self.cached(path));
        }

        self.refresh(path).await;
        Ok(self.cached(path))
    }

    async fn refresh(&self, path: &str) {
        match self.inner.remote.get(path).await {
            Ok(data) => {
                self.dispatch(Action::DocumentsRefreshed {
                    documents: vec![(path.to_string(), data)],
                });
            }
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "refresh failed; serving cached value");
                self.dispatch(Action::RefreshFailed {
                    path: path.to_string(),
                });
            }
        }
    }

    /// Documents of a collection matching every filter.
    ///
    /// When online the remote result refreshes the cache first; the answer is
    /// always computed from the cache, so local writes not yet replayed are
    /// included.
    pub async fn list(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>> {
        path::validate_collection_path(collection)?;

        if self.is_online() {
            match self.inner.remote.list(collection, filters).await {
                Ok(documents) => {
                    self.dispatch(Action::DocumentsRefreshed {
                        documents: documents
                            .into_iter()
                            .map(|d| (d.path, Some(d.data)))
                            .collect(),
                    });
                }
                Err(err) => {
                    tracing::warn!(collection = %collection, error = %err, "list failed; serving cache");
                }
            }
        }

        Ok(self.with_state(|s| {
            s.cache()
                .children(collection)
                .filter(|e| !e.data.is_null() && matches_all(filters, &e.data))
                .map(|e| Document {
                    path: e.path.clone(),
                    data: e.data.clone(),
                })
                .collect()
        }))
    }

    /// Cached value of `key`, without touching the network.
    pub fn cached(&self, key: &str) -> Option<Value> {
        self.with_state(|s| s.cached_value(key))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create a document. Returns its path.
    ///
    /// A collection path gets a generated id; a document path is used as
    /// given. Either way the id is fixed before the write is queued, so a
    /// replay can never create a duplicate.
    pub fn create(&self, path: &str, data: Value, actor_id: Option<&str>) -> Result<DocPath> {
        let path = if path::is_document_path(path) {
            path.to_string()
        } else {
            path::validate_collection_path(path)?;
            path::join(path, &uuid::Uuid::new_v4().to_string())
        };
        self.write(OperationKind::Create, path.clone(), Some(data), actor_id)?;
        Ok(path)
    }

    /// Merge fields into a document.
    pub fn update(&self, path: &str, data: Value, actor_id: Option<&str>) -> Result<OperationId> {
        path::validate_document_path(path)?;
        self.write(OperationKind::Update, path.to_string(), Some(data), actor_id)
    }

    /// Delete a document.
    pub fn delete(&self, path: &str, actor_id: Option<&str>) -> Result<OperationId> {
        path::validate_document_path(path)?;
        self.write(OperationKind::Delete, path.to_string(), None, actor_id)
    }

    fn write(
        &self,
        kind: OperationKind,
        path: DocPath,
        data: Option<Value>,
        actor_id: Option<&str>,
    ) -> Result<OperationId> {
        if let Some(data) = &data {
            let fields = data
                .as_object()
                .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;
            if kind == OperationKind::Update && fields.is_empty() {
                return Err(Error::InvalidPayload("update has no fields".into()));
            }
        }
        if let Some(schema) = &self.inner.schema {
            schema.validate_write(
                kind,
                path::collection_name(&path),
                data.as_ref().and_then(Value::as_object),
            )?;
        }

        let actor_id = actor_id.map(str::to_string).or_else(|| self.actor_id());
        Ok(self.enqueue_write(kind, path, data, actor_id))
    }

    /// Queue an already validated write and kick off a replay.
    pub(crate) fn enqueue_write(
        &self,
        kind: OperationKind,
        path: DocPath,
        data: Option<Value>,
        actor_id: Option<ActorId>,
    ) -> OperationId {
        let op = OfflineOperation::new(
            kind,
            path,
            data,
            actor_id,
            self.now(),
            self.inner.config.retry.max_attempts,
        );
        let id = op.id.clone();
        tracing::debug!(op_id = %id, kind = %op.kind, path = %op.path, "write queued");
        self.dispatch(Action::Enqueue(op));
        self.schedule_replay();
        id
    }

    fn schedule_replay(&self) {
        if !self.inner.config.replay_on_write || !self.is_online() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let engine = self.clone();
            handle.spawn(async move {
                engine.replay().await;
            });
        }
    }

    // ========================================================================
    // Queue inspection
    // ========================================================================

    /// Writes waiting for the remote store, oldest first.
    pub fn pending_operations(&self) -> Vec<OfflineOperation> {
        self.with_state(|s| s.queue().list_pending().to_vec())
    }

    /// Writes that exhausted their attempts.
    pub fn failed_operations(&self) -> Vec<OfflineOperation> {
        self.with_state(|s| s.queue().list_permanently_failed().to_vec())
    }

    /// Permanently failed writes as errors.
    pub fn permanent_failures(&self) -> Vec<Error> {
        self.with_state(|s| {
            s.queue()
                .list_permanently_failed()
                .iter()
                .map(OfflineOperation::permanent_failure)
                .collect()
        })
    }

    /// Give a permanently failed write a fresh set of attempts.
    pub fn requeue_failed(&self, id: &str) -> Result<()> {
        match self.dispatch(Action::RequeueFailed { id: id.to_string() }) {
            Outcome::Changed(true) => {
                tracing::info!(op_id = %id, "failed operation requeued");
                self.schedule_replay();
                Ok(())
            }
            _ => Err(Error::OperationNotFound(id.to_string())),
        }
    }

    /// Drop a permanently failed write.
    pub fn discard_failed(&self, id: &str) -> Result<()> {
        match self.dispatch(Action::DiscardFailed { id: id.to_string() }) {
            Outcome::Changed(true) => {
                tracing::info!(op_id = %id, "failed operation discarded");
                Ok(())
            }
            _ => Err(Error::OperationNotFound(id.to_string())),
        }
    }

    /// Retry entries for lost subscriptions and failed optimistic calls,
    /// waiting ones first, then exhausted ones.
    pub fn retries(&self) -> Vec<RetryEntry> {
        self.with_state(|s| {
            s.retries()
                .active()
                .iter()
                .chain(s.retries().exhausted())
                .cloned()
                .collect()
        })
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Current counters.
    pub fn status(&self) -> SyncStatus {
        self.with_state(SyncState::status)
    }

    /// Receive the counters every time they change.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Read the shared state under its lock.
    ///
    /// `f` must not call back into the engine.
    pub fn with_state<R>(&self, f: impl FnOnce(&SyncState) -> R) -> R {
        f(&self.inner.state.lock())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    pub(crate) fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.inner.next_token.fetch_add(1, Ordering::SeqCst)
    }

    /// Apply an action, persist if it is durable, and publish the status.
    pub(crate) fn dispatch(&self, action: Action) -> Outcome {
        let now = self.now();
        let durable = action.is_durable();

        let mut state = self.inner.state.lock();
        let outcome = state.reduce(action, now, &self.inner.config);
        if durable {
            if let Err(err) = self.persist(&state, now) {
                tracing::warn!(error = %err, "failed to persist sync state");
            }
        }
        let status = state.status();
        drop(state);

        self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        outcome
    }

    fn persist(&self, state: &SyncState, now: Timestamp) -> Result<()> {
        let json = state.to_persisted(now).to_json()?;
        self.inner
            .storage
            .write(&self.inner.config.storage_key, json.as_bytes())
    }
}

async fn watch_network(weak: Weak<Inner>, mut rx: watch::Receiver<bool>) {
    while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        let Some(engine) = SyncEngine::from_weak(&weak) else {
            break;
        };
        engine.handle_network_change(online).await;
    }
}
