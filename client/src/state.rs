//! The shared sync state and its reducer.
//!
//! Every mutation the components make goes through [`SyncState::reduce`]
//! as a typed [`Action`], applied under one lock. Reads go through
//! [`SyncEngine::with_state`](crate::SyncEngine::with_state).

use crate::{
    cache::Cache,
    config::SyncConfig,
    conflict::{ConflictAction, ConflictLedger, Resolution},
    optimistic::{OptimisticTracker, OptimisticUpdate},
    persist::PersistedState,
    queue::{FailureOutcome, OfflineQueue},
    remote::{UPDATED_AT_FIELD, UPDATED_BY_FIELD},
    retry::{RetryRegistry, RetryTarget},
    ActorId, CacheKey, ConflictId, DocPath, Error, OfflineOperation, OperationId, OperationKind,
    RetryId, Timestamp,
};
use serde::Serialize;
use serde_json::{Map, Value};

/// Aggregate counters for the host UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<Timestamp>,
    pub queued_count: usize,
    pub cached_count: usize,
    /// Permanently failed writes plus exhausted retries
    pub failed_count: usize,
    /// Unresolved conflicts
    pub conflict_count: usize,
    pub has_conflicts: bool,
}

/// Server data as readers see it: the write stamps are bookkeeping.
fn without_metadata(mut data: Value, config: &SyncConfig) -> Value {
    if config.stamp_metadata {
        if let Some(fields) = data.as_object_mut() {
            fields.remove(UPDATED_AT_FIELD);
            fields.remove(UPDATED_BY_FIELD);
        }
    }
    data
}

/// Everything the engine tracks.
#[derive(Debug, Default)]
pub struct SyncState {
    online: bool,
    syncing: bool,
    last_sync_time: Option<Timestamp>,
    actor_id: Option<ActorId>,
    queue: OfflineQueue,
    cache: Cache,
    optimistic: OptimisticTracker,
    conflicts: ConflictLedger,
    retries: RetryRegistry,
}

/// A mutation of [`SyncState`].
#[derive(Debug)]
pub(crate) enum Action {
    SetOnline(bool),
    SetActor(Option<ActorId>),
    ReplayStarted,
    ReplayFinished {
        clean: bool,
    },
    Enqueue(OfflineOperation),
    OperationSucceeded {
        id: OperationId,
    },
    OperationFailed {
        id: OperationId,
        error: String,
        retryable: bool,
    },
    RequeueFailed {
        id: OperationId,
    },
    DiscardFailed {
        id: OperationId,
    },
    /// Server values fetched by `get`/`list`; `None` means the document is gone
    DocumentsRefreshed {
        documents: Vec<(DocPath, Option<Value>)>,
    },
    RefreshFailed {
        path: DocPath,
    },
    SnapshotReceived {
        key: CacheKey,
        path: DocPath,
        data: Value,
        authoritative: bool,
    },
    OptimisticBegun(OptimisticUpdate),
    OptimisticConfirmed {
        key: CacheKey,
        token: u64,
    },
    OptimisticReverted {
        key: CacheKey,
        token: Option<u64>,
    },
    OptimisticSwept,
    RetryRegistered {
        target: RetryTarget,
        error: String,
    },
    RetrySucceeded {
        id: RetryId,
    },
    RetryFailed {
        id: RetryId,
        error: String,
    },
    SubscriptionRetriesDropped {
        key: Option<CacheKey>,
    },
    ConflictResolved {
        id: ConflictId,
        action: ConflictAction,
    },
    Reset,
}

impl Action {
    /// Whether the action changes persisted state.
    pub(crate) fn is_durable(&self) -> bool {
        !matches!(
            self,
            Action::SetOnline(_)
                | Action::SetActor(_)
                | Action::ReplayStarted
                | Action::ReplayFinished { .. }
                | Action::OptimisticConfirmed { .. }
                | Action::RetryRegistered { .. }
                | Action::RetryFailed { .. }
                | Action::SubscriptionRetriesDropped { .. }
        )
    }
}

/// What an action did, for the caller that dispatched it.
#[derive(Debug)]
pub(crate) enum Outcome {
    None,
    Changed(bool),
    Failure(Option<FailureOutcome>),
    Delivered {
        view: Option<Value>,
        conflicts: Vec<ConflictId>,
    },
    Reverted(Option<OptimisticUpdate>),
    Swept {
        evicted: usize,
        expired: Vec<OptimisticUpdate>,
    },
    Retry {
        id: RetryId,
        exhausted: bool,
    },
    Resolved(Resolution),
    Rejected(Error),
}

impl SyncState {
    /// Restore from a persisted blob.
    pub(crate) fn restore(persisted: PersistedState) -> Self {
        Self {
            queue: persisted.queue,
            cache: persisted.cache,
            conflicts: ConflictLedger::from_parts(persisted.pending_changes, persisted.conflicts),
            ..Self::default()
        }
    }

    /// The durable part of the state.
    pub(crate) fn to_persisted(&self, now: Timestamp) -> PersistedState {
        PersistedState {
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            pending_changes: self.conflicts.pending_changes().clone(),
            conflicts: self.conflicts.records().to_vec(),
            ..PersistedState::new(now)
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn last_sync_time(&self) -> Option<Timestamp> {
        self.last_sync_time
    }

    /// Identity stamped on writes that do not name one.
    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn optimistic(&self) -> &OptimisticTracker {
        &self.optimistic
    }

    pub fn conflicts(&self) -> &ConflictLedger {
        &self.conflicts
    }

    pub fn retries(&self) -> &RetryRegistry {
        &self.retries
    }

    /// Current counters.
    pub fn status(&self) -> SyncStatus {
        let conflict_count = self.conflicts.pending_count();
        SyncStatus {
            is_online: self.online,
            is_syncing: self.syncing,
            last_sync_time: self.last_sync_time,
            queued_count: self.queue.len(),
            cached_count: self.cache.len(),
            failed_count: self.queue.list_permanently_failed().len()
                + self.retries.exhausted().len(),
            conflict_count,
            has_conflicts: conflict_count > 0,
        }
    }

    /// Current value of `key` as the application should see it.
    pub fn cached_value(&self, key: &str) -> Option<Value> {
        self.cache
            .get(key)
            .map(|e| e.data.clone())
            .filter(|v| !v.is_null())
    }

    /// Apply an action.
    pub(crate) fn reduce(&mut self, action: Action, now: Timestamp, config: &SyncConfig) -> Outcome {
        match action {
            Action::SetOnline(online) => {
                let changed = self.online != online;
                self.online = online;
                if !online {
                    self.syncing = false;
                }
                Outcome::Changed(changed)
            }
            Action::SetActor(actor_id) => {
                let changed = self.actor_id != actor_id;
                self.actor_id = actor_id;
                Outcome::Changed(changed)
            }
            Action::ReplayStarted => {
                self.syncing = true;
                Outcome::None
            }
            Action::ReplayFinished { clean } => {
                self.syncing = false;
                if clean {
                    self.last_sync_time = Some(now);
                }
                Outcome::None
            }
            Action::Enqueue(op) => {
                let before = self.cache.get(&op.path).map(|e| e.data.clone());
                match (op.kind, op.fields()) {
                    (OperationKind::Delete, _) => {
                        self.cache.remove(&op.path);
                    }
                    (OperationKind::Update, Some(fields)) => {
                        self.cache.merge_fields(&op.path, &op.path, fields, now);
                    }
                    (_, _) => {
                        let data = op.data.clone().unwrap_or(Value::Null);
                        self.cache.put(&op.path, &op.path, data, now);
                    }
                }
                self.conflicts.record_write(
                    op.kind,
                    &op.path,
                    op.fields(),
                    before.as_ref(),
                    op.actor_id.clone(),
                    now,
                );
                self.queue.enqueue(op);
                Outcome::None
            }
            Action::OperationSucceeded { id } => match self.queue.record_success(&id) {
                Some(op) => {
                    self.settle_pending(&op.path);
                    Outcome::Changed(true)
                }
                None => Outcome::Changed(false),
            },
            Action::OperationFailed {
                id,
                error,
                retryable,
            } => Outcome::Failure(self.queue.record_failure(&id, &error, now, retryable)),
            Action::RequeueFailed { id } => {
                Outcome::Changed(self.queue.requeue_failed(&id).is_some())
            }
            Action::DiscardFailed { id } => match self.queue.discard_failed(&id) {
                Some(op) => {
                    self.settle_pending(&op.path);
                    Outcome::Changed(true)
                }
                None => Outcome::Changed(false),
            },
            Action::DocumentsRefreshed { documents } => {
                for (path, data) in documents {
                    let has_pending = self.conflicts.pending_change(&path).is_some();
                    let data = data.map(|server| without_metadata(server, config));
                    match data.map(|server| self.overlay(&path, server)) {
                        Some(Some(view)) => {
                            self.cache.put(&path, &path, view, now);
                        }
                        Some(None) => {
                            self.cache.remove(&path);
                        }
                        None if !has_pending => {
                            self.cache.remove(&path);
                        }
                        None => {}
                    }
                }
                Outcome::None
            }
            Action::RefreshFailed { path } => {
                self.cache.mark_stale(&path);
                Outcome::None
            }
            Action::SnapshotReceived {
                key,
                path,
                data,
                authoritative,
            } => {
                let conflicts = if authoritative {
                    self.conflicts.detect(&path, &data, now)
                } else {
                    Vec::new()
                };
                let view = self.overlay(&path, without_metadata(data, config));
                match &view {
                    Some(view) => {
                        self.cache.put(&key, &path, view.clone(), now);
                    }
                    None => {
                        self.cache.remove(&key);
                    }
                }
                Outcome::Delivered { view, conflicts }
            }
            Action::OptimisticBegun(update) => {
                let key = update.key.clone();
                self.conflicts.record_write(
                    OperationKind::Update,
                    &key,
                    update.optimistic_value.as_object(),
                    update.original_value.as_ref(),
                    self.actor_id.clone(),
                    now,
                );
                self.cache.put(&key, &key, update.optimistic_value.clone(), now);
                self.optimistic.begin(update);
                Outcome::None
            }
            Action::OptimisticConfirmed { key, token } => {
                let confirmed = self.optimistic.confirm(&key, token);
                if confirmed {
                    self.settle_pending(&key);
                }
                Outcome::Changed(confirmed)
            }
            Action::OptimisticReverted { key, token } => {
                let reverted = self.optimistic.take_for_revert(&key, token);
                if let Some(update) = &reverted {
                    self.restore_original(update, now);
                }
                Outcome::Reverted(reverted)
            }
            Action::OptimisticSwept => {
                let (evicted, expired) = self.optimistic.sweep(
                    now,
                    config.optimistic_retention,
                    config.optimistic_timeout,
                );
                for update in &expired {
                    self.restore_original(update, now);
                }
                Outcome::Swept { evicted, expired }
            }
            Action::RetryRegistered { target, error } => {
                let (id, exhausted) =
                    self.retries
                        .register(target, error, now, config.retry.max_attempts);
                Outcome::Retry { id, exhausted }
            }
            Action::RetrySucceeded { id } => match self.retries.succeeded(&id) {
                Some(entry) => {
                    if let RetryTarget::Optimistic { key, value, .. } = &entry.target {
                        // a newer optimistic update on the key owns the cache
                        if self.optimistic.get(key).is_none() {
                            self.cache.put(key, key, value.clone(), now);
                        }
                    }
                    Outcome::Changed(true)
                }
                None => Outcome::Changed(false),
            },
            Action::RetryFailed { id, error } => {
                let exhausted = self.retries.failed(&id, error, now).unwrap_or(false);
                Outcome::Retry { id, exhausted }
            }
            Action::SubscriptionRetriesDropped { key } => {
                Outcome::Changed(self.retries.drop_subscriptions(key.as_deref()) > 0)
            }
            Action::ConflictResolved { id, action } => {
                match self.conflicts.resolve(&id, action, now) {
                    Ok(resolution) => {
                        if action == ConflictAction::AcceptServer {
                            self.accept_server_value(&resolution, now);
                        }
                        self.conflicts.prune_resolved(config.resolved_conflict_limit);
                        Outcome::Resolved(resolution)
                    }
                    Err(err) => Outcome::Rejected(err),
                }
            }
            Action::Reset => {
                self.syncing = false;
                self.last_sync_time = None;
                self.actor_id = config.actor_id.clone();
                self.queue.clear();
                self.cache.clear();
                self.optimistic.clear();
                self.conflicts.clear();
                self.retries.clear();
                Outcome::None
            }
        }
    }

    /// Server data overlaid with the fields of a pending local change.
    /// `None` when the document does not exist from the local point of view.
    fn overlay(&self, path: &str, server: Value) -> Option<Value> {
        match self.conflicts.pending_change(path) {
            Some(pending) if pending.kind == OperationKind::Delete => None,
            Some(pending) if !pending.fields.is_empty() => {
                let mut merged = match server {
                    Value::Object(fields) => fields,
                    _ => Map::new(),
                };
                merged.extend(pending.fields.clone());
                Some(Value::Object(merged))
            }
            _ => (!server.is_null()).then_some(server),
        }
    }

    /// Drop the pending change on `path` once nothing local is outstanding.
    fn settle_pending(&mut self, path: &str) {
        if !self.queue.has_pending_for(path) && !self.optimistic.has_unconfirmed(path) {
            self.conflicts.clear_pending(path);
        }
    }

    fn restore_original(&mut self, update: &OptimisticUpdate, now: Timestamp) {
        match &update.original_value {
            Some(original) => {
                self.cache.put(&update.key, &update.key, original.clone(), now);
            }
            None => {
                self.cache.remove(&update.key);
            }
        }
        self.settle_pending(&update.key);
    }

    fn accept_server_value(&mut self, resolution: &Resolution, now: Timestamp) {
        let record = &resolution.record;
        let dropped = self
            .queue
            .accept_server_field(&record.key, &record.field, &record.server_value);
        if dropped > 0 {
            tracing::debug!(path = %record.key, dropped, "queued writes emptied by conflict resolution");
        }

        if self.cache.get(&record.key).is_some() {
            let fields: Map<String, Value> =
                std::iter::once((record.field.clone(), record.server_value.clone())).collect();
            self.cache.merge_fields(&record.key, &record.key, &fields, now);
        }

        let emptied = self
            .conflicts
            .pending_change(&record.key)
            .is_some_and(|p| p.kind != OperationKind::Delete && p.fields.is_empty());
        if emptied && !self.conflicts.has_pending_conflict(&record.key) {
            self.conflicts.clear_pending(&record.key);
        } else {
            self.settle_pending(&record.key);
        }
    }
}
