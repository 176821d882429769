//! The remote document store boundary.
//!
//! The engine talks to the server only through [`RemoteStore`]. Writes are
//! upserts by document id, so replaying an acknowledged operation a second
//! time leaves the server in the same state. [`MemoryRemoteStore`] is an
//! in-process implementation with failure injection, used by tests and
//! local development.

use crate::{
    clock::{Clock, SystemClock},
    error::Result,
    path,
    query::{matches_all, Filter},
    DocPath, Error, OperationKind,
};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Field stamped with the server write time on every replayed write.
pub const UPDATED_AT_FIELD: &str = "updatedAt";
/// Field stamped with the acting identity on every replayed write.
pub const UPDATED_BY_FIELD: &str = "updatedBy";

const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder the remote store replaces with its own write time.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

/// Whether `value` is the server timestamp placeholder.
pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.len() == 1 && o.get(SERVER_VALUE_KEY) == Some(&json!("timestamp")))
}

/// A document returned by `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: DocPath,
    pub data: Value,
}

/// One event on a live subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub path: DocPath,
    /// Document contents; `Null` when the document does not exist
    pub data: Value,
    /// Set when the snapshot reflects local writes the server has not
    /// acknowledged yet
    pub has_pending_writes: bool,
}

impl DocumentSnapshot {
    /// Whether the document exists.
    pub fn exists(&self) -> bool {
        !self.data.is_null()
    }
}

/// Stream of snapshot events for one subscription.
///
/// An `Err` item means the transport failed; the stream ends after it.
pub type SnapshotStream = mpsc::UnboundedReceiver<Result<DocumentSnapshot>>;

/// A remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch one document. `None` if it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Fetch the documents of a collection matching every filter.
    async fn list(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>>;

    /// Open a live subscription on a document path.
    async fn subscribe(&self, path: &str) -> Result<SnapshotStream>;

    /// Write a full document at a fixed id.
    async fn create(&self, path: &str, data: Value) -> Result<()>;

    /// Merge fields into a document, creating it if missing.
    async fn update(&self, path: &str, data: Value) -> Result<()>;

    /// Remove a document. Removing a missing document succeeds.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// A remote call issued by an optimistic update, retryable as a whole.
pub type RemoteOp = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`RemoteOp`].
pub fn remote_op<F, Fut>(f: F) -> RemoteOp
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

type SnapshotSender = mpsc::UnboundedSender<Result<DocumentSnapshot>>;

#[derive(Debug)]
struct StoreState {
    documents: BTreeMap<DocPath, Value>,
    watchers: HashMap<DocPath, Vec<SnapshotSender>>,
    reachable: bool,
    failing_paths: HashMap<DocPath, Error>,
    fail_next_writes: u32,
    writes: Vec<(OperationKind, DocPath)>,
}

/// In-process remote store.
///
/// Resolves the server timestamp placeholder with its own clock and pushes a
/// snapshot to every subscriber of a path after each write.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    /// Create an empty, reachable store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty, reachable store with the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                documents: BTreeMap::new(),
                watchers: HashMap::new(),
                reachable: true,
                failing_paths: HashMap::new(),
                fail_next_writes: 0,
                writes: Vec::new(),
            }),
            clock,
        }
    }

    /// Make the store reachable or not.
    ///
    /// Going unreachable fails every open subscription.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        state.reachable = reachable;
        if !reachable {
            Self::fail_watchers(&mut state, "remote store unreachable");
        }
    }

    /// Fail every write to `path` with `error` until healed.
    pub fn fail_path(&self, path: &str, error: Error) {
        self.state.lock().failing_paths.insert(path.to_string(), error);
    }

    /// Stop failing writes to `path`.
    pub fn heal_path(&self, path: &str) {
        self.state.lock().failing_paths.remove(path);
    }

    /// Fail the next `count` writes with a network error.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().fail_next_writes = count;
    }

    /// Send a transport error to every open subscription and close them.
    pub fn break_subscriptions(&self) {
        Self::fail_watchers(&mut self.state.lock(), "subscription transport lost");
    }

    /// Write a document as another client would, bypassing failure injection.
    pub fn put_external(&self, path: &str, data: Value) {
        let data = self.resolve(data);
        let mut state = self.state.lock();
        state.documents.insert(path.to_string(), data);
        Self::notify(&mut state, path);
    }

    /// Remove a document as another client would.
    pub fn remove_external(&self, path: &str) {
        let mut state = self.state.lock();
        state.documents.remove(path);
        Self::notify(&mut state, path);
    }

    /// Current server value of a document.
    pub fn document(&self, path: &str) -> Option<Value> {
        self.state.lock().documents.get(path).cloned()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.state.lock().documents.len()
    }

    /// Whether no documents are stored.
    pub fn is_empty(&self) -> bool {
        self.state.lock().documents.is_empty()
    }

    /// Every write the store accepted, in order.
    pub fn writes(&self) -> Vec<(OperationKind, DocPath)> {
        self.state.lock().writes.clone()
    }

    /// Number of accepted writes.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Number of open subscriptions on `path`.
    pub fn subscriber_count(&self, path: &str) -> usize {
        let mut state = self.state.lock();
        match state.watchers.get_mut(path) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    fn check_reachable(state: &StoreState) -> Result<()> {
        if state.reachable {
            Ok(())
        } else {
            Err(Error::Network("remote store unreachable".into()))
        }
    }

    fn check_write(state: &mut StoreState, path: &str) -> Result<()> {
        Self::check_reachable(state)?;
        if state.fail_next_writes > 0 {
            state.fail_next_writes -= 1;
            return Err(Error::Network(format!("write to {path} dropped")));
        }
        if let Some(error) = state.failing_paths.get(path) {
            return Err(error.clone());
        }
        Ok(())
    }

    fn resolve(&self, data: Value) -> Value {
        match data {
            Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(field, value)| {
                        if is_server_timestamp(&value) {
                            (field, Value::from(self.clock.now()))
                        } else {
                            (field, value)
                        }
                    })
                    .collect(),
            ),
            other => other,
        }
    }

    fn snapshot(state: &StoreState, path: &str) -> DocumentSnapshot {
        DocumentSnapshot {
            path: path.to_string(),
            data: state.documents.get(path).cloned().unwrap_or(Value::Null),
            has_pending_writes: false,
        }
    }

    fn notify(state: &mut StoreState, path: &str) {
        let snapshot = Self::snapshot(state, path);
        if let Some(senders) = state.watchers.get_mut(path) {
            senders.retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
        }
    }

    fn fail_watchers(state: &mut StoreState, reason: &str) {
        for (_, senders) in state.watchers.drain() {
            for tx in senders {
                let _ = tx.send(Err(Error::Network(reason.to_string())));
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(state.documents.get(path).cloned())
    }

    async fn list(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(state
            .documents
            .iter()
            .filter(|(p, data)| path::is_child_of(p, collection) && matches_all(filters, data))
            .map(|(p, data)| Document {
                path: p.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn subscribe(&self, path: &str) -> Result<SnapshotStream> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(Self::snapshot(&state, path)));
        state.watchers.entry(path.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn create(&self, path: &str, data: Value) -> Result<()> {
        let data = self.resolve(data);
        let mut state = self.state.lock();
        Self::check_write(&mut state, path)?;
        state.documents.insert(path.to_string(), data);
        state.writes.push((OperationKind::Create, path.to_string()));
        Self::notify(&mut state, path);
        Ok(())
    }

    async fn update(&self, path: &str, data: Value) -> Result<()> {
        let Value::Object(fields) = self.resolve(data) else {
            return Err(Error::Rejected(format!("update of {path} is not an object")));
        };
        let mut state = self.state.lock();
        Self::check_write(&mut state, path)?;
        let mut merged = match state.documents.get(path) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        merged.extend(fields);
        state.documents.insert(path.to_string(), Value::Object(merged));
        state.writes.push((OperationKind::Update, path.to_string()));
        Self::notify(&mut state, path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_write(&mut state, path)?;
        state.documents.remove(path);
        state.writes.push((OperationKind::Delete, path.to_string()));
        Self::notify(&mut state, path);
        Ok(())
    }
}
