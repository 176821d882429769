//! # Carry Client
//!
//! An offline-first synchronization engine for applications that write to a
//! remote document store over an unreliable network.
//!
//! Every write is applied to a local cache and appended to a durable queue
//! before any network call is made, so callers always see their write succeed
//! locally. The queue is replayed with exponential backoff whenever the
//! network is available; live subscriptions feed authoritative server state
//! back into the cache, and divergence between a pending local write and the
//! server is recorded as a conflict for the application to resolve.
//!
//! ## Components
//!
//! - [`NetworkMonitor`] - online/offline signal and change notifications
//! - [`OfflineQueue`] - ordered log of pending writes, persisted on every change
//! - [`Cache`] - last known value of every touched document, versioned
//! - Optimistic updates - [`SyncEngine::apply_optimistic`] applies a value
//!   locally, runs a remote operation, then confirms or reverts
//! - Subscriptions - [`SyncEngine::subscribe`] keeps a path live
//! - Conflicts - [`ConflictRecord`]s resolved with [`SyncEngine::resolve_conflict`]
//!
//! All of them share one [`SyncState`], mutated only through typed actions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use carry_client::{MemoryRemoteStore, MemoryStorage, SyncEngine};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> carry_client::Result<()> {
//! let remote = Arc::new(MemoryRemoteStore::new());
//! let storage = Arc::new(MemoryStorage::new());
//! let engine = SyncEngine::builder(remote, storage).build()?;
//! engine.start();
//!
//! // Applied locally right away, replayed to the remote store when online.
//! engine.create("inv/123", json!({"stock": 10}), Some("cashier-1"))?;
//!
//! let doc = engine.get("inv/123").await?;
//! assert_eq!(doc, Some(json!({"stock": 10})));
//!
//! let status = engine.status();
//! println!("{} queued, {} failed", status.queued_count, status.failed_count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! The queue, cache, pending-change markers and conflict records are written
//! as one JSON blob through [`LocalStorage`] after every mutating action.
//! [`FileStorage`] replaces the file atomically, so a crash mid-save leaves
//! the previous blob intact.

pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod network;
pub mod operation;
pub mod optimistic;
pub mod path;
pub mod persist;
pub mod query;
pub mod queue;
pub mod remote;
pub mod replay;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod state;
pub mod storage;
pub mod subscription;

// Re-export main types at crate root
pub use cache::{Cache, CacheEntry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use conflict::{ConflictAction, ConflictRecord, PendingChange};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Error, Result};
pub use network::NetworkMonitor;
pub use operation::{OfflineOperation, OperationId, OperationKind};
pub use optimistic::OptimisticUpdate;
pub use persist::{PersistedState, PERSIST_FORMAT_VERSION};
pub use query::{Filter, FilterOp};
pub use queue::{FailureOutcome, OfflineQueue};
pub use remote::{
    remote_op, server_timestamp, Document, DocumentSnapshot, MemoryRemoteStore, RemoteOp,
    RemoteStore, SnapshotStream,
};
pub use replay::ReplayReport;
pub use retry::{RetryEntry, RetryTarget};
pub use scheduler::{PeriodicTask, TaskHandle};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use state::{SyncState, SyncStatus};
pub use storage::{FileStorage, LocalStorage, MemoryStorage};
pub use subscription::SubscriptionHandle;

/// Type aliases for clarity
pub type DocPath = String;
pub type CacheKey = String;
pub type ActorId = String;
pub type ConflictId = String;
pub type RetryId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
