//! Queued write operations.
//!
//! Every local create, update or delete becomes an [`OfflineOperation`] that
//! stays in the queue until the remote store has acknowledged it. Operations
//! always address a fixed document id, so executing one twice is absorbed by
//! the store's upsert-by-id semantics.

use crate::{config::RetryConfig, ActorId, DocPath, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for an operation.
pub type OperationId = String;

/// The kind of write an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Write a full document at a fixed id
    Create,
    /// Merge fields into a document
    Update,
    /// Remove a document
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A write waiting for remote acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineOperation {
    /// Operation ID
    pub id: OperationId,
    /// What the operation does
    pub kind: OperationKind,
    /// Target document path
    pub path: DocPath,
    /// Payload for creates and updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// When the write was issued locally
    pub enqueued_at: Timestamp,
    /// Identity that issued the write, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    /// Failed remote attempts so far
    pub attempts: u32,
    /// Attempts after which the operation is permanently failed
    pub max_attempts: u32,
    /// Time of the last remote attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<Timestamp>,
    /// Error of the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OfflineOperation {
    /// Create a new operation with a fresh id.
    pub fn new(
        kind: OperationKind,
        path: impl Into<DocPath>,
        data: Option<Value>,
        actor_id: Option<ActorId>,
        enqueued_at: Timestamp,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            path: path.into(),
            data,
            enqueued_at,
            actor_id,
            attempts: 0,
            max_attempts,
            last_attempt: None,
            last_error: None,
        }
    }

    /// Whether the backoff delay since the last attempt has elapsed.
    pub fn is_due(&self, now: Timestamp, retry: &RetryConfig) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => {
                let delay = retry.delay_for_attempt(self.attempts).as_millis() as u64;
                now >= last.saturating_add(delay)
            }
        }
    }

    /// Whether the operation has used up its attempts.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// The error a permanently failed operation is reported as.
    pub fn permanent_failure(&self) -> Error {
        Error::PermanentFailure {
            id: self.id.clone(),
            attempts: self.attempts,
            last_error: self.last_error.clone().unwrap_or_default(),
        }
    }

    /// Fields written by this operation, if it carries an object payload.
    pub fn fields(&self) -> Option<&serde_json::Map<String, Value>> {
        self.data.as_ref().and_then(Value::as_object)
    }
}
