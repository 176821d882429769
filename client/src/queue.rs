//! The offline operation queue.
//!
//! An ordered log of writes not yet confirmed by the remote store, plus the
//! operations that exhausted their attempts. Failed operations are retained
//! for inspection and manual requeue; nothing is silently dropped.

use crate::{OfflineOperation, OperationId, OperationKind, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The operation stays queued and will be retried after its backoff.
    WillRetry { attempts: u32 },
    /// The operation moved to the permanently failed list.
    PermanentlyFailed { attempts: u32 },
}

/// Pending and permanently failed operations, in enqueue order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueue {
    pending: Vec<OfflineOperation>,
    failed: Vec<OfflineOperation>,
}

impl OfflineQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation to the end of the log.
    pub fn enqueue(&mut self, op: OfflineOperation) {
        self.pending.push(op);
    }

    /// Operations waiting for the remote store, oldest first.
    pub fn list_pending(&self) -> &[OfflineOperation] {
        &self.pending
    }

    /// Operations that exhausted their attempts.
    pub fn list_permanently_failed(&self) -> &[OfflineOperation] {
        &self.failed
    }

    /// Look up a pending operation.
    pub fn get(&self, id: &str) -> Option<&OfflineOperation> {
        self.pending.iter().find(|op| op.id == id)
    }

    /// Whether any pending operation targets `path`.
    pub fn has_pending_for(&self, path: &str) -> bool {
        self.pending.iter().any(|op| op.path == path)
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove an acknowledged operation.
    pub fn record_success(&mut self, id: &str) -> Option<OfflineOperation> {
        let index = self.pending.iter().position(|op| op.id == id)?;
        Some(self.pending.remove(index))
    }

    /// Record a failed attempt.
    ///
    /// The operation becomes permanently failed when its attempts reach
    /// `max_attempts`, or immediately when `retryable` is false.
    pub fn record_failure(
        &mut self,
        id: &str,
        error: &str,
        now: Timestamp,
        retryable: bool,
    ) -> Option<FailureOutcome> {
        let index = self.pending.iter().position(|op| op.id == id)?;
        let op = &mut self.pending[index];
        op.attempts += 1;
        op.last_attempt = Some(now);
        op.last_error = Some(error.to_string());

        let attempts = op.attempts;
        if retryable && !op.is_exhausted() {
            return Some(FailureOutcome::WillRetry { attempts });
        }

        let op = self.pending.remove(index);
        self.failed.push(op);
        Some(FailureOutcome::PermanentlyFailed { attempts })
    }

    /// Move a permanently failed operation back to the end of the log with
    /// fresh attempts.
    pub fn requeue_failed(&mut self, id: &str) -> Option<OperationId> {
        let index = self.failed.iter().position(|op| op.id == id)?;
        let mut op = self.failed.remove(index);
        op.attempts = 0;
        op.last_attempt = None;
        op.last_error = None;
        let id = op.id.clone();
        self.pending.push(op);
        Some(id)
    }

    /// Drop a permanently failed operation.
    pub fn discard_failed(&mut self, id: &str) -> Option<OfflineOperation> {
        let index = self.failed.iter().position(|op| op.id == id)?;
        Some(self.failed.remove(index))
    }

    /// Give up the local value of `field` on `path` in favor of
    /// `server_value`.
    ///
    /// Updates lose the field, and an update left without fields is dropped.
    /// A create replaces the whole document, so it carries `server_value`
    /// instead, or no such field when the server has none. Returns the
    /// number of operations dropped.
    pub fn accept_server_field(&mut self, path: &str, field: &str, server_value: &Value) -> usize {
        for op in self.pending.iter_mut().filter(|op| op.path == path) {
            let Some(fields) = op.data.as_mut().and_then(Value::as_object_mut) else {
                continue;
            };
            match op.kind {
                OperationKind::Create if !server_value.is_null() => {
                    fields.insert(field.to_string(), server_value.clone());
                }
                _ => {
                    fields.remove(field);
                }
            }
        }

        let before = self.pending.len();
        self.pending.retain(|op| {
            !(op.path == path
                && op.kind == OperationKind::Update
                && op.fields().is_some_and(|f| f.is_empty()))
        });
        before - self.pending.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.failed.clear();
    }
}
