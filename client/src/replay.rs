//! Queue replay.
//!
//! A pass walks the queue oldest first and executes each operation against
//! the remote store. Writes to one document are applied in order: once an
//! operation on a path fails, is still backing off, or is blocked by an
//! unresolved conflict, every later operation on that path waits for a
//! future pass. Operations on other paths proceed. After the queue, due
//! retry entries (lost subscriptions, failed optimistic calls) are re-run.
//!
//! Only one pass runs at a time.

use crate::{
    error::Result,
    queue::FailureOutcome,
    remote::{server_timestamp, UPDATED_AT_FIELD, UPDATED_BY_FIELD},
    retry::RetryTarget,
    state::{Action, Outcome},
    OfflineOperation, OperationId, OperationKind, RetryId, SyncEngine,
};
use serde_json::Value;
use std::collections::HashSet;

/// What one replay pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Queued operations sent to the remote store
    pub attempted: usize,
    pub succeeded: Vec<OperationId>,
    /// Failed but still queued for another attempt
    pub failed: Vec<OperationId>,
    /// Moved to the permanently failed list during this pass
    pub permanently_failed: Vec<OperationId>,
    /// Skipped because of backoff, an earlier failure on the same path, or
    /// an unresolved conflict
    pub deferred: usize,
    pub retries_succeeded: Vec<RetryId>,
    pub retries_failed: Vec<RetryId>,
}

impl ReplayReport {
    /// Whether every attempted operation and retry succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.permanently_failed.is_empty()
            && self.retries_failed.is_empty()
    }
}

impl SyncEngine {
    /// Replay queued operations whose backoff has elapsed.
    ///
    /// Does nothing while offline.
    pub async fn replay(&self) -> ReplayReport {
        self.run_pass(false).await
    }

    /// Replay every queued operation and retry entry now, ignoring backoff.
    /// Ordering and conflict holds still apply.
    pub async fn force_sync(&self) -> ReplayReport {
        self.run_pass(true).await
    }

    async fn run_pass(&self, force: bool) -> ReplayReport {
        let _pass = self.inner.replay_lock.lock().await;
        let mut report = ReplayReport::default();
        if !self.is_online() {
            tracing::debug!("offline; replay skipped");
            return report;
        }

        self.dispatch(Action::ReplayStarted);
        let retry = self.config().retry;
        let ops = self.pending_operations();
        tracing::debug!(queued = ops.len(), force, "replay pass started");

        let total = ops.len();
        let mut held: HashSet<String> = HashSet::new();
        for (index, op) in ops.into_iter().enumerate() {
            if !self.is_online() {
                tracing::info!(remaining = total - index, "went offline during replay; stopping pass");
                report.deferred += total - index;
                break;
            }
            if held.contains(&op.path) {
                report.deferred += 1;
                continue;
            }

            if self.with_state(|s| s.queue().get(&op.id).is_none()) {
                continue;
            }
            if let Err(err) = self.ensure_no_conflict(&op.path) {
                tracing::debug!(op_id = %op.id, error = %err, "operation held");
                held.insert(op.path.clone());
                report.deferred += 1;
                continue;
            }
            if !force && !op.is_due(self.now(), &retry) {
                held.insert(op.path.clone());
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            match self.execute(&op).await {
                Ok(()) => {
                    self.dispatch(Action::OperationSucceeded { id: op.id.clone() });
                    tracing::debug!(op_id = %op.id, kind = %op.kind, path = %op.path, "operation replayed");
                    report.succeeded.push(op.id);
                }
                Err(err) => {
                    held.insert(op.path.clone());
                    let outcome = self.dispatch(Action::OperationFailed {
                        id: op.id.clone(),
                        error: err.to_string(),
                        retryable: err.is_retryable(),
                    });
                    match outcome {
                        Outcome::Failure(Some(FailureOutcome::WillRetry { attempts })) => {
                            tracing::warn!(
                                op_id = %op.id,
                                path = %op.path,
                                attempts,
                                error = %err,
                                "operation failed; will retry"
                            );
                            report.failed.push(op.id);
                        }
                        Outcome::Failure(Some(FailureOutcome::PermanentlyFailed { attempts })) => {
                            tracing::error!(
                                op_id = %op.id,
                                path = %op.path,
                                attempts,
                                error = %err,
                                "operation failed permanently"
                            );
                            report.permanently_failed.push(op.id);
                        }
                        _ => {}
                    }
                }
            }
        }

        self.run_retries(force, &mut report).await;

        let clean = report.is_clean() && report.deferred == 0;
        self.dispatch(Action::ReplayFinished { clean });
        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            permanently_failed = report.permanently_failed.len(),
            deferred = report.deferred,
            "replay pass finished"
        );
        report
    }

    async fn run_retries(&self, force: bool, report: &mut ReplayReport) {
        let retry = self.config().retry;
        let now = self.now();
        let due = self.with_state(|s| s.retries().due(now, &retry, force));

        for entry in due {
            if !self.is_online() {
                break;
            }
            let result = match &entry.target {
                RetryTarget::Subscription { key } => self.try_attach(key).await,
                RetryTarget::Optimistic { operation, .. } => operation().await,
            };
            match result {
                Ok(()) => {
                    self.dispatch(Action::RetrySucceeded {
                        id: entry.id.clone(),
                    });
                    tracing::info!(
                        retry_id = %entry.id,
                        kind = entry.target.kind(),
                        key = %entry.target.key(),
                        "retry succeeded"
                    );
                    report.retries_succeeded.push(entry.id);
                }
                Err(err) => {
                    let outcome = self.dispatch(Action::RetryFailed {
                        id: entry.id.clone(),
                        error: err.to_string(),
                    });
                    if matches!(outcome, Outcome::Retry { exhausted: true, .. }) {
                        tracing::error!(
                            retry_id = %entry.id,
                            kind = entry.target.kind(),
                            key = %entry.target.key(),
                            error = %err,
                            "retry exhausted"
                        );
                    }
                    report.retries_failed.push(entry.id);
                }
            }
        }
    }

    /// Send one operation to the remote store.
    async fn execute(&self, op: &OfflineOperation) -> Result<()> {
        let remote = &self.inner.remote;
        match op.kind {
            OperationKind::Create => remote.create(&op.path, self.remote_payload(op)).await,
            OperationKind::Update => remote.update(&op.path, self.remote_payload(op)).await,
            OperationKind::Delete => remote.delete(&op.path).await,
        }
    }

    /// Operation payload with write metadata stamped on.
    fn remote_payload(&self, op: &OfflineOperation) -> Value {
        let mut data = op.data.clone().unwrap_or(Value::Null);
        if self.config().stamp_metadata {
            if let Some(fields) = data.as_object_mut() {
                fields.insert(UPDATED_AT_FIELD.to_string(), server_timestamp());
                if let Some(actor_id) = &op.actor_id {
                    fields.insert(UPDATED_BY_FIELD.to_string(), Value::String(actor_id.clone()));
                }
            }
        }
        data
    }
}
