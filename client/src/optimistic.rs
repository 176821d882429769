//! Optimistic updates.
//!
//! [`SyncEngine::apply_optimistic`] shows a value in the cache before the
//! remote call it depends on has finished. The remote call is bounded by the
//! configured timeout; on success the update is confirmed, on failure or
//! timeout the cache goes back to the original value. A newer update on the
//! same key supersedes an older one, and the outcome of the older call is
//! then ignored.

use crate::{
    error::Result,
    remote::RemoteOp,
    retry::RetryTarget,
    state::{Action, Outcome},
    CacheKey, Error, SyncEngine, Timestamp,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A value shown locally ahead of remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticUpdate {
    pub key: CacheKey,
    /// Value to restore on revert; `None` removes the cache entry
    pub original_value: Option<Value>,
    pub optimistic_value: Value,
    pub started_at: Timestamp,
    pub confirmed: bool,
    #[serde(skip)]
    pub(crate) token: u64,
}

/// Optimistic updates by key, at most one per key.
#[derive(Debug, Default)]
pub struct OptimisticTracker {
    updates: HashMap<CacheKey, OptimisticUpdate>,
}

impl OptimisticTracker {
    /// Start tracking an update, superseding any previous one on its key.
    pub(crate) fn begin(&mut self, update: OptimisticUpdate) -> Option<OptimisticUpdate> {
        self.updates.insert(update.key.clone(), update)
    }

    /// Mark the update confirmed if `token` is still current.
    pub(crate) fn confirm(&mut self, key: &str, token: u64) -> bool {
        match self.updates.get_mut(key) {
            Some(update) if update.token == token && !update.confirmed => {
                update.confirmed = true;
                true
            }
            _ => false,
        }
    }

    /// Remove an unconfirmed update for reverting. With a token, only the
    /// update it was issued for is taken.
    pub(crate) fn take_for_revert(&mut self, key: &str, token: Option<u64>) -> Option<OptimisticUpdate> {
        let update = self.updates.get(key)?;
        if update.confirmed || token.is_some_and(|t| t != update.token) {
            return None;
        }
        self.updates.remove(key)
    }

    /// Evict confirmed updates older than `retention` and remove unconfirmed
    /// ones older than `timeout`. Returns the eviction count and the expired
    /// updates, which the caller reverts.
    pub(crate) fn sweep(
        &mut self,
        now: Timestamp,
        retention: Duration,
        timeout: Duration,
    ) -> (usize, Vec<OptimisticUpdate>) {
        let retention = retention.as_millis() as u64;
        let timeout = timeout.as_millis() as u64;

        let before = self.updates.len();
        self.updates
            .retain(|_, u| !(u.confirmed && now.saturating_sub(u.started_at) >= retention));
        let evicted = before - self.updates.len();

        let expired_keys: Vec<CacheKey> = self
            .updates
            .values()
            .filter(|u| !u.confirmed && now.saturating_sub(u.started_at) >= timeout)
            .map(|u| u.key.clone())
            .collect();
        let expired = expired_keys
            .iter()
            .filter_map(|key| self.updates.remove(key))
            .collect();

        (evicted, expired)
    }

    /// Whether `key` has an update awaiting confirmation.
    pub fn has_unconfirmed(&self, key: &str) -> bool {
        self.updates.get(key).is_some_and(|u| !u.confirmed)
    }

    /// The update on `key`, if tracked.
    pub fn get(&self, key: &str) -> Option<&OptimisticUpdate> {
        self.updates.get(key)
    }

    /// Every tracked update.
    pub fn iter(&self) -> impl Iterator<Item = &OptimisticUpdate> {
        self.updates.values()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.updates.clear();
    }
}

impl SyncEngine {
    /// Show `optimistic_value` under `key` immediately, then run `operation`.
    ///
    /// Resolves `Ok` once the remote call succeeded. If it fails, the cache is
    /// restored to `original_value` and the call is registered for retry; a
    /// retry that succeeds puts `optimistic_value` back unless a newer
    /// optimistic update on `key` is tracked by then. If it takes longer than
    /// the configured timeout, the cache is restored and [`Error::Timeout`]
    /// is returned. While offline the call is not attempted and is treated
    /// as a failure.
    pub async fn apply_optimistic(
        &self,
        key: impl Into<CacheKey>,
        original_value: Option<Value>,
        optimistic_value: Value,
        operation: RemoteOp,
    ) -> Result<()> {
        let key = key.into();
        let token = self.next_token();
        self.dispatch(Action::OptimisticBegun(OptimisticUpdate {
            key: key.clone(),
            original_value,
            optimistic_value: optimistic_value.clone(),
            started_at: self.now(),
            confirmed: false,
            token,
        }));

        let timeout = self.config().optimistic_timeout;
        let result = if self.is_online() {
            match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => {
                    let reverted = self.dispatch(Action::OptimisticReverted {
                        key: key.clone(),
                        token: Some(token),
                    });
                    if matches!(reverted, Outcome::Reverted(Some(_))) {
                        tracing::warn!(key = %key, timeout = ?timeout, "optimistic update timed out; reverted");
                    }
                    return Err(Error::Timeout(timeout));
                }
            }
        } else {
            Err(Error::Network("offline".into()))
        };

        match result {
            Ok(()) => {
                if matches!(
                    self.dispatch(Action::OptimisticConfirmed {
                        key: key.clone(),
                        token
                    }),
                    Outcome::Changed(true)
                ) {
                    tracing::debug!(key = %key, "optimistic update confirmed");
                }
                Ok(())
            }
            Err(err) => {
                let reverted = self.dispatch(Action::OptimisticReverted {
                    key: key.clone(),
                    token: Some(token),
                });
                if matches!(reverted, Outcome::Reverted(Some(_))) {
                    tracing::warn!(key = %key, error = %err, "optimistic update failed; reverted");
                    self.dispatch(Action::RetryRegistered {
                        target: RetryTarget::Optimistic {
                            key: key.clone(),
                            value: optimistic_value,
                            operation,
                        },
                        error: err.to_string(),
                    });
                } else {
                    tracing::debug!(key = %key, "superseded optimistic update failed");
                }
                Err(err)
            }
        }
    }

    /// Restore the original value of the unconfirmed update on `key`.
    ///
    /// Returns false if there is nothing to revert.
    pub fn revert_optimistic(&self, key: &str) -> bool {
        match self.dispatch(Action::OptimisticReverted {
            key: key.to_string(),
            token: None,
        }) {
            Outcome::Reverted(Some(_)) => {
                tracing::info!(key = %key, "optimistic update reverted");
                true
            }
            _ => false,
        }
    }

    /// Evict old confirmed updates and revert expired unconfirmed ones.
    ///
    /// Runs on a timer after [`SyncEngine::start`]. Returns how many updates
    /// were removed.
    pub fn sweep_optimistic(&self) -> usize {
        match self.dispatch(Action::OptimisticSwept) {
            Outcome::Swept { evicted, expired } => {
                for update in &expired {
                    tracing::warn!(key = %update.key, "optimistic update expired unconfirmed; reverted");
                }
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted confirmed optimistic updates");
                }
                evicted + expired.len()
            }
            _ => 0,
        }
    }

    /// Currently tracked optimistic updates.
    pub fn optimistic_updates(&self) -> Vec<OptimisticUpdate> {
        self.with_state(|s| s.optimistic().iter().cloned().collect())
    }
}
