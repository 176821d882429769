//! Retry bookkeeping for work other than queued writes.
//!
//! Queued writes carry their own attempt counters. Subscriptions that lost
//! their transport and optimistic remote calls that failed are tracked here,
//! and replayed by the same pass that drains the queue.

use crate::{config::RetryConfig, remote::RemoteOp, CacheKey, RetryId, Timestamp};
use serde_json::Value;
use std::fmt;

/// What a retry entry re-runs.
#[derive(Clone)]
pub enum RetryTarget {
    /// Re-open the subscription registered under `key`
    Subscription { key: CacheKey },
    /// Re-run the remote call of an optimistic update; `value` goes back
    /// into the cache once the call succeeds
    Optimistic {
        key: CacheKey,
        value: Value,
        operation: RemoteOp,
    },
}

impl RetryTarget {
    /// Cache key the target belongs to.
    pub fn key(&self) -> &str {
        match self {
            RetryTarget::Subscription { key } | RetryTarget::Optimistic { key, .. } => key,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RetryTarget::Subscription { .. } => "subscription",
            RetryTarget::Optimistic { .. } => "optimistic",
        }
    }
}

impl fmt::Debug for RetryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTarget")
            .field("kind", &self.kind())
            .field("key", &self.key())
            .finish()
    }
}

/// A failed piece of work waiting to be retried.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub id: RetryId,
    pub target: RetryTarget,
    /// Failed attempts so far (the original failure counts)
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt: Timestamp,
    pub last_error: String,
}

impl RetryEntry {
    /// Whether the backoff delay since the last attempt has elapsed.
    pub fn is_due(&self, now: Timestamp, retry: &RetryConfig) -> bool {
        let delay = retry.delay_for_attempt(self.attempts).as_millis() as u64;
        now >= self.last_attempt.saturating_add(delay)
    }
}

/// Active and exhausted retry entries.
#[derive(Debug, Default)]
pub struct RetryRegistry {
    active: Vec<RetryEntry>,
    exhausted: Vec<RetryEntry>,
}

impl RetryRegistry {
    /// Register a failure. A subscription already waiting under the same key
    /// counts as a further failed attempt instead of a new entry.
    ///
    /// Returns the entry id and whether it is now exhausted.
    pub(crate) fn register(
        &mut self,
        target: RetryTarget,
        error: String,
        now: Timestamp,
        max_attempts: u32,
    ) -> (RetryId, bool) {
        if let RetryTarget::Subscription { key } = &target {
            let existing = self.active.iter().find(|e| {
                matches!(&e.target, RetryTarget::Subscription { key: k } if k == key)
            });
            if let Some(id) = existing.map(|e| e.id.clone()) {
                let exhausted = self.failed(&id, error, now).unwrap_or(false);
                return (id, exhausted);
            }
        }

        let entry = RetryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            attempts: 1,
            max_attempts,
            last_attempt: now,
            last_error: error,
        };
        let id = entry.id.clone();
        if entry.attempts >= entry.max_attempts {
            self.exhausted.push(entry);
            (id, true)
        } else {
            self.active.push(entry);
            (id, false)
        }
    }

    /// Entries whose backoff has elapsed, or every active entry if `force`.
    pub(crate) fn due(&self, now: Timestamp, retry: &RetryConfig, force: bool) -> Vec<RetryEntry> {
        self.active
            .iter()
            .filter(|e| force || e.is_due(now, retry))
            .cloned()
            .collect()
    }

    /// Drop an entry whose retry succeeded.
    pub(crate) fn succeeded(&mut self, id: &str) -> Option<RetryEntry> {
        let index = self.active.iter().position(|e| e.id == id)?;
        Some(self.active.remove(index))
    }

    /// Record a failed retry. Returns whether the entry is now exhausted.
    pub(crate) fn failed(&mut self, id: &str, error: String, now: Timestamp) -> Option<bool> {
        let index = self.active.iter().position(|e| e.id == id)?;
        let entry = &mut self.active[index];
        entry.attempts += 1;
        entry.last_attempt = now;
        entry.last_error = error;
        if entry.attempts < entry.max_attempts {
            return Some(false);
        }
        let entry = self.active.remove(index);
        self.exhausted.push(entry);
        Some(true)
    }

    /// Drop active subscription entries for `key`, or for every key.
    pub(crate) fn drop_subscriptions(&mut self, key: Option<&str>) -> usize {
        let before = self.active.len();
        self.active.retain(|e| match (&e.target, key) {
            (RetryTarget::Subscription { .. }, None) => false,
            (RetryTarget::Subscription { key: k }, Some(key)) => k != key,
            _ => true,
        });
        before - self.active.len()
    }

    /// Entries waiting to be retried.
    pub fn active(&self) -> &[RetryEntry] {
        &self.active
    }

    /// Entries that used up their attempts.
    pub fn exhausted(&self) -> &[RetryEntry] {
        &self.exhausted
    }

    pub(crate) fn clear(&mut self) {
        self.active.clear();
        self.exhausted.clear();
    }
}
