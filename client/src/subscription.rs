//! Live subscriptions.
//!
//! A subscription is registered under a cache key and follows one document
//! path. While attached, every snapshot updates the cache and is handed to
//! the callback. When the transport fails the subscription detaches, the
//! cached value keeps being served, and a retry entry reopens it later.
//! Going offline leaves subscriptions registered; they are reopened when the
//! network comes back.

use crate::{
    engine::Inner,
    error::Result,
    path,
    remote::{DocumentSnapshot, SnapshotStream},
    retry::RetryTarget,
    scheduler::TaskHandle,
    state::{Action, Outcome},
    CacheKey, DocPath, Error, SyncEngine,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Called with the current value of a subscribed document. `Null` means the
/// document does not exist.
pub type SnapshotCallback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Slot {
    path: DocPath,
    callback: SnapshotCallback,
    generation: u64,
    /// Listener task; `None` while detached
    task: Option<TaskHandle>,
}

/// Registered subscriptions by cache key.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl SubscriptionRegistry {
    /// Register a subscription, replacing (and closing) any previous one on
    /// the same key. Returns whether one was replaced.
    fn insert(&self, key: CacheKey, path: DocPath, callback: SnapshotCallback, generation: u64) -> bool {
        let slot = Slot {
            path,
            callback,
            generation,
            task: None,
        };
        let previous = self.slots.lock().insert(key, slot);
        previous.is_some()
    }

    /// Remove a subscription. With a generation, only that registration is
    /// removed.
    fn remove(&self, key: &str, generation: Option<u64>) -> bool {
        let removed = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(slot) if generation.map_or(true, |g| g == slot.generation) => {
                    slots.remove(key)
                }
                _ => None,
            }
        };
        removed.is_some()
    }

    fn drain(&self) -> Vec<CacheKey> {
        let drained: Vec<(CacheKey, Slot)> = self.slots.lock().drain().collect();
        drained.into_iter().map(|(key, _)| key).collect()
    }

    fn is_current(&self, key: &str, generation: u64) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|s| s.generation == generation)
    }

    /// Path and generation of a detached subscription.
    fn detached_target(&self, key: &str) -> Option<(DocPath, u64)> {
        self.slots
            .lock()
            .get(key)
            .filter(|s| s.task.is_none())
            .map(|s| (s.path.clone(), s.generation))
    }

    fn callback(&self, key: &str, generation: u64) -> Option<SnapshotCallback> {
        self.slots
            .lock()
            .get(key)
            .filter(|s| s.generation == generation)
            .map(|s| s.callback.clone())
    }

    /// Install a listener. Returns it back if the registration is gone.
    fn attach(&self, key: &str, generation: u64, task: TaskHandle) -> Option<TaskHandle> {
        match self.slots.lock().get_mut(key) {
            Some(slot) if slot.generation == generation => {
                slot.task = Some(task);
                None
            }
            _ => Some(task),
        }
    }

    /// Take the listener off a registration.
    fn detach(&self, key: &str, generation: u64) -> Option<TaskHandle> {
        self.slots
            .lock()
            .get_mut(key)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.task.take())
    }

    fn detached_keys(&self) -> Vec<CacheKey> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, s)| s.task.is_none())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn is_attached(&self, key: &str) -> Option<bool> {
        self.slots.lock().get(key).map(|s| s.task.is_some())
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Handle to one subscription registration.
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    key: CacheKey,
    generation: u64,
    engine: Weak<Inner>,
}

impl SubscriptionHandle {
    /// Cache key the subscription writes to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Close this subscription. Does nothing if the key has since been
    /// subscribed again.
    pub fn unsubscribe(self) -> bool {
        match SyncEngine::from_weak(&self.engine) {
            Some(engine) => engine.remove_subscription(&self.key, Some(self.generation)),
            None => false,
        }
    }
}

impl SyncEngine {
    /// Follow `path`, writing every snapshot to the cache under `key` and
    /// passing it to `on_data`.
    ///
    /// While offline, or if the subscription cannot be opened, `on_data` is
    /// called with the cached value (if any) and the subscription is opened
    /// later. Subscribing again on the same key replaces the previous
    /// subscription.
    pub async fn subscribe<F>(
        &self,
        key: impl Into<CacheKey>,
        path: &str,
        on_data: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        path::validate_document_path(path)?;
        let key = key.into();
        let generation = self.next_token();

        if self
            .inner
            .subscriptions
            .insert(key.clone(), path.to_string(), Arc::new(on_data), generation)
        {
            tracing::debug!(key = %key, "subscription replaced");
        }
        self.dispatch(Action::SubscriptionRetriesDropped {
            key: Some(key.clone()),
        });

        if self.is_online() {
            if let Err(err) = self.try_attach(&key).await {
                tracing::warn!(key = %key, path = %path, error = %err, "subscribe failed; will retry");
                self.dispatch(Action::RetryRegistered {
                    target: RetryTarget::Subscription { key: key.clone() },
                    error: err.to_string(),
                });
                self.deliver_cached(&key, generation);
            }
        } else {
            tracing::debug!(key = %key, path = %path, "offline; subscription deferred");
            self.deliver_cached(&key, generation);
        }

        Ok(SubscriptionHandle {
            key,
            generation,
            engine: self.downgrade(),
        })
    }

    /// Close the subscription on `key`.
    pub fn unsubscribe(&self, key: &str) -> bool {
        self.remove_subscription(key, None)
    }

    /// Close every subscription.
    pub fn unsubscribe_all(&self) {
        let keys = self.inner.subscriptions.drain();
        self.dispatch(Action::SubscriptionRetriesDropped { key: None });
        if !keys.is_empty() {
            tracing::debug!(count = keys.len(), "all subscriptions closed");
        }
    }

    /// Number of registered subscriptions, attached or not.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Whether the subscription on `key` currently has a live stream.
    pub fn is_subscription_attached(&self, key: &str) -> bool {
        self.inner.subscriptions.is_attached(key).unwrap_or(false)
    }

    fn remove_subscription(&self, key: &str, generation: Option<u64>) -> bool {
        if !self.inner.subscriptions.remove(key, generation) {
            return false;
        }
        self.dispatch(Action::SubscriptionRetriesDropped {
            key: Some(key.to_string()),
        });
        tracing::debug!(key = %key, "unsubscribed");
        true
    }

    /// Open the stream of a detached subscription. Succeeds without doing
    /// anything if the key is attached or no longer subscribed.
    pub(crate) async fn try_attach(&self, key: &str) -> Result<()> {
        let Some((path, generation)) = self.inner.subscriptions.detached_target(key) else {
            return Ok(());
        };
        let mut stream = self.inner.remote.subscribe(&path).await?;

        // Snapshots already buffered are applied before returning, so a
        // replay started right after sees any conflict they reveal.
        while let Ok(event) = stream.try_recv() {
            match event {
                Ok(snapshot) => self.on_snapshot(key, generation, snapshot),
                Err(err) => return Err(err),
            }
        }

        let task = TaskHandle::spawn(
            "subscription",
            listen(self.downgrade(), key.to_string(), generation, stream),
        );
        if self.inner.subscriptions.attach(key, generation, task).is_some() {
            tracing::debug!(key = %key, "subscription removed while attaching");
            return Ok(());
        }
        self.dispatch(Action::SubscriptionRetriesDropped {
            key: Some(key.to_string()),
        });
        tracing::debug!(key = %key, path = %path, "subscription attached");
        Ok(())
    }

    pub(crate) async fn reattach_subscriptions(&self) {
        for key in self.inner.subscriptions.detached_keys() {
            if let Err(err) = self.try_attach(&key).await {
                tracing::warn!(key = %key, error = %err, "reattach failed; will retry");
                self.dispatch(Action::RetryRegistered {
                    target: RetryTarget::Subscription { key },
                    error: err.to_string(),
                });
            }
        }
    }

    fn on_snapshot(&self, key: &str, generation: u64, snapshot: DocumentSnapshot) {
        if !self.inner.subscriptions.is_current(key, generation) {
            return;
        }
        let outcome = self.dispatch(Action::SnapshotReceived {
            key: key.to_string(),
            path: snapshot.path.clone(),
            data: snapshot.data,
            authoritative: !snapshot.has_pending_writes,
        });
        let Outcome::Delivered { view, conflicts } = outcome else {
            return;
        };
        for id in &conflicts {
            tracing::info!(conflict_id = %id, path = %snapshot.path, "conflict detected");
        }
        if let Some(callback) = self.inner.subscriptions.callback(key, generation) {
            callback(&view.unwrap_or(Value::Null));
        }
    }

    fn on_subscription_error(&self, key: &str, generation: u64, err: Error) {
        // Aborts the calling listener; it returns without awaiting again.
        if self.inner.subscriptions.detach(key, generation).is_none() {
            return;
        }
        if self.is_online() {
            tracing::warn!(key = %key, error = %err, "subscription lost; will retry");
            self.dispatch(Action::RetryRegistered {
                target: RetryTarget::Subscription {
                    key: key.to_string(),
                },
                error: err.to_string(),
            });
        } else {
            tracing::debug!(key = %key, "subscription closed while offline");
        }
        self.deliver_cached(key, generation);
    }

    fn deliver_cached(&self, key: &str, generation: u64) {
        let Some(value) = self.cached(key) else {
            return;
        };
        if let Some(callback) = self.inner.subscriptions.callback(key, generation) {
            callback(&value);
        }
    }
}

async fn listen(weak: Weak<Inner>, key: CacheKey, generation: u64, mut stream: SnapshotStream) {
    while let Some(event) = stream.recv().await {
        let Some(engine) = SyncEngine::from_weak(&weak) else {
            return;
        };
        match event {
            Ok(snapshot) => engine.on_snapshot(&key, generation, snapshot),
            Err(err) => {
                engine.on_subscription_error(&key, generation, err);
                return;
            }
        }
    }

    if let Some(engine) = SyncEngine::from_weak(&weak) {
        engine.on_subscription_error(
            &key,
            generation,
            Error::Network("snapshot stream closed".into()),
        );
    }
}
