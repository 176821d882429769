//! Online/offline signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared connectivity flag.
///
/// The host feeds it from whatever connectivity source it has; the engine
/// watches it and replays the queue when it flips to online. Clones share
/// the same flag.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for NetworkMonitor {
    /// Starts online.
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor {
    /// Create a monitor with an initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report a connectivity change. Returns false if the state was unchanged,
    /// in which case watchers are not woken.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    /// Receive every change from now on.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
