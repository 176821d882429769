//! Shared setup for the integration tests.

#![allow(dead_code)]

use carry_client::{
    ManualClock, MemoryRemoteStore, MemoryStorage, NetworkMonitor, RemoteStore, RetryConfig,
    SyncConfig, SyncEngine,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Epoch the manual clocks start at.
pub const START: u64 = 1_700_000_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with replay only on demand, so tests drive every pass.
pub fn manual_config() -> SyncConfig {
    SyncConfig::default()
        .with_replay_on_write(false)
        .with_retry(RetryConfig::new(3))
}

pub struct Harness {
    pub engine: SyncEngine,
    pub remote: Arc<MemoryRemoteStore>,
    pub storage: Arc<MemoryStorage>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(config: SyncConfig, online: bool) -> Self {
        Self::with_remote(config, online, |remote| remote as Arc<dyn RemoteStore>)
    }

    /// Like [`Harness::new`], with the engine talking to the store through
    /// whatever `wrap` returns.
    pub fn with_remote(
        config: SyncConfig,
        online: bool,
        wrap: impl FnOnce(Arc<MemoryRemoteStore>) -> Arc<dyn RemoteStore>,
    ) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(START));
        let remote = Arc::new(MemoryRemoteStore::with_clock(clock.clone()));
        let storage = Arc::new(MemoryStorage::new());
        let engine = build(wrap(remote.clone()), storage.clone(), &clock, config, online);
        Self {
            engine,
            remote,
            storage,
            clock,
        }
    }

    /// A second engine over the same remote store, loading from `storage`.
    pub fn restart(&self, storage: Arc<MemoryStorage>, config: SyncConfig, online: bool) -> SyncEngine {
        build(self.remote.clone(), storage, &self.clock, config, online)
    }
}

fn build(
    remote: Arc<dyn RemoteStore>,
    storage: Arc<MemoryStorage>,
    clock: &Arc<ManualClock>,
    config: SyncConfig,
    online: bool,
) -> SyncEngine {
    SyncEngine::builder(remote, storage)
        .clock(clock.clone())
        .config(config)
        .network(NetworkMonitor::new(online))
        .build()
        .unwrap()
}

/// Yield to spawned tasks until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Run `future` on a fresh single-threaded runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}
