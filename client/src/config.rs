//! Configuration for the sync engine.

use std::time::Duration;

/// Storage key under which the queue and cache blob is persisted.
pub const DEFAULT_STORAGE_KEY: &str = "carry.sync.state";

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Key passed to [`LocalStorage`](crate::LocalStorage) for the state blob.
    pub storage_key: String,
    /// Period of the background queue replay while online.
    pub replay_interval: Duration,
    /// Period of the optimistic-update sweep.
    pub sweep_interval: Duration,
    /// How long an optimistic update may wait for its remote operation.
    pub optimistic_timeout: Duration,
    /// How long confirmed optimistic updates are kept before eviction.
    pub optimistic_retention: Duration,
    /// Retry policy for queued operations and retry entries.
    pub retry: RetryConfig,
    /// Start a replay as soon as a write is issued while online.
    pub replay_on_write: bool,
    /// Add `updatedAt` / `updatedBy` to remote write payloads.
    pub stamp_metadata: bool,
    /// Acting identity used when a call does not supply one.
    pub actor_id: Option<String>,
    /// Resolved conflict records kept for inspection; older ones are dropped.
    pub resolved_conflict_limit: usize,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            replay_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            optimistic_timeout: Duration::from_secs(30),
            optimistic_retention: Duration::from_secs(30),
            retry: RetryConfig::default(),
            replay_on_write: true,
            stamp_metadata: true,
            actor_id: None,
            resolved_conflict_limit: 100,
        }
    }

    /// Sets the storage key.
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Sets the background replay interval.
    pub fn with_replay_interval(mut self, interval: Duration) -> Self {
        self.replay_interval = interval;
        self
    }

    /// Sets the optimistic sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the optimistic update timeout.
    pub fn with_optimistic_timeout(mut self, timeout: Duration) -> Self {
        self.optimistic_timeout = timeout;
        self
    }

    /// Sets the retention window for confirmed optimistic updates.
    pub fn with_optimistic_retention(mut self, retention: Duration) -> Self {
        self.optimistic_retention = retention;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables replay on write.
    pub fn with_replay_on_write(mut self, enabled: bool) -> Self {
        self.replay_on_write = enabled;
        self
    }

    /// Enables or disables metadata stamping of remote payloads.
    pub fn with_stamp_metadata(mut self, enabled: bool) -> Self {
        self.stamp_metadata = enabled;
        self
    }

    /// Sets the default acting identity.
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Sets how many resolved conflict records are kept.
    pub fn with_resolved_conflict_limit(mut self, limit: usize) -> Self {
        self.resolved_conflict_limit = limit;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts after which an operation is marked permanently failed.
    pub max_attempts: u32,
    /// Delay unit of the exponential backoff.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration with default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Backoff to wait after `attempts` failed attempts.
    ///
    /// `min(base * 2^attempts, max_delay)`, saturating on overflow.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether `attempts` has reached the limit.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
