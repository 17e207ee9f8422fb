//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Field injected into uploaded records carrying the uploading device's identifier.
pub const DEVICE_ID_FIELD: &str = "zonesync.deviceId";

/// Field injected into uploaded records carrying the writer's compatibility version.
pub const MODEL_VERSION_FIELD: &str = "zonesync.modelVersion";

/// Default push batch size.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Whether a cycle uploads local changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Pull remote changes, then push local ones.
    #[default]
    Sync,
    /// Pull remote changes only.
    DownloadOnly,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Namespace for keys persisted in the key-value store.
    pub identifier: String,
    /// Initial push batch size. Shrinks when the remote rejects a batch.
    pub batch_size: usize,
    /// Maximum records requested per change-feed page.
    pub fetch_page_size: usize,
    /// Highest record compatibility version understood locally; 0 disables the check.
    pub compatibility_version: i64,
    /// Field names stripped from incoming records before they reach an adapter.
    pub metadata_keys: Vec<String>,
    /// Pull-then-push or pull only.
    pub sync_mode: SyncMode,
    /// Re-fetch rounds allowed after a push reports server-side conflicts.
    pub max_upload_retries: u32,
    /// Retry configuration for transient remote errors.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            fetch_page_size: DEFAULT_BATCH_SIZE,
            compatibility_version: 0,
            metadata_keys: vec![DEVICE_ID_FIELD.to_string(), MODEL_VERSION_FIELD.to_string()],
            sync_mode: SyncMode::Sync,
            max_upload_retries: 2,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the initial push batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the change-feed page size.
    pub fn with_fetch_page_size(mut self, size: usize) -> Self {
        self.fetch_page_size = size.max(1);
        self
    }

    /// Sets the local compatibility version.
    pub fn with_compatibility_version(mut self, version: i64) -> Self {
        self.compatibility_version = version;
        self
    }

    /// Adds a metadata field name to strip from incoming records.
    pub fn with_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.metadata_keys.push(key.into());
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Sets the number of re-fetch rounds after push conflicts.
    pub fn with_max_upload_retries(mut self, retries: u32) -> Self {
        self.max_upload_retries = retries;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns true if `key` is a metadata field.
    pub fn is_metadata_key(&self, key: &str) -> bool {
        self.metadata_keys.iter().any(|k| k == key)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("zonesync")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per remote call.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
