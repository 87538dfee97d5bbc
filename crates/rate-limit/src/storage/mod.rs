//! Counter store backends.
//!
//! The store holds three kinds of state, all self-expiring through TTLs:
//! ordered timestamp sets for the sliding windows, plain string values for
//! overrides and alert suppression markers, and hashes for daily statistics.

use std::{collections::HashMap, future::Future, time::Duration};

use config::StorageConfig;

pub mod memory;
pub mod redis;
mod redis_pool;

pub use self::memory::InMemoryStorage;
pub use self::redis::RedisStorage;

/// Arguments of one atomic check-and-record call on a sliding window.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    /// Current time in milliseconds since the Unix epoch.
    pub now_ms: i64,
    /// Width of the trailing window in milliseconds.
    pub window_ms: i64,
    /// Number of samples the window may hold.
    pub max_requests: u32,
    /// Unique member recorded for this request when it is admitted.
    pub member: String,
    /// Lifetime of the whole set, refreshed on every admission.
    pub ttl: Duration,
}

impl WindowRequest {
    /// Samples with a score at or below this value are outside the window.
    pub fn cutoff(&self) -> i64 {
        self.now_ms - self.window_ms
    }
}

/// Result of a check-and-record call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Samples in the window after the call.
    pub count: u64,
    /// Whether a sample was recorded for this request.
    pub admitted: bool,
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Could not obtain a connection.
    #[error("Storage connection error: {0}")]
    Connection(String),
    /// A command or script failed.
    #[error("Storage query error: {0}")]
    Query(String),
    /// The store did not answer in time.
    #[error("Storage timed out after {0:?}")]
    Timeout(Duration),
    /// A stored value could not be encoded or decoded.
    #[error("Storage value error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Connection(_) => "connection",
            StorageError::Query(_) => "query",
            StorageError::Timeout(_) => "timeout",
            StorageError::Serialization(_) => "serialization",
        }
    }
}

/// A shared key-value store with atomic sliding window support.
///
/// Implementations must execute [`CounterStore::check_and_record`] atomically
/// with respect to every other caller on the same key, including callers in
/// other processes when the store is shared.
pub trait CounterStore: Send + Sync + 'static {
    /// Evicts expired samples, then records a new one if the window has room.
    fn check_and_record(
        &self,
        key: &str,
        request: &WindowRequest,
    ) -> impl Future<Output = Result<WindowCount, StorageError>> + Send;

    /// Counts samples newer than `now_ms - window_ms` without modifying the set.
    fn count_in_window(
        &self,
        key: &str,
        window_ms: i64,
        now_ms: i64,
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Reads a string value.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;

    /// Writes a string value with a TTL, replacing any previous value.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Writes a string value with a TTL only when the key does not exist.
    /// Returns whether the value was written.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Deletes keys, returning how many existed.
    fn delete(&self, keys: &[String]) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Increments an integer value and refreshes its TTL.
    fn increment(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<i64, StorageError>> + Send;

    /// Increments a field of a hash and refreshes the TTL of the hash.
    fn increment_field(
        &self,
        key: &str,
        field: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<i64, StorageError>> + Send;

    /// Reads every field of a hash.
    fn fields(&self, key: &str) -> impl Future<Output = Result<HashMap<String, u64>, StorageError>> + Send;

    /// Lists the live keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;
}

/// The store selected by configuration.
pub enum Storage {
    /// Process-local storage.
    Memory(InMemoryStorage),
    /// Shared Redis storage.
    Redis(RedisStorage),
}

impl Storage {
    /// Creates the configured backend, verifying connectivity for Redis.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        match config {
            StorageConfig::Memory => {
                log::debug!("Using in-memory counter store");
                Ok(Storage::Memory(InMemoryStorage::new()))
            }
            StorageConfig::Redis(redis_config) => {
                log::debug!("Connecting to Redis counter store at {}", redis_config.url);
                Ok(Storage::Redis(RedisStorage::new(redis_config).await?))
            }
        }
    }
}

impl CounterStore for Storage {
    async fn check_and_record(&self, key: &str, request: &WindowRequest) -> Result<WindowCount, StorageError> {
        match self {
            Storage::Memory(storage) => storage.check_and_record(key, request).await,
            Storage::Redis(storage) => storage.check_and_record(key, request).await,
        }
    }

    async fn count_in_window(&self, key: &str, window_ms: i64, now_ms: i64) -> Result<u64, StorageError> {
        match self {
            Storage::Memory(storage) => storage.count_in_window(key, window_ms, now_ms).await,
            Storage::Redis(storage) => storage.count_in_window(key, window_ms, now_ms).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self {
            Storage::Memory(storage) => storage.get(key).await,
            Storage::Redis(storage) => storage.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        match self {
            Storage::Memory(storage) => storage.set(key, value, ttl).await,
            Storage::Redis(storage) => storage.set(key, value, ttl).await,
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        match self {
            Storage::Memory(storage) => storage.set_if_absent(key, value, ttl).await,
            Storage::Redis(storage) => storage.set_if_absent(key, value, ttl).await,
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
        match self {
            Storage::Memory(storage) => storage.delete(keys).await,
            Storage::Redis(storage) => storage.delete(keys).await,
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StorageError> {
        match self {
            Storage::Memory(storage) => storage.increment(key, ttl).await,
            Storage::Redis(storage) => storage.increment(key, ttl).await,
        }
    }

    async fn increment_field(&self, key: &str, field: &str, ttl: Duration) -> Result<i64, StorageError> {
        match self {
            Storage::Memory(storage) => storage.increment_field(key, field, ttl).await,
            Storage::Redis(storage) => storage.increment_field(key, field, ttl).await,
        }
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, u64>, StorageError> {
        match self {
            Storage::Memory(storage) => storage.fields(key).await,
            Storage::Redis(storage) => storage.fields(key).await,
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        match self {
            Storage::Memory(storage) => storage.keys_with_prefix(prefix).await,
            Storage::Redis(storage) => storage.keys_with_prefix(prefix).await,
        }
    }
}
