//! In-memory counter store for single-instance deployments and tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{CounterStore, StorageError, WindowCount, WindowRequest};

/// Expired entries are swept after this many writes.
const SWEEP_INTERVAL: u64 = 4096;

enum Value {
    Text(String),
    Hash(HashMap<String, u64>),
    /// Samples ordered by score, then member.
    Window(BTreeSet<(i64, String)>),
}

struct Slot {
    value: Value,
    expires_at: Instant,
}

impl Slot {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory counter store.
///
/// Every mutation of a key happens while holding the write lock of the map
/// shard owning that key, which gives the same per-key atomicity as a
/// server-side script.
pub struct InMemoryStorage {
    entries: DashMap<String, Slot>,
    writes: AtomicU64,
}

impl InMemoryStorage {
    /// Create a new in-memory storage instance.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|slot| slot.is_live(now)).count()
    }

    /// Whether no live keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Must not be called while a reference into the map is held.
    fn before_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            let now = Instant::now();
            self.entries.retain(|_, slot| slot.is_live(now));
        }
    }

    /// Runs `f` on the live slot of `key`, creating it with `init` when absent or expired.
    fn upsert<R>(&self, key: &str, init: impl FnOnce() -> Slot, f: impl FnOnce(&mut Slot) -> R) -> R {
        self.before_write();

        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_live(now) {
                    entry.insert(init());
                }

                f(entry.get_mut())
            }
            Entry::Vacant(entry) => {
                let mut slot = entry.insert(init());
                f(&mut slot)
            }
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::Query(format!("key '{key}' holds a value of another type"))
}

impl CounterStore for InMemoryStorage {
    async fn check_and_record(&self, key: &str, request: &WindowRequest) -> Result<WindowCount, StorageError> {
        self.before_write();

        let now = Instant::now();
        let cutoff = request.cutoff();

        let mut slot = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_live(now) {
                    entry.insert(Slot::new(Value::Window(BTreeSet::new()), request.ttl));
                }
                entry.into_ref()
            }
            Entry::Vacant(entry) => entry.insert(Slot::new(Value::Window(BTreeSet::new()), request.ttl)),
        };

        let Value::Window(samples) = &mut slot.value else {
            return Err(wrong_type(key));
        };

        // Keep only samples with a score strictly above the cutoff.
        *samples = samples.split_off(&(cutoff.saturating_add(1), String::new()));

        let count = samples.len() as u64;

        if count >= u64::from(request.max_requests) {
            return Ok(WindowCount { count, admitted: false });
        }

        samples.insert((request.now_ms, request.member.clone()));
        let count = samples.len() as u64;
        slot.expires_at = now + request.ttl;

        Ok(WindowCount { count, admitted: true })
    }

    async fn count_in_window(&self, key: &str, window_ms: i64, now_ms: i64) -> Result<u64, StorageError> {
        let now = Instant::now();

        let Some(slot) = self.entries.get(key).filter(|slot| slot.is_live(now)) else {
            return Ok(0);
        };

        let Value::Window(samples) = &slot.value else {
            return Err(wrong_type(key));
        };

        let cutoff = now_ms - window_ms;
        let count = samples.range((cutoff.saturating_add(1), String::new())..).count();

        Ok(count as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();

        let Some(slot) = self.entries.get(key).filter(|slot| slot.is_live(now)) else {
            return Ok(None);
        };

        match &slot.value {
            Value::Text(text) => Ok(Some(text.clone())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.before_write();
        self.entries
            .insert(key.to_string(), Slot::new(Value::Text(value.to_string()), ttl));

        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.before_write();

        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return Ok(false);
                }

                entry.insert(Slot::new(Value::Text(value.to_string()), ttl));
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::new(Value::Text(value.to_string()), ttl));
            }
        }

        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut deleted = 0;

        for key in keys {
            if let Some((_, slot)) = self.entries.remove(key)
                && slot.is_live(now)
            {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StorageError> {
        self.upsert(
            key,
            || Slot::new(Value::Text("0".to_string()), ttl),
            |slot| {
                let Value::Text(text) = &mut slot.value else {
                    return Err(wrong_type(key));
                };

                let current: i64 = text
                    .parse()
                    .map_err(|_| StorageError::Query(format!("key '{key}' does not hold an integer")))?;

                let next = current + 1;
                *text = next.to_string();
                slot.expires_at = Instant::now() + ttl;

                Ok(next)
            },
        )
    }

    async fn increment_field(&self, key: &str, field: &str, ttl: Duration) -> Result<i64, StorageError> {
        self.upsert(
            key,
            || Slot::new(Value::Hash(HashMap::new()), ttl),
            |slot| {
                let Value::Hash(fields) = &mut slot.value else {
                    return Err(wrong_type(key));
                };

                let counter = fields.entry(field.to_string()).or_insert(0);
                *counter += 1;
                let next = *counter as i64;
                slot.expires_at = Instant::now() + ttl;

                Ok(next)
            },
        )
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, u64>, StorageError> {
        let now = Instant::now();

        let Some(slot) = self.entries.get(key).filter(|slot| slot.is_live(now)) else {
            return Ok(HashMap::new());
        };

        match &slot.value {
            Value::Hash(fields) => Ok(fields.clone()),
            _ => Err(wrong_type(key)),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let now = Instant::now();

        let keys = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();

        Ok(keys)
    }
}
