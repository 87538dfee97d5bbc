//! Redis counter store, shared between every instance pointing at the same server.

use std::{
    collections::HashMap,
    future::Future,
    sync::LazyLock,
    time::Duration,
};

use deadpool::managed::Object;
use redis::{RedisResult, Script};

use super::{
    CounterStore, StorageError, WindowCount, WindowRequest,
    redis_pool::{self, Manager, Pool},
};
use config::RedisConfig;

/// Evicts samples at or below the cutoff, then records the request when the
/// window has room. Returns the count and whether the request was recorded.
static CHECK_AND_RECORD: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local max = tonumber(ARGV[3])

        redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

        local count = redis.call('ZCARD', key)
        if count >= max then
            return {count, 0}
        end

        redis.call('ZADD', key, now, ARGV[4])
        redis.call('EXPIRE', key, tonumber(ARGV[5]))

        return {redis.call('ZCARD', key), 1}
        ",
    )
});

const SCAN_BATCH: usize = 256;

/// Redis-based counter store.
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
    response_timeout: Duration,
}

impl RedisStorage {
    /// Creates the connection pool and verifies the server answers.
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = redis_pool::create_pool(config)
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        let storage = Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            response_timeout: config.response_timeout,
        };

        let mut conn = storage.connection().await?;

        storage
            .timed(redis::cmd("PING").query_async::<String>(&mut *conn))
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

        Ok(storage)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    async fn connection(&self) -> Result<Object<Manager>, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn timed<T>(&self, command: impl Future<Output = RedisResult<T>>) -> Result<T, StorageError> {
        match tokio::time::timeout(self.response_timeout, command).await {
            Ok(result) => result.map_err(|e| StorageError::Query(e.to_string())),
            Err(_) => Err(StorageError::Timeout(self.response_timeout)),
        }
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Escapes glob metacharacters for a SCAN MATCH pattern.
fn escape_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

impl CounterStore for RedisStorage {
    async fn check_and_record(&self, key: &str, request: &WindowRequest) -> Result<WindowCount, StorageError> {
        let mut conn = self.connection().await?;

        let mut invocation = CHECK_AND_RECORD.key(self.key(key));
        invocation
            .arg(request.now_ms)
            .arg(request.window_ms)
            .arg(request.max_requests)
            .arg(&request.member)
            .arg(ttl_seconds(request.ttl));

        let (count, admitted) = self
            .timed(invocation.invoke_async::<(u64, u8)>(&mut *conn))
            .await?;

        Ok(WindowCount {
            count,
            admitted: admitted == 1,
        })
    }

    async fn count_in_window(&self, key: &str, window_ms: i64, now_ms: i64) -> Result<u64, StorageError> {
        let mut conn = self.connection().await?;
        let cutoff = now_ms - window_ms;

        self.timed(
            redis::cmd("ZCOUNT")
                .arg(self.key(key))
                .arg(format!("({cutoff}"))
                .arg("+inf")
                .query_async::<u64>(&mut *conn),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection().await?;

        self.timed(redis::cmd("GET").arg(self.key(key)).query_async(&mut *conn))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;

        self.timed(
            redis::cmd("SET")
                .arg(self.key(key))
                .arg(value)
                .arg("EX")
                .arg(ttl_seconds(ttl))
                .query_async::<()>(&mut *conn),
        )
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;

        let reply = self
            .timed(
                redis::cmd("SET")
                    .arg(self.key(key))
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_seconds(ttl))
                    .query_async::<Option<String>>(&mut *conn),
            )
            .await?;

        Ok(reply.is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        let keys: Vec<String> = keys.iter().map(|key| self.key(key)).collect();

        self.timed(redis::cmd("DEL").arg(keys).query_async::<u64>(&mut *conn))
            .await
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StorageError> {
        let mut conn = self.connection().await?;
        let key = self.key(key);

        let (value,) = self
            .timed(
                redis::pipe()
                    .atomic()
                    .cmd("INCR")
                    .arg(&key)
                    .cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl_seconds(ttl))
                    .ignore()
                    .query_async::<(i64,)>(&mut *conn),
            )
            .await?;

        Ok(value)
    }

    async fn increment_field(&self, key: &str, field: &str, ttl: Duration) -> Result<i64, StorageError> {
        let mut conn = self.connection().await?;
        let key = self.key(key);

        let (value,) = self
            .timed(
                redis::pipe()
                    .atomic()
                    .cmd("HINCRBY")
                    .arg(&key)
                    .arg(field)
                    .arg(1)
                    .cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl_seconds(ttl))
                    .ignore()
                    .query_async::<(i64,)>(&mut *conn),
            )
            .await?;

        Ok(value)
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, u64>, StorageError> {
        let mut conn = self.connection().await?;

        self.timed(redis::cmd("HGETALL").arg(self.key(key)).query_async(&mut *conn))
            .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", escape_pattern(&self.key(prefix)));

        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, batch) = self
                .timed(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async::<(u64, Vec<String>)>(&mut *conn),
                )
                .await?;

            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&self.key_prefix).map(str::to_string)),
            );

            if next == 0 {
                break;
            }

            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();

        Ok(keys)
    }
}
