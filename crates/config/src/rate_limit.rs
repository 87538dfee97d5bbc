//! Rate limiting configuration structures.

use std::{collections::BTreeMap, time::Duration};

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::{Deserialize, Serialize};

/// Rate limiting configuration for the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled.
    pub enabled: bool,
    /// Fraction of the limit at which a near-limit warning is raised.
    pub warning_threshold: f64,
    /// Lifetime of a runtime override in the counter store.
    #[serde(deserialize_with = "deserialize_duration")]
    pub override_ttl: Duration,
    /// Storage backend configuration.
    pub storage: StorageConfig,
    /// Limit applied to endpoints without a static or runtime configuration.
    pub default: EndpointLimit,
    /// Static per-endpoint limits, keyed by path.
    pub endpoints: BTreeMap<String, EndpointLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold: 0.8,
            override_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            storage: StorageConfig::default(),
            default: EndpointLimit::default(),
            endpoints: BTreeMap::new(),
        }
    }
}

/// Which identifiers a limit is counted against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    /// Counted per client IP address.
    #[default]
    Ip,
    /// Counted per authenticated user.
    User,
    /// Counted per client IP and, independently, per authenticated user.
    Both,
}

impl LimitScope {
    /// Whether requests with a known user are also counted against the user.
    pub fn includes_user(self) -> bool {
        !matches!(self, LimitScope::Ip)
    }
}

/// A limit for a single endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointLimit {
    /// Maximum number of requests allowed within the window.
    pub max_requests: u32,
    /// Trailing window the requests are counted in.
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    /// Which identifiers the limit applies to.
    #[serde(default)]
    pub scope: LimitScope,
    /// Whether the limit is enforced.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Human readable description.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for EndpointLimit {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            scope: LimitScope::Ip,
            enabled: true,
            description: None,
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (default), only suitable for a single instance.
    #[default]
    Memory,
    /// Redis storage with configuration.
    Redis(Box<RedisConfig>),
}

/// Redis storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL (redis:// or rediss:// for TLS).
    pub url: String,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// TLS configuration.
    pub tls: Option<RedisTlsConfig>,
    /// Key prefix for all keys written by Floodgate.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Response timeout for a single Redis round trip.
    #[serde(default = "default_response_timeout", deserialize_with = "deserialize_duration")]
    pub response_timeout: Duration,
}

fn default_key_prefix() -> String {
    "floodgate:".to_string()
}

fn default_response_timeout() -> Duration {
    Duration::from_millis(250)
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: Option<usize>,
    /// Timeout for creating connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Timeout for waiting for a connection.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout before recycling idle connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(1)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}

/// Redis TLS configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisTlsConfig {
    /// Path to CA certificate file.
    pub ca_cert_path: Option<String>,
    /// Path to client certificate file (for mutual TLS).
    pub client_cert_path: Option<String>,
    /// Path to client key file (for mutual TLS).
    pub client_key_path: Option<String>,
}
