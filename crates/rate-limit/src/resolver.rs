//! Resolution of the limit that applies to an endpoint.
//!
//! Runtime overrides persisted in the counter store take precedence over the
//! static limits from configuration, which take precedence over the limits
//! compiled into the binary. Endpoints matching none of them get the global
//! default limit.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use config::{EndpointLimit, LimitScope, RateLimitConfig};
use dashmap::{DashMap, mapref::entry::Entry};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    endpoint::normalize_endpoint,
    error::ConfigError,
    storage::{CounterStore, StorageError},
    templates::{self, BUILTIN_LIMITS, LimitTemplate},
};

const OVERRIDE_PREFIX: &str = "limit:override:";

/// Where a resolved limit comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitSource {
    /// Compiled-in or configured limit.
    Static,
    /// Runtime override.
    Override,
}

/// The effective limit of one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointLimitConfig {
    /// Normalized endpoint the limit applies to.
    pub endpoint_pattern: String,
    /// Maximum number of requests in the window, always positive.
    pub max_requests: u32,
    /// Window width in seconds, always positive.
    pub window_seconds: u64,
    /// Identifiers the limit applies to.
    pub scope: LimitScope,
    /// Whether the limit is enforced.
    pub enabled: bool,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Where the limit comes from.
    pub source: LimitSource,
    /// When an override was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl EndpointLimitConfig {
    fn from_static(endpoint: &str, limit: &EndpointLimit) -> Self {
        Self {
            endpoint_pattern: endpoint.to_string(),
            max_requests: limit.max_requests,
            window_seconds: limit.window.as_secs(),
            scope: limit.scope,
            enabled: limit.enabled,
            description: limit.description.clone(),
            source: LimitSource::Static,
            updated_at: None,
        }
    }

    fn from_template(endpoint: &str, template: &LimitTemplate) -> Self {
        Self {
            endpoint_pattern: endpoint.to_string(),
            max_requests: template.max_requests,
            window_seconds: template.window_seconds,
            scope: template.scope,
            enabled: true,
            description: Some(template.description.to_string()),
            source: LimitSource::Static,
            updated_at: None,
        }
    }
}

/// A runtime change to the limit of an endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitUpdate {
    /// Maximum number of requests in the window.
    pub max_requests: u32,
    /// Window width in seconds.
    pub window_seconds: u64,
    /// Identifiers the limit applies to.
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

impl LimitUpdate {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidMaxRequests);
        }

        if self.window_seconds == 0 {
            return Err(ConfigError::InvalidWindow);
        }

        Ok(())
    }
}

impl From<&LimitTemplate> for LimitUpdate {
    fn from(template: &LimitTemplate) -> Self {
        Self {
            max_requests: template.max_requests,
            window_seconds: template.window_seconds,
            scope: template.scope,
            enabled: true,
            description: Some(template.description.to_string()),
        }
    }
}

/// A cached view of the override layer for one endpoint.
#[derive(Clone)]
struct CachedOverride {
    /// `None` when the endpoint has no override.
    config: Option<Arc<EndpointLimitConfig>>,
    /// When the persisted override expires, `None` for absent overrides.
    expires_at: Option<Instant>,
    /// Write generation of the resolver when the entry was produced.
    generation: u64,
}

impl CachedOverride {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Resolves endpoint limits through the override, static and default layers.
///
/// Overrides are cached in process until their persisted copy expires. The
/// absence of an override is only cached for endpoints with a static limit,
/// so arbitrary request paths never grow the cache. Overrides written by
/// other instances to endpoints already cached here become visible through
/// [`Self::reload_all`].
pub struct EndpointLimitResolver<S> {
    store: Arc<S>,
    cache: DashMap<String, CachedOverride>,
    /// Bumped by every local write, so a reload never replaces a newer entry.
    generation: AtomicU64,
    statics: BTreeMap<String, Arc<EndpointLimitConfig>>,
    default: EndpointLimit,
    override_ttl: Duration,
}

impl<S: CounterStore> EndpointLimitResolver<S> {
    /// Creates a resolver seeded with the built-in and configured static limits.
    pub fn new(store: Arc<S>, config: &RateLimitConfig) -> Self {
        let mut statics = BTreeMap::new();

        for (endpoint, name) in BUILTIN_LIMITS {
            if let Some(template) = templates::template(name) {
                let config = EndpointLimitConfig::from_template(endpoint, template);
                statics.insert(endpoint.to_string(), Arc::new(config));
            }
        }

        for (endpoint, limit) in &config.endpoints {
            let endpoint = normalize_endpoint(endpoint);
            let config = EndpointLimitConfig::from_static(&endpoint, limit);

            statics.insert(endpoint, Arc::new(config));
        }

        Self {
            store,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
            statics,
            default: config.default.clone(),
            override_ttl: config.override_ttl,
        }
    }

    /// The limit that applies to `endpoint`. Never fails.
    ///
    /// A store failure while loading an override falls back to the static
    /// layer without caching, so the next call tries the store again.
    pub async fn get(&self, endpoint: &str) -> Arc<EndpointLimitConfig> {
        let endpoint = normalize_endpoint(endpoint);
        let now = Instant::now();

        let cached = self.cache.get(&endpoint).map(|entry| entry.value().clone());

        match cached {
            Some(cached) if !cached.is_expired(now) => {
                return cached.config.unwrap_or_else(|| self.static_limit(&endpoint));
            }
            Some(_) => {
                self.cache.remove_if(&endpoint, |_, cached| cached.is_expired(now));
            }
            None => (),
        }

        let generation = self.generation.load(Ordering::Acquire);

        match self.load_override(&endpoint).await {
            Ok(Some(config)) => {
                let loaded = CachedOverride {
                    expires_at: Some(self.expires_at(&config, now)),
                    config: Some(config),
                    generation,
                };

                // A concurrent update may have landed while loading, it wins.
                let entry = self.cache.entry(endpoint.clone()).or_insert(loaded).value().clone();
                entry.config.unwrap_or_else(|| self.static_limit(&endpoint))
            }
            Ok(None) => {
                if self.statics.contains_key(&endpoint) {
                    let absent = CachedOverride {
                        config: None,
                        expires_at: None,
                        generation,
                    };

                    let entry = self.cache.entry(endpoint.clone()).or_insert(absent).value().clone();

                    if let Some(config) = entry.config {
                        return config;
                    }
                }

                self.static_limit(&endpoint)
            }
            Err(e) => {
                log::warn!("Failed to load limit override for {endpoint}, using static limit: {e}");
                self.static_limit(&endpoint)
            }
        }
    }

    /// Persists an override for `endpoint` and makes it effective immediately.
    pub async fn update(&self, endpoint: &str, update: LimitUpdate) -> Result<Arc<EndpointLimitConfig>, ConfigError> {
        update.validate()?;

        let endpoint = normalize_endpoint(endpoint);

        if endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }

        let config = EndpointLimitConfig {
            endpoint_pattern: endpoint.clone(),
            max_requests: update.max_requests,
            window_seconds: update.window_seconds,
            scope: update.scope,
            enabled: update.enabled,
            description: update.description,
            source: LimitSource::Override,
            updated_at: Some(Timestamp::now()),
        };

        let json = serde_json::to_string(&config).map_err(|e| StorageError::Serialization(e.to_string()))?;

        self.store
            .set(&override_key(&endpoint), &json, self.override_ttl)
            .await?;

        let config = Arc::new(config);

        let cached = CachedOverride {
            config: Some(config.clone()),
            expires_at: Some(Instant::now() + self.override_ttl),
            generation: self.next_generation(),
        };

        self.cache.insert(endpoint.clone(), cached);

        log::info!(
            "Limit override for {endpoint} set to {} requests per {}s ({:?})",
            config.max_requests,
            config.window_seconds,
            config.scope
        );

        Ok(config)
    }

    /// Deletes the override of `endpoint`, returning whether one existed.
    pub async fn remove(&self, endpoint: &str) -> Result<bool, ConfigError> {
        let endpoint = normalize_endpoint(endpoint);

        if endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }

        let deleted = self.store.delete(&[override_key(&endpoint)]).await?;

        let cached = CachedOverride {
            config: None,
            expires_at: None,
            generation: self.next_generation(),
        };

        self.cache.insert(endpoint.clone(), cached);

        log::info!("Limit override for {endpoint} removed");

        Ok(deleted > 0)
    }

    /// Replaces the cached overrides with the ones currently persisted.
    ///
    /// Readers keep seeing either the old or the new entry for every endpoint.
    /// Entries written by [`Self::update`] or [`Self::remove`] while the reload
    /// reads the store are kept. On a store failure the cache is left untouched.
    pub async fn reload_all(&self) -> Result<usize, ConfigError> {
        let (started_at, fresh) = self.read_overrides().await?;
        let loaded = self.apply_reload(started_at, fresh);

        log::info!("Reloaded {loaded} limit overrides");

        Ok(loaded)
    }

    async fn read_overrides(&self) -> Result<(u64, HashMap<String, Arc<EndpointLimitConfig>>), ConfigError> {
        let started_at = self.generation.load(Ordering::Acquire);

        let keys = self.store.keys_with_prefix(OVERRIDE_PREFIX).await?;
        let mut fresh = HashMap::with_capacity(keys.len());

        for key in keys {
            let Some(endpoint) = key.strip_prefix(OVERRIDE_PREFIX) else {
                continue;
            };

            let Some(json) = self.store.get(&key).await? else {
                continue;
            };

            match serde_json::from_str::<EndpointLimitConfig>(&json) {
                Ok(config) => {
                    fresh.insert(endpoint.to_string(), Arc::new(config));
                }
                Err(e) => log::warn!("Skipping unreadable limit override for {endpoint}: {e}"),
            }
        }

        Ok((started_at, fresh))
    }

    fn apply_reload(&self, started_at: u64, fresh: HashMap<String, Arc<EndpointLimitConfig>>) -> usize {
        let now = Instant::now();

        for (endpoint, config) in &fresh {
            let reloaded = CachedOverride {
                config: Some(config.clone()),
                expires_at: Some(self.expires_at(config, now)),
                generation: started_at,
            };

            match self.cache.entry(endpoint.clone()) {
                Entry::Occupied(mut entry) => {
                    if entry.get().generation <= started_at {
                        entry.insert(reloaded);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(reloaded);
                }
            }
        }

        self.cache
            .retain(|endpoint, cached| cached.generation > started_at || fresh.contains_key(endpoint));

        fresh.len()
    }

    /// The template catalog.
    pub fn templates(&self) -> &'static [LimitTemplate] {
        templates::templates()
    }

    /// Writes the template `name` as the override of `endpoint`.
    pub async fn apply_template(&self, name: &str, endpoint: &str) -> Result<Arc<EndpointLimitConfig>, ConfigError> {
        let template = templates::template(name).ok_or_else(|| ConfigError::UnknownTemplate(name.to_string()))?;

        self.update(endpoint, LimitUpdate::from(template)).await
    }

    async fn load_override(&self, endpoint: &str) -> Result<Option<Arc<EndpointLimitConfig>>, StorageError> {
        let Some(json) = self.store.get(&override_key(endpoint)).await? else {
            return Ok(None);
        };

        let config: EndpointLimitConfig =
            serde_json::from_str(&json).map_err(|e| StorageError::Serialization(e.to_string()))?;

        Ok(Some(Arc::new(config)))
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// When a persisted override expires in the store, measured from its write time.
    fn expires_at(&self, config: &EndpointLimitConfig, now: Instant) -> Instant {
        let age = config
            .updated_at
            .and_then(|updated_at| Duration::try_from(Timestamp::now().duration_since(updated_at)).ok())
            .unwrap_or_default();

        now + self.override_ttl.saturating_sub(age)
    }

    fn static_limit(&self, endpoint: &str) -> Arc<EndpointLimitConfig> {
        match self.statics.get(endpoint) {
            Some(config) => config.clone(),
            None => Arc::new(EndpointLimitConfig::from_static(endpoint, &self.default)),
        }
    }
}

fn override_key(endpoint: &str) -> String {
    format!("{OVERRIDE_PREFIX}{endpoint}")
}
