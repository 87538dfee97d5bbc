//! Admission decisions for single requests.

use std::sync::Arc;

use config::RateLimitConfig;
use jiff::Timestamp;
use opentelemetry::{KeyValue, metrics::Counter};
use serde::Serialize;
use telemetry::metrics::{RATE_LIMIT_CHECK_DURATION, RATE_LIMIT_DECISIONS, RATE_LIMIT_STORE_FAULTS, Recorder};

use crate::{
    alert::{AbuseEvent, AlertClass, AlertSender},
    endpoint::{WindowScope, normalize_endpoint, window_key},
    error::CheckError,
    limiter::{SlidingWindowLimiter, WindowCheck},
    resolver::EndpointLimitResolver,
    storage::CounterStore,
};

/// The admission decision for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Whether a limit was actually evaluated. False when limiting is
    /// disabled or the request was admitted because of an internal fault.
    pub enforced: bool,
    /// Normalized endpoint.
    pub endpoint: String,
    /// Limit of the endpoint.
    pub limit: u32,
    /// Requests in the IP window.
    pub ip_count: u64,
    /// Requests in the user window, when it was evaluated.
    pub user_count: Option<u64>,
    /// Requests left in the fullest window.
    pub remaining: u64,
}

impl Decision {
    fn unenforced(endpoint: String) -> Self {
        Self {
            allowed: true,
            enforced: false,
            endpoint,
            limit: 0,
            ip_count: 0,
            user_count: None,
            remaining: 0,
        }
    }
}

/// Read-only view of the windows of one client on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Normalized endpoint.
    pub endpoint: String,
    /// Whether the limit of the endpoint is enforced.
    pub enabled: bool,
    /// Limit of the endpoint.
    pub max_requests: u32,
    /// Window width in seconds.
    pub window_seconds: u64,
    /// Requests in the IP window.
    pub ip_count: u64,
    /// Requests in the user window, when the limit applies to users.
    pub user_count: Option<u64>,
    /// Requests left in the fullest window.
    pub remaining: u64,
}

/// Combines the IP and user windows of a request into one admission decision.
///
/// Store failures never deny a request. They are logged, counted and
/// resolved to an admission.
pub struct RateLimitGate<S> {
    enabled: bool,
    warning_threshold: f64,
    limiter: SlidingWindowLimiter<S>,
    resolver: Arc<EndpointLimitResolver<S>>,
    alerts: AlertSender,
    decisions: Counter<u64>,
    faults: Counter<u64>,
}

impl<S: CounterStore> RateLimitGate<S> {
    /// Creates a gate over the given store, resolver and alert queue.
    pub fn new(
        config: &RateLimitConfig,
        store: Arc<S>,
        resolver: Arc<EndpointLimitResolver<S>>,
        alerts: AlertSender,
    ) -> Self {
        let meter = telemetry::metrics::meter();

        Self {
            enabled: config.enabled,
            warning_threshold: config.warning_threshold,
            limiter: SlidingWindowLimiter::new(store),
            resolver,
            alerts,
            decisions: meter.u64_counter(RATE_LIMIT_DECISIONS).build(),
            faults: meter.u64_counter(RATE_LIMIT_STORE_FAULTS).build(),
        }
    }

    /// The resolver used for limit lookups.
    pub fn resolver(&self) -> &Arc<EndpointLimitResolver<S>> {
        &self.resolver
    }

    /// Whether the request may proceed.
    pub async fn is_allowed(&self, client_ip: &str, endpoint: &str, username: Option<&str>) -> bool {
        self.evaluate(client_ip, endpoint, username).await.allowed
    }

    /// Evaluates and records one request.
    pub async fn evaluate(&self, client_ip: &str, endpoint: &str, username: Option<&str>) -> Decision {
        let endpoint = normalize_endpoint(endpoint);

        if !self.enabled {
            return Decision::unenforced(endpoint);
        }

        let config = self.resolver.get(&endpoint).await;

        if !config.enabled {
            return Decision::unenforced(endpoint);
        }

        let username = username.filter(|name| !name.is_empty());
        let now_ms = Timestamp::now().as_millisecond();

        let mut recorder = Recorder::new(RATE_LIMIT_CHECK_DURATION);

        let ip_key = window_key(WindowScope::Ip, client_ip, &endpoint);

        let ip = match self
            .limiter
            .check(&ip_key, config.window_seconds, config.max_requests, now_ms)
            .await
        {
            Ok(check) => check,
            Err(e) => return self.fail_open(endpoint, e),
        };

        // A request denied on its IP is not counted against the user.
        let user = match username.filter(|_| ip.admitted && config.scope.includes_user()) {
            Some(username) => {
                let user_key = window_key(WindowScope::User, username, &endpoint);

                match self
                    .limiter
                    .check(&user_key, config.window_seconds, config.max_requests, now_ms)
                    .await
                {
                    Ok(check) => Some(check),
                    Err(e) => return self.fail_open(endpoint, e),
                }
            }
            None => None,
        };

        let (key, value) = duration_attribute(user.is_some());
        recorder.push_attribute(key, value);
        recorder.record();

        let allowed = ip.admitted && user.is_none_or(|check| check.admitted);

        // The window that decides the outcome: the denying one, or the fuller one.
        let (scope, tripped) = match user {
            Some(user) if !user.admitted || user.count > ip.count => (WindowScope::User, user),
            _ => (WindowScope::Ip, ip),
        };

        let class = if !allowed {
            Some(AlertClass::Exceeded)
        } else if near_limit(&tripped, self.warning_threshold) {
            Some(AlertClass::Warning)
        } else {
            None
        };

        if let Some(class) = class {
            self.alerts.try_send(AbuseEvent {
                class,
                client_ip: client_ip.to_string(),
                username: username.map(str::to_string),
                endpoint: endpoint.clone(),
                scope,
                count: tripped.count,
                limit: tripped.limit,
                occurred_at: Timestamp::now(),
            });
        }

        let outcome = match class {
            Some(AlertClass::Exceeded) => "denied",
            Some(AlertClass::Warning) => "warned",
            None => "allowed",
        };

        self.decisions.add(
            1,
            &[
                KeyValue::new("decision", outcome),
                KeyValue::new("scope", scope.as_str()),
            ],
        );

        if !allowed {
            log::debug!(
                "Rate limit exceeded on {endpoint} for {} ({} of {})",
                if scope == WindowScope::User {
                    username.unwrap_or(client_ip)
                } else {
                    client_ip
                },
                tripped.count,
                tripped.limit
            );
        }

        Decision {
            allowed,
            enforced: true,
            limit: config.max_requests,
            ip_count: ip.count,
            user_count: user.map(|check| check.count),
            remaining: tripped.remaining().min(ip.remaining()),
            endpoint,
        }
    }

    /// Reads the windows of a client without recording anything.
    pub async fn status(
        &self,
        client_ip: &str,
        endpoint: &str,
        username: Option<&str>,
    ) -> Result<RateLimitStatus, CheckError> {
        let endpoint = normalize_endpoint(endpoint);
        let config = self.resolver.get(&endpoint).await;
        let now_ms = Timestamp::now().as_millisecond();

        let ip_count = self
            .limiter
            .peek(&window_key(WindowScope::Ip, client_ip, &endpoint), config.window_seconds, now_ms)
            .await?;

        let user_count = match username.filter(|name| !name.is_empty() && config.scope.includes_user()) {
            Some(username) => Some(
                self.limiter
                    .peek(
                        &window_key(WindowScope::User, username, &endpoint),
                        config.window_seconds,
                        now_ms,
                    )
                    .await?,
            ),
            None => None,
        };

        let fullest = ip_count.max(user_count.unwrap_or(0));

        Ok(RateLimitStatus {
            enabled: self.enabled && config.enabled,
            max_requests: config.max_requests,
            window_seconds: config.window_seconds,
            ip_count,
            user_count,
            remaining: u64::from(config.max_requests).saturating_sub(fullest),
            endpoint,
        })
    }

    /// Deletes the IP window and, when a username is given, the user window.
    pub async fn clear(&self, client_ip: &str, endpoint: &str, username: Option<&str>) -> Result<u64, CheckError> {
        let endpoint = normalize_endpoint(endpoint);
        let mut keys = vec![window_key(WindowScope::Ip, client_ip, &endpoint)];

        if let Some(username) = username.filter(|name| !name.is_empty()) {
            keys.push(window_key(WindowScope::User, username, &endpoint));
        }

        let deleted = self.limiter.reset(&keys).await?;

        log::info!("Cleared {deleted} rate limit windows on {endpoint} for {client_ip}");

        Ok(deleted)
    }

    fn fail_open(&self, endpoint: String, error: CheckError) -> Decision {
        let kind = match &error {
            CheckError::Storage(e) => e.kind(),
            CheckError::InvalidWindow => "invalid_window",
        };

        log::warn!("Rate limit check on {endpoint} failed, admitting the request: {error}");

        self.faults
            .add(1, &[KeyValue::new("operation", "check"), KeyValue::new("kind", kind)]);

        Decision::unenforced(endpoint)
    }
}

fn near_limit(check: &WindowCheck, threshold: f64) -> bool {
    check.limit > 0 && check.count as f64 / f64::from(check.limit) >= threshold
}

/// The only attribute of the check duration histogram. Endpoints are client
/// controlled and never become attributes.
fn duration_attribute(user_checked: bool) -> (&'static str, i64) {
    ("windows", if user_checked { 2 } else { 1 })
}
