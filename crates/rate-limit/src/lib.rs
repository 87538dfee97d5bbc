//! Sliding window rate limiting and abuse alerting for Floodgate.
//!
//! A [`RateLimitGate`] decides whether a request may proceed by checking the
//! sliding windows of its client IP and, depending on the endpoint's scope,
//! its user. Limits come from an [`EndpointLimitResolver`], counters live in
//! a [`CounterStore`], and denials or near-limit requests are handed to an
//! [`AbuseAlertDispatcher`] running in the background.

#![deny(missing_docs)]

mod alert;
mod endpoint;
mod error;
mod gate;
mod limiter;
mod resolver;
mod storage;
mod templates;

pub use alert::{
    AbuseAlertDispatcher, AbuseEvent, AlertClass, AlertMailer, AlertSender, AuditRecord, AuditSink, DailyAbuseStats,
    DailyTotal, Dispatch, EmailMessage, LogAuditSink, MAX_TREND_DAYS, WebhookMailer,
};
pub use endpoint::{WindowScope, normalize_endpoint, window_key};
pub use error::{CheckError, ConfigError, NotificationError, StatsError};
pub use gate::{Decision, RateLimitGate, RateLimitStatus};
pub use limiter::{SlidingWindowLimiter, WindowCheck};
pub use resolver::{EndpointLimitConfig, EndpointLimitResolver, LimitSource, LimitUpdate};
pub use storage::{
    CounterStore, InMemoryStorage, RedisStorage, Storage, StorageError, WindowCount, WindowRequest,
};
pub use templates::{LimitTemplate, template, templates};
