//! Metric names recorded by Floodgate.

/// Admission decisions, with `decision` (allowed, denied, warned) and `scope` attributes
pub const RATE_LIMIT_DECISIONS: &str = "rate_limit.decisions";

/// Counter store failures that caused a fail-open admission, with `operation` and `kind` attributes
pub const RATE_LIMIT_STORE_FAULTS: &str = "rate_limit.store.faults";

/// Duration of a complete admission check in milliseconds, with a `windows` attribute (1 or 2)
pub const RATE_LIMIT_CHECK_DURATION: &str = "rate_limit.check.duration";

/// Abuse events fully processed by the alert worker, with a `class` attribute
pub const RATE_LIMIT_ALERTS_DISPATCHED: &str = "rate_limit.alerts.dispatched";

/// Abuse events suppressed by an active cooldown, with a `class` attribute
pub const RATE_LIMIT_ALERTS_SUPPRESSED: &str = "rate_limit.alerts.suppressed";

/// Abuse events dropped because the alert queue was full or closed, with a `class` attribute
pub const RATE_LIMIT_ALERTS_DROPPED: &str = "rate_limit.alerts.dropped";

