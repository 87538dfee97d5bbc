use std::collections::BTreeMap;

use jiff::civil::Date;
use serde::Serialize;

/// Abuse counters of one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyAbuseStats {
    /// The day the counters belong to.
    pub date: Date,
    /// Exceeded events of the day.
    pub total: u64,
    /// Exceeded events per client IP.
    pub per_ip: BTreeMap<String, u64>,
    /// Exceeded events per endpoint.
    pub per_uri: BTreeMap<String, u64>,
    /// Exceeded events per username.
    pub per_user: BTreeMap<String, u64>,
}

/// Total exceeded events of one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyTotal {
    /// The day.
    pub date: Date,
    /// Exceeded events of the day.
    pub total: u64,
}

pub(super) fn total_key(date: Date) -> String {
    format!("abuse:stats:{date}:total")
}

pub(super) fn ip_key(date: Date) -> String {
    format!("abuse:stats:{date}:ip")
}

pub(super) fn uri_key(date: Date) -> String {
    format!("abuse:stats:{date}:uri")
}

pub(super) fn user_key(date: Date) -> String {
    format!("abuse:stats:{date}:user")
}
