//! Abuse alerting configuration structures.

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;
use url::Url;

/// Abuse alerting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertConfig {
    /// Whether exceeded and warning events are dispatched at all.
    pub enabled: bool,
    /// Minimum interval between two identical exceeded alerts. Warnings use half of it.
    #[serde(deserialize_with = "deserialize_duration")]
    pub cooldown: Duration,
    /// Capacity of the queue between the request path and the alert worker.
    pub queue_capacity: usize,
    /// How long daily abuse statistics are kept.
    #[serde(deserialize_with = "deserialize_duration")]
    pub stats_retention: Duration,
    /// Email notification settings. No email is sent when absent.
    pub email: Option<EmailConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: Duration::from_secs(600),
            queue_capacity: 1024,
            stats_retention: Duration::from_secs(30 * 24 * 60 * 60),
            email: None,
        }
    }
}

impl AlertConfig {
    /// Cooldown applied to near-limit warnings.
    pub fn warning_cooldown(&self) -> Duration {
        self.cooldown / 2
    }
}

/// Email notification settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    /// Who receives exceeded alerts.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Mail relay endpoint accepting `{recipients, subject, body}` JSON.
    pub webhook_url: Url,
    /// Timeout of a single delivery attempt.
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Prefix added to every subject line.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_subject_prefix() -> String {
    "[floodgate]".to_string()
}
