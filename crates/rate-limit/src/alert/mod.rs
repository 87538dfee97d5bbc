//! Abuse alerting: deduplication, daily statistics, audit records and email.
//!
//! The request path only enqueues [`AbuseEvent`]s through an [`AlertSender`].
//! A background worker owned by [`AbuseAlertDispatcher`] drains the queue.
//! Every failure in here is logged and swallowed.

mod audit;
mod email;
mod stats;

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use config::AlertConfig;
use jiff::{Span, Timestamp, civil::Date, tz::TimeZone};
use opentelemetry::{KeyValue, metrics::Counter};
use serde::Serialize;
use telemetry::metrics::{RATE_LIMIT_ALERTS_DISPATCHED, RATE_LIMIT_ALERTS_DROPPED, RATE_LIMIT_ALERTS_SUPPRESSED};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

pub use self::audit::{AuditRecord, AuditSink, LogAuditSink};
pub use self::email::{AlertMailer, EmailMessage, WebhookMailer};
pub use self::stats::{DailyAbuseStats, DailyTotal};

use crate::{
    endpoint::WindowScope,
    error::{NotificationError, StatsError},
    storage::{CounterStore, StorageError},
};

/// Longest trend that can be requested, in days.
pub const MAX_TREND_DAYS: usize = 366;

/// Kind of abuse event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertClass {
    /// A request was denied.
    Exceeded,
    /// A request was admitted close to the limit.
    Warning,
}

impl AlertClass {
    /// Label used in keys and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            AlertClass::Exceeded => "exceeded",
            AlertClass::Warning => "warning",
        }
    }
}

impl fmt::Display for AlertClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A denied or near-limit request.
#[derive(Debug, Clone, PartialEq)]
pub struct AbuseEvent {
    /// Kind of event.
    pub class: AlertClass,
    /// Client IP of the request.
    pub client_ip: String,
    /// Authenticated user of the request, if any.
    pub username: Option<String>,
    /// Normalized endpoint.
    pub endpoint: String,
    /// The window that tripped.
    pub scope: WindowScope,
    /// Requests in the tripped window.
    pub count: u64,
    /// Limit of the tripped window.
    pub limit: u32,
    /// When the request was evaluated.
    pub occurred_at: Timestamp,
}

impl AbuseEvent {
    /// The identifier the event is deduplicated on.
    pub fn identifier(&self) -> &str {
        match (self.scope, &self.username) {
            (WindowScope::User, Some(username)) => username,
            _ => &self.client_ip,
        }
    }

    /// Observed usage relative to the limit.
    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }

        self.count as f64 / f64::from(self.limit)
    }

    fn suppression_key(&self) -> String {
        format!("alert:{}:{}:{}", self.class, self.identifier(), self.endpoint)
    }
}

/// Non-blocking handle used by the request path to hand events to the alert worker.
#[derive(Clone, Default)]
pub struct AlertSender {
    queue: Option<AlertQueue>,
}

#[derive(Clone)]
struct AlertQueue {
    sender: mpsc::Sender<AbuseEvent>,
    dropped: Counter<u64>,
}

impl AlertSender {
    /// A sender that discards every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A sender feeding an existing channel.
    pub fn from_channel(sender: mpsc::Sender<AbuseEvent>) -> Self {
        let dropped = telemetry::metrics::meter().u64_counter(RATE_LIMIT_ALERTS_DROPPED).build();

        Self {
            queue: Some(AlertQueue { sender, dropped }),
        }
    }

    /// Enqueues an event without waiting. Returns whether the event was queued.
    pub fn try_send(&self, event: AbuseEvent) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };

        let class = event.class;

        match queue.sender.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Full(event)) => {
                log::warn!(
                    "Alert queue is full, dropping {} event for {} on {}",
                    event.class,
                    event.identifier(),
                    event.endpoint
                );
            }
            Err(TrySendError::Closed(_)) => {
                log::warn!("Alert worker is gone, dropping {class} event");
            }
        }

        queue.dropped.add(1, &[KeyValue::new("class", class.as_str())]);

        false
    }
}

/// What happened to a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The event was processed.
    Sent,
    /// An identical event was processed within the cooldown.
    Suppressed,
    /// The suppression state could not be read, the event was discarded.
    Dropped,
}

/// Deduplicates abuse events and turns them into statistics, audit records and email.
pub struct AbuseAlertDispatcher<S> {
    store: Arc<S>,
    cooldown: Duration,
    warning_cooldown: Duration,
    retention: Duration,
    recipients: Vec<String>,
    subject_prefix: String,
    mailer: Option<Arc<dyn AlertMailer>>,
    audit: Arc<dyn AuditSink>,
    dispatched: Counter<u64>,
    suppressed: Counter<u64>,
}

impl<S: CounterStore> AbuseAlertDispatcher<S> {
    /// Creates a dispatcher, with a webhook mailer when email is configured.
    pub fn new(store: Arc<S>, config: &AlertConfig) -> Result<Self, NotificationError> {
        let meter = telemetry::metrics::meter();

        let mut dispatcher = Self {
            store,
            cooldown: config.cooldown,
            warning_cooldown: config.warning_cooldown(),
            retention: config.stats_retention,
            recipients: Vec::new(),
            subject_prefix: String::new(),
            mailer: None,
            audit: Arc::new(LogAuditSink),
            dispatched: meter.u64_counter(RATE_LIMIT_ALERTS_DISPATCHED).build(),
            suppressed: meter.u64_counter(RATE_LIMIT_ALERTS_SUPPRESSED).build(),
        };

        if let Some(email) = &config.email {
            let mailer = WebhookMailer::new(email.webhook_url.clone(), email.timeout)?;

            dispatcher.subject_prefix = email.subject_prefix.clone();
            dispatcher = dispatcher.with_mailer(Arc::new(mailer), email.recipients.clone());
        }

        Ok(dispatcher)
    }

    /// Replaces the mailer and its recipients.
    pub fn with_mailer(mut self, mailer: Arc<dyn AlertMailer>, recipients: Vec<String>) -> Self {
        self.mailer = Some(mailer);
        self.recipients = recipients;
        self
    }

    /// Replaces the audit sink.
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Starts the background worker, returning the sender feeding it.
    ///
    /// The worker stops once every sender is dropped.
    pub fn spawn(self: Arc<Self>, capacity: usize) -> (AlertSender, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<AbuseEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                self.dispatch(&event).await;
            }

            log::debug!("Alert worker stopped");
        });

        (AlertSender::from_channel(sender), handle)
    }

    /// Processes one event unless an identical one is still cooling down.
    pub async fn dispatch(&self, event: &AbuseEvent) -> Dispatch {
        let cooldown = match event.class {
            AlertClass::Exceeded => self.cooldown,
            AlertClass::Warning => self.warning_cooldown,
        };

        match self.store.set_if_absent(&event.suppression_key(), "1", cooldown).await {
            Ok(true) => (),
            Ok(false) => {
                log::debug!(
                    "Suppressing {} alert for {} on {}",
                    event.class,
                    event.identifier(),
                    event.endpoint
                );
                self.suppressed.add(1, &[KeyValue::new("class", event.class.as_str())]);

                return Dispatch::Suppressed;
            }
            Err(e) => {
                log::warn!("Failed to check alert suppression, dropping {} event: {e}", event.class);
                return Dispatch::Dropped;
            }
        }

        match event.class {
            AlertClass::Exceeded => {
                if let Err(e) = self.record_stats(event).await {
                    log::warn!("Failed to record abuse statistics: {e}");
                }

                self.notify(event).await;
                self.audit(event, "suspicious-activity", "Rate limit exceeded").await;
            }
            AlertClass::Warning => {
                self.audit(event, "rate-limit-warning", "Approaching rate limit").await;
            }
        }

        self.dispatched.add(1, &[KeyValue::new("class", event.class.as_str())]);

        Dispatch::Sent
    }

    /// Abuse counters of one UTC day.
    pub async fn stats_for_date(&self, date: Date) -> Result<DailyAbuseStats, StorageError> {
        let total = self.total_for(date).await?;
        let per_ip = self.store.fields(&stats::ip_key(date)).await?;
        let per_uri = self.store.fields(&stats::uri_key(date)).await?;
        let per_user = self.store.fields(&stats::user_key(date)).await?;

        Ok(DailyAbuseStats {
            date,
            total,
            per_ip: per_ip.into_iter().collect::<BTreeMap<_, _>>(),
            per_uri: per_uri.into_iter().collect(),
            per_user: per_user.into_iter().collect(),
        })
    }

    /// Daily totals of the last `days` UTC days, oldest first, today last.
    ///
    /// Days without data report zero. `days` must be within `1..=`[`MAX_TREND_DAYS`].
    pub async fn trend(&self, days: usize) -> Result<Vec<DailyTotal>, StatsError> {
        if days == 0 || days > MAX_TREND_DAYS {
            return Err(StatsError::InvalidTrendDays { max: MAX_TREND_DAYS });
        }

        let today = today();
        let mut trend = Vec::with_capacity(days);

        for offset in (0..days as i64).rev() {
            let date = today.saturating_sub(Span::new().days(offset));
            let total = self.total_for(date).await?;

            trend.push(DailyTotal { date, total });
        }

        Ok(trend)
    }

    async fn total_for(&self, date: Date) -> Result<u64, StorageError> {
        let Some(total) = self.store.get(&stats::total_key(date)).await? else {
            return Ok(0);
        };

        total
            .parse()
            .map_err(|e| StorageError::Serialization(format!("invalid daily total '{total}': {e}")))
    }

    async fn record_stats(&self, event: &AbuseEvent) -> Result<(), StorageError> {
        let date = event.occurred_at.to_zoned(TimeZone::UTC).date();

        self.store.increment(&stats::total_key(date), self.retention).await?;

        self.store
            .increment_field(&stats::ip_key(date), &event.client_ip, self.retention)
            .await?;

        self.store
            .increment_field(&stats::uri_key(date), &event.endpoint, self.retention)
            .await?;

        if let Some(username) = &event.username {
            self.store
                .increment_field(&stats::user_key(date), username, self.retention)
                .await?;
        }

        Ok(())
    }

    async fn notify(&self, event: &AbuseEvent) {
        let Some(mailer) = &self.mailer else {
            return;
        };

        if self.recipients.is_empty() {
            return;
        }

        let subject = format!(
            "{} Rate limit exceeded on {}",
            self.subject_prefix, event.endpoint
        );

        let body = format!(
            "A client exceeded the rate limit.\n\n\
             Endpoint: {}\n\
             Client IP: {}\n\
             User: {}\n\
             Requests: {} of {} ({} window)\n\
             Time: {}\n",
            event.endpoint,
            event.client_ip,
            event.username.as_deref().unwrap_or("-"),
            event.count,
            event.limit,
            event.scope.as_str(),
            event.occurred_at,
        );

        let message = EmailMessage {
            recipients: self.recipients.clone(),
            subject: subject.trim_start().to_string(),
            body,
        };

        if let Err(e) = mailer.send(message).await {
            log::warn!("Failed to send abuse alert email: {e}");
        }
    }

    async fn audit(&self, event: &AbuseEvent, operation: &'static str, summary: &str) {
        let record = AuditRecord {
            operation,
            actor: event.identifier().to_string(),
            description: format!(
                "{summary} on {} by {} ({} of {} requests)",
                event.endpoint,
                event.identifier(),
                event.count,
                event.limit
            ),
            risk: format!("ratio={:.2}", event.ratio()),
        };

        if let Err(e) = self.audit.record(record).await {
            log::warn!("Failed to write audit record: {e}");
        }
    }
}

fn today() -> Date {
    Timestamp::now().to_zoned(TimeZone::UTC).date()
}
