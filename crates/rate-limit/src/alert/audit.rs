use async_trait::async_trait;
use serde::Serialize;

use crate::error::NotificationError;

/// A structured security event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    /// Operation tag, such as `suspicious-activity`.
    pub operation: &'static str,
    /// The IP address or username that caused the event.
    pub actor: String,
    /// Human readable description.
    pub description: String,
    /// Risk annotation.
    pub risk: String,
}

/// Receives security audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persists one record.
    async fn record(&self, record: AuditRecord) -> Result<(), NotificationError>;
}

/// Writes audit records to the `audit` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), NotificationError> {
        log::warn!(
            target: "audit",
            operation = record.operation,
            actor = record.actor.as_str(),
            risk = record.risk.as_str();
            "{}",
            record.description
        );

        Ok(())
    }
}
