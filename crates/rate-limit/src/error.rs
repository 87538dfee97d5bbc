//! Error types for rate limiting.

use crate::storage::StorageError;

/// Errors returned by a sliding window check.
///
/// Callers on the request path resolve these to an admission.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// The window must be at least one second wide.
    #[error("Rate limit window must be at least one second")]
    InvalidWindow,

    /// Storage backend error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors rejecting an administrative change to a limit.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `max_requests` was zero.
    #[error("max_requests must be greater than zero")]
    InvalidMaxRequests,

    /// `window_seconds` was zero.
    #[error("window_seconds must be greater than zero")]
    InvalidWindow,

    /// The endpoint was empty after normalization.
    #[error("endpoint must not be empty")]
    EmptyEndpoint,

    /// No template with the given name exists.
    #[error("unknown limit template '{0}'")]
    UnknownTemplate(String),

    /// The override layer could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors reading abuse statistics.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    /// The requested trend length is outside `1..=max`.
    #[error("days must be between 1 and {max}")]
    InvalidTrendDays {
        /// Longest trend that can be requested.
        max: usize,
    },

    /// The statistics could not be read.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors delivering an alert notification.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// The HTTP client could not be built.
    #[error("Failed to create notification client: {0}")]
    Client(String),

    /// The request to the mail relay failed.
    #[error("Failed to deliver notification: {0}")]
    Delivery(String),

    /// The mail relay answered with an error status.
    #[error("Mail relay rejected the notification with status {status}: {message}")]
    Rejected {
        /// HTTP status code returned by the relay.
        status: u16,
        /// Body of the error response.
        message: String,
    },
}
