use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;

use crate::error::NotificationError;

/// An email to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    /// Addresses to deliver to.
    pub recipients: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
}

/// Delivers alert emails.
#[async_trait]
pub trait AlertMailer: Send + Sync {
    /// Sends one message.
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError>;
}

/// Hands emails to a mail relay over HTTP as JSON.
pub struct WebhookMailer {
    client: Client,
    url: Url,
}

impl WebhookMailer {
    /// Creates a mailer posting to `url`.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::Client(e.to_string()))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl AlertMailer for WebhookMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&message)
            .send()
            .await
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}
