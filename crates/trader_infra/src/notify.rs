//! Operator notifications. Delivery is best effort: callers spawn the send
//! and only log failures.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("webhook transport error: {0}")]
    Transport(String),
    #[error("webhook returned http {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, at: DateTime<FixedOffset>, message: &str) -> Result<(), NotifyError>;
}

/// Chat webhook taking `{"content": "..."}`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

pub fn format_notification(at: DateTime<FixedOffset>, message: &str) -> String {
    format!("[{}] {message}", at.format("%H:%M:%S"))
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, at: DateTime<FixedOffset>, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "content": format_notification(at, message) }))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Used when an account has no webhook configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, at: DateTime<FixedOffset>, message: &str) -> Result<(), NotifyError> {
        info!(notification = %format_notification(at, message), "notify");
        Ok(())
    }
}
