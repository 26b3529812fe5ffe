// src/notify.rs
//! Best-effort announcements to whatever renders the poll publicly.
//!
//! A notifier failure is logged by the caller and never undoes a state change.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::models::{Poll, PollResults};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("notification endpoint answered {0}")]
    Status(u16),
}

#[async_trait]
pub trait PollNotifier: Send + Sync {
    /// The poll closed; refresh its public message with the final tallies.
    async fn poll_closed(&self, poll: &Poll, results: &PollResults) -> Result<(), NotifyError>;
}

/// Writes closures to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl PollNotifier for LogNotifier {
    async fn poll_closed(&self, poll: &Poll, results: &PollResults) -> Result<(), NotifyError> {
        tracing::info!(
            poll_id = %poll.id,
            message_ref = poll.message_ref.as_deref().unwrap_or("-"),
            total_votes = results.total_votes,
            "poll closed"
        );
        Ok(())
    }
}

/// POSTs the final results as JSON to a configured endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PollNotifier for WebhookNotifier {
    async fn poll_closed(&self, poll: &Poll, results: &PollResults) -> Result<(), NotifyError> {
        let payload = json!({
            "event": "poll_closed",
            "poll_id": poll.id,
            "guild_id": poll.scope.guild_id,
            "channel_id": poll.scope.channel_id,
            "message_ref": poll.message_ref,
            "results": results,
        });
        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        tracing::debug!(poll_id = %poll.id, url = %self.url, "closure webhook delivered");
        Ok(())
    }
}
