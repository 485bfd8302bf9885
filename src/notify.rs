//! Notification side-effect sink.
//!
//! Handlers may attach a notification to their outcome; the response
//! dispatcher posts it through a [`NotificationSink`] after the
//! handler returns. Posting is fire-and-forget: sink failures are
//! logged, never propagated to the caller's waiter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// User-facing notification content produced by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Short headline.
    pub title: String,
    /// Body text.
    pub body: String,
}

impl Notification {
    /// Create a notification.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Posts notification content to the surrounding platform.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Post one notification. Errors are logged by the dispatcher and
    /// never reach the caller.
    async fn post(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Default sink that logs notifications instead of displaying them.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn post(&self, notification: Notification) -> anyhow::Result<()> {
        info!(title = %notification.title, body = %notification.body, "notification posted");
        Ok(())
    }
}
