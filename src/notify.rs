//! User-facing notification contract.
//!
//! The transport is external; the engine only hands over a fully formatted
//! [`Notification`]. [`LogNotifier`] writes notifications to the log and
//! [`MemoryNotifier`] keeps them in memory for inspection.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// Severity shown to the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// One message addressed to one or more users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    pub title: String,
    pub level: NotificationLevel,
    pub mime_type: String,
    pub recipients: Vec<String>,
}

impl Notification {
    /// Plain-text notification for a single recipient.
    pub fn text(
        recipient: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        level: NotificationLevel,
    ) -> Self {
        Self {
            message: message.into(),
            title: title.into(),
            level,
            mime_type: "text/plain".to_string(),
            recipients: vec![recipient.into()],
        }
    }
}

/// Delivery of notifications to users.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Writes every notification as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        info!(
            title = %notification.title,
            level = ?notification.level,
            recipients = ?notification.recipients,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Keeps delivered notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.sent
            .lock()
            .expect("notifier lock poisoned")
            .push(notification);
        Ok(())
    }
}
