// ABOUTME: The user-notification capability consumed by the store and scheduler.
// ABOUTME: Ships a tracing-backed notifier for headless use and a recording notifier for inspection.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

/// Failure to raise a notification. Never fatal to the caller.
#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// A single user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub priority: u8,
}

impl Notification {
    /// A plain notification with default priority.
    pub fn basic(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "basic".to_string(),
            title: title.into(),
            message: message.into(),
            priority: 1,
        }
    }
}

/// Host notification service.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Raise (or replace) the notification with the given id.
    async fn create(&self, id: &str, notification: Notification) -> Result<(), NotifyError>;
}

/// Raise a notification, logging instead of failing.
pub async fn notify_best_effort(notifier: &dyn Notifier, id: &str, notification: Notification) {
    if let Err(e) = notifier.create(id, notification).await {
        tracing::warn!("could not raise notification {}: {}", id, e);
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn create(&self, id: &str, notification: Notification) -> Result<(), NotifyError> {
        tracing::info!(
            notification_id = id,
            "{}: {}",
            notification.title,
            notification.message
        );
        Ok(())
    }
}

/// Keeps every notification it receives, in order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    created: Mutex<Vec<(String, Notification)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications raised so far as `(id, notification)` pairs.
    pub async fn notifications(&self) -> Vec<(String, Notification)> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn create(&self, id: &str, notification: Notification) -> Result<(), NotifyError> {
        self.created.lock().await.push((id.to_string(), notification));
        Ok(())
    }
}
