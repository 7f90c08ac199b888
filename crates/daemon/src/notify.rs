//! User-facing notifications.

use std::sync::Mutex;

use protocol::FenceKind;

/// A message shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
}

impl Notification {
    /// Notification raised when a fence action failed on every attempt.
    pub fn action_failed(job_id: &str, fence_title: &str, direction: FenceKind) -> Self {
        Self {
            id: job_id.to_string(),
            title: "Geofence action failed".to_string(),
            body: format!(
                "An action could not be completed when {direction} the fence \"{fence_title}\"."
            ),
        }
    }
}

/// Delivers notifications to the user.
pub trait Notifier: Send + Sync {
    fn raise(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn raise(&self, notification: Notification) {
        tracing::warn!(
            id = %notification.id,
            title = %notification.title,
            "{}",
            notification.body
        );
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    raised: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raised(&self) -> Vec<Notification> {
        self.raised
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Notifier for RecordingNotifier {
    fn raise(&self, notification: Notification) {
        match self.raised.lock() {
            Ok(mut raised) => raised.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}
