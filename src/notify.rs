//! Fire-and-forget notifications after state changes

use std::sync::Mutex;

use uuid::Uuid;

use crate::authz::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    Users(Vec<Uuid>),
    Role(Role),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipients: Recipients,
    pub subject: String,
    pub body: String,
    /// Entity the notification is about (group, defense, gate owner)
    pub related: Option<Uuid>,
}

impl Notification {
    pub fn to_users(users: Vec<Uuid>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Notification {
            recipients: Recipients::Users(users),
            subject: subject.into(),
            body: body.into(),
            related: None,
        }
    }

    pub fn to_role(role: Role, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Notification {
            recipients: Recipients::Role(role),
            subject: subject.into(),
            body: body.into(),
            related: None,
        }
    }

    pub fn about(mut self, related: Uuid) -> Self {
        self.related = Some(related);
        self
    }
}

/// Delivery never blocks or fails the operation that triggered it.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let recipients = match &notification.recipients {
            Recipients::Users(users) => format!("{} user(s)", users.len()),
            Recipients::Role(role) => format!("all {role}s"),
        };
        tracing::info!(
            recipients = %recipients,
            related = ?notification.related,
            subject = %notification.subject,
            "notification dispatched"
        );
    }
}

/// Keeps every notification in memory for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}
