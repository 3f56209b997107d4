//! User-visible notifications.
//!
//! The executor emits these only for events the user can act on: chain
//! exhaustion, payment problems, and rate limiting. Transient network noise
//! stays out of the channel.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ChainExhausted,
    Payment,
    RateLimit,
}

#[derive(Debug, Clone)]
pub struct UserNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub provider: Option<String>,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Fan-out point for notifications. The application layer owns the receiver
/// and decides how to surface messages to the user.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<UserNotification>,
}

impl Notifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UserNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A notifier whose messages go nowhere. For tests and one-shot runs.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn notify(
        &self,
        user_id: &str,
        kind: NotificationKind,
        provider: Option<&str>,
        message: impl Into<String>,
    ) {
        let notification = UserNotification {
            user_id: user_id.to_string(),
            kind,
            provider: provider.map(|p| p.to_string()),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        };
        tracing::info!(
            user = %notification.user_id,
            kind = ?notification.kind,
            provider = ?notification.provider,
            "User notification: {}",
            notification.message
        );
        // Receiver may be gone during shutdown; that is fine.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notifications_delivered() {
        let (notifier, mut rx) = Notifier::new();
        notifier.notify("u1", NotificationKind::Payment, Some("openrouter"), "credits exhausted");

        let received = rx.recv().await.unwrap();
        assert_eq!(received.user_id, "u1");
        assert_eq!(received.kind, NotificationKind::Payment);
        assert_eq!(received.provider.as_deref(), Some("openrouter"));
    }

    #[test]
    fn test_disconnected_notifier_does_not_panic() {
        let notifier = Notifier::disconnected();
        notifier.notify("u1", NotificationKind::RateLimit, None, "slow down");
    }
}
