//! Engine → host notifications.
//!
//! Notifications fan out over a [`broadcast`] channel so any number of
//! observers can follow status changes, unsolicited events, and responses.
//! Publishing with zero subscribers is a silent no-op.

use tokio::sync::broadcast;

use crate::codec::Payload;
use crate::connection::ConnectionStatus;
use crate::registry::RequestResult;

/// An unsolicited, server-pushed event.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    /// Event name.
    pub event: String,
    /// Event body.
    pub payload: Payload,
}

/// Messages published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The connection status changed.
    StatusChanged(ConnectionStatus),
    /// The remote pushed an event no request was waiting for.
    EventReceived(ServerEvent),
    /// A request was resolved, by response, timeout, cancellation, or teardown.
    ResponseReceived {
        /// Correlation id of the request.
        correlation_id: u64,
        /// What its caller received.
        result: RequestResult,
    },
    /// An inbound frame could not be decoded. The connection stays up.
    DecodeFailed {
        /// Human-readable decode error.
        reason: String,
    },
}

/// Publishing side of the notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    /// Create a channel buffering up to `capacity` notifications per lagging
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber.
    pub fn publish(&self, notification: Notification) {
        // Err only means nobody is listening.
        let _ = self.tx.send(notification);
    }

    /// Register a new subscriber. It sees notifications published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let notifier = Notifier::new(8);
        assert_eq!(notifier.subscriber_count(), 0);
        notifier.publish(Notification::StatusChanged(ConnectionStatus::Open));
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let notifier = Notifier::new(8);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        let event = Notification::EventReceived(ServerEvent {
            event: "tick".into(),
            payload: Payload::empty(),
        });
        notifier.publish(event.clone());

        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }
}
