//! Event change notifications.
//!
//! Repositories publish every persisted change through a [`ChangeBus`].
//! Subscribers (the refresh orchestrator's one-shot waits, the event session's
//! listener) each receive an independent stream.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

use crate::models::Event;

/// Why an event changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Created,
    Updated,
    MailAppended,
    MailRemoved,
    Deleted,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeReason::Created => "created",
            ChangeReason::Updated => "updated",
            ChangeReason::MailAppended => "mail_appended",
            ChangeReason::MailRemoved => "mail_removed",
            ChangeReason::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A persisted change, carrying the event as it was after the change.
#[derive(Debug, Clone, Serialize)]
pub struct EventChange {
    pub event: Event,
    pub reason: ChangeReason,
    pub timestamp: DateTime<Utc>,
}

impl EventChange {
    pub fn new(event: Event, reason: ChangeReason) -> Self {
        Self {
            event,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast bus for [`EventChange`]s.
#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<EventChange>,
}

impl ChangeBus {
    /// Create a new bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a change. Dropped silently when nobody listens.
    pub fn emit(&self, event: Event, reason: ChangeReason) {
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            event_id = %event.id,
            %reason,
            subscriber_count,
            "ChangeBus emit"
        );
        let _ = self.tx.send(EventChange::new(event, reason));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventChange> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

impl fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_change_bus_emit_subscribe() {
        let bus = ChangeBus::new(32);
        let mut rx = bus.subscribe();
        let event = Event::new("Budget");
        let id = event.id;

        bus.emit(event, ChangeReason::MailAppended);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.event.id, id);
        assert_eq!(change.reason, ChangeReason::MailAppended);
    }

    #[tokio::test]
    async fn test_change_bus_multiple_subscribers() {
        let bus = ChangeBus::new(32);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(Event::new("x"), ChangeReason::Created);

        assert_eq!(rx1.recv().await.unwrap().reason, ChangeReason::Created);
        assert_eq!(rx2.recv().await.unwrap().reason, ChangeReason::Created);
    }

    #[test]
    fn test_change_bus_no_subscribers_ok() {
        let bus = ChangeBus::default();
        bus.emit(Event::new("x"), ChangeReason::Deleted);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ChangeReason::MailAppended.to_string(), "mail_appended");
    }
}
