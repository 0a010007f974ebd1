//! One-shot "wait for a specific change" primitive.
//!
//! The subscription is taken when the waiter is created, before whatever is
//! expected to cause the change is triggered, so a fast change cannot slip
//! through unobserved. The subscription is dropped when the wait completes.

use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace};

use mailcase_core::{ChangeReason, EventChange, EventId};

/// Waits for the first change that satisfies a predicate.
pub struct ChangeWaiter<P> {
    rx: broadcast::Receiver<EventChange>,
    predicate: P,
}

impl<P> ChangeWaiter<P>
where
    P: Fn(&EventChange) -> bool,
{
    pub fn new(rx: broadcast::Receiver<EventChange>, predicate: P) -> Self {
        Self { rx, predicate }
    }

    /// Wait up to `timeout`. `None` when the timeout elapsed or the feed
    /// closed; neither is an error.
    pub async fn wait(mut self, timeout: Duration) -> Option<EventChange> {
        let predicate = &self.predicate;
        let rx = &mut self.rx;
        let wait = async move {
            loop {
                match rx.recv().await {
                    Ok(change) if predicate(&change) => return Some(change),
                    Ok(change) => {
                        trace!(event_id = %change.event.id, reason = %change.reason, "Ignoring change");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Change waiter lagged behind the feed");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(found) => found,
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Change wait timed out");
                None
            }
        }
    }
}

/// Predicate for the catch-up confirmation of a refresh: a mail-appended or
/// updated change of `event_id` whose event tracks one of `conversation_ids`.
pub fn catch_up_confirmation(
    event_id: EventId,
    conversation_ids: Vec<String>,
) -> impl Fn(&EventChange) -> bool + Send + Sync {
    move |change: &EventChange| {
        change.event.id == event_id
            && matches!(change.reason, ChangeReason::MailAppended | ChangeReason::Updated)
            && conversation_ids
                .iter()
                .any(|id| change.event.tracks_conversation(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailcase_core::{ChangeBus, Event};

    fn tracked_event(conversation: &str) -> Event {
        let mut event = Event::new("x");
        event.track_conversation(conversation);
        event
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_matching_change() {
        let bus = ChangeBus::new(16);
        let event = tracked_event("conv-1");
        let waiter = ChangeWaiter::new(
            bus.subscribe(),
            catch_up_confirmation(event.id, vec!["CONV-1".to_string()]),
        );

        let other = tracked_event("conv-1");
        bus.emit(other, ChangeReason::MailAppended);
        bus.emit(event.clone(), ChangeReason::MailRemoved);
        bus.emit(event.clone(), ChangeReason::Updated);

        let found = waiter.wait(Duration::from_secs(45)).await.unwrap();
        assert_eq!(found.event.id, event.id);
        assert_eq!(found.reason, ChangeReason::Updated);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_error() {
        let bus = ChangeBus::new(16);
        let event = tracked_event("conv-1");
        let waiter = ChangeWaiter::new(
            bus.subscribe(),
            catch_up_confirmation(event.id, vec!["conv-2".to_string()]),
        );
        bus.emit(event, ChangeReason::MailAppended);

        let start = tokio::time::Instant::now();
        assert!(waiter.wait(Duration::from_secs(45)).await.is_none());
        assert!(start.elapsed() >= Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_closed_feed_returns_none() {
        let bus = ChangeBus::new(4);
        let waiter = ChangeWaiter::new(bus.subscribe(), |_: &EventChange| true);
        drop(bus);
        assert!(waiter.wait(Duration::from_secs(1)).await.is_none());
    }
}
