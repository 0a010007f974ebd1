//! Collaborator traits.
//!
//! The engine never persists events itself and never owns the catch-up
//! machinery that feeds them; it talks to both through these interfaces.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::EventChange;
use crate::models::{Event, EventId, MailSnapshot, MergeOutcome};

/// Result of [`EventRepository::add_or_merge_mail`].
#[derive(Debug, Clone)]
pub struct MailMerge {
    /// The event after the merge was persisted.
    pub event: Event,
    pub outcome: MergeOutcome,
}

/// In-place edit applied by [`EventRepository::update_with`]. Returns whether
/// the event changed.
pub type EventEdit = Box<dyn FnOnce(&mut Event) -> bool + Send>;

// =============================================================================
// EVENT REPOSITORY
// =============================================================================

/// Persistent store of events with a change-notification feed.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Fetch an event. `Ok(None)` when it does not exist.
    async fn get_by_id(&self, id: EventId) -> Result<Option<Event>>;

    /// All events, oldest first.
    async fn list(&self) -> Result<Vec<Event>>;

    /// Replace a stored event. Fails with `EventNotFound` if it does not exist.
    async fn update(&self, event: &Event) -> Result<Event>;

    /// Apply `edit` to the stored event in a single write. Unchanged events
    /// are neither written nor published.
    async fn update_with(&self, event_id: EventId, edit: EventEdit) -> Result<Event>;

    /// Add a live message to an event, merging with an existing member.
    async fn add_or_merge_mail(&self, event_id: EventId, mail: &MailSnapshot) -> Result<MailMerge>;

    /// Merge a re-identified member in a single write, keeping its unread
    /// flag at `is_new`.
    async fn repair_mail(
        &self,
        event_id: EventId,
        mail: &MailSnapshot,
        is_new: bool,
    ) -> Result<MailMerge>;

    /// Create a new event seeded from a message.
    async fn create_from_mail(&self, mail: &MailSnapshot, title: Option<String>) -> Result<Event>;

    /// Soft-remove a member.
    async fn remove_mail(
        &self,
        event_id: EventId,
        entry_id: Option<&str>,
        internet_message_id: Option<&str>,
    ) -> Result<Event>;

    /// Subscribe to persisted changes.
    fn subscribe(&self) -> broadcast::Receiver<EventChange>;
}

// =============================================================================
// CATCH-UP TRIGGER
// =============================================================================

/// Pull-based discovery of messages that bypassed push capture.
#[async_trait]
pub trait CatchUpTrigger: Send + Sync {
    /// Request a conversation catch-up for an event.
    ///
    /// With `run_immediately` the call returns once the catch-up finished or
    /// `timeout` elapsed; otherwise it schedules the work and returns at once.
    /// Discovered mail is reported through the repository's change feed.
    async fn trigger_catch_up(
        &self,
        event_id: EventId,
        conversation_ids: &[String],
        run_immediately: bool,
        timeout: Option<Duration>,
        use_full_history: bool,
    ) -> Result<()>;
}
