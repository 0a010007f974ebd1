//! In-memory event repository.

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use mailcase_core::{
    ChangeBus, ChangeReason, Error, Event, EventChange, EventEdit, EventId, EventRepository,
    MailMerge, MailSnapshot, MergeOutcome, Result,
};

/// Event repository backed by a `Vec` behind a tokio `RwLock`.
///
/// Every successful write is published on the change bus after the lock is
/// released, so a subscriber that reacts by reading never deadlocks.
#[derive(Debug, Default)]
pub struct MemoryEventRepository {
    events: RwLock<Vec<Event>>,
    bus: ChangeBus,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository without emitting changes.
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: RwLock::new(events),
            bus: ChangeBus::default(),
        }
    }

    /// Insert a fully formed event.
    pub async fn insert(&self, event: Event) -> Result<Event> {
        {
            let mut events = self.events.write().await;
            if events.iter().any(|e| e.id == event.id) {
                return Err(Error::Repository(format!("event {} already exists", event.id)));
            }
            events.push(event.clone());
        }
        self.bus.emit(event.clone(), ChangeReason::Created);
        Ok(event)
    }

    /// Physically delete an event.
    pub async fn delete(&self, id: EventId) -> Result<Event> {
        let removed = {
            let mut events = self.events.write().await;
            let index = events
                .iter()
                .position(|e| e.id == id)
                .ok_or(Error::EventNotFound(id))?;
            events.remove(index)
        };
        self.bus.emit(removed.clone(), ChangeReason::Deleted);
        Ok(removed)
    }

    /// Clone of all stored events.
    pub async fn snapshot(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Apply `f` to the stored event under the write lock and publish the
    /// result with `reason`. A `None` reason publishes nothing.
    async fn modify<T>(
        &self,
        id: EventId,
        f: impl FnOnce(&mut Event) -> Result<T> + Send,
        reason: impl FnOnce(&T) -> Option<ChangeReason> + Send,
    ) -> Result<(Event, T)>
    where
        T: Send,
    {
        let (event, value) = {
            let mut events = self.events.write().await;
            let event = events
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(Error::EventNotFound(id))?;
            let value = f(event)?;
            (event.clone(), value)
        };
        if let Some(reason) = reason(&value) {
            self.bus.emit(event.clone(), reason);
        }
        Ok((event, value))
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn get_by_id(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self.events.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<Event>> {
        Ok(self.snapshot().await)
    }

    async fn update(&self, event: &Event) -> Result<Event> {
        let replacement = event.clone();
        let (stored, _) = self
            .modify(
                event.id,
                move |stored| {
                    *stored = replacement;
                    stored.updated_at = chrono::Utc::now();
                    Ok(())
                },
                |_| Some(ChangeReason::Updated),
            )
            .await?;
        Ok(stored)
    }

    async fn update_with(&self, event_id: EventId, edit: EventEdit) -> Result<Event> {
        let (event, _) = self
            .modify(
                event_id,
                move |event| {
                    let changed = edit(event);
                    if changed {
                        event.updated_at = chrono::Utc::now();
                    }
                    Ok(changed)
                },
                |changed| changed.then_some(ChangeReason::Updated),
            )
            .await?;
        Ok(event)
    }

    async fn add_or_merge_mail(&self, event_id: EventId, mail: &MailSnapshot) -> Result<MailMerge> {
        let mail = mail.clone();
        let (event, outcome) = self
            .modify(
                event_id,
                move |event| Ok(event.add_or_merge(&mail)),
                |outcome| Some(merge_reason(*outcome)),
            )
            .await?;
        debug!(%event_id, ?outcome, "Mail merged into event");
        Ok(MailMerge { event, outcome })
    }

    async fn repair_mail(
        &self,
        event_id: EventId,
        mail: &MailSnapshot,
        is_new: bool,
    ) -> Result<MailMerge> {
        let mail = mail.clone();
        let (event, outcome) = self
            .modify(
                event_id,
                move |event| Ok(event.repair_member(&mail, is_new)),
                |outcome| Some(merge_reason(*outcome)),
            )
            .await?;
        debug!(%event_id, ?outcome, is_new, "Member repaired");
        Ok(MailMerge { event, outcome })
    }

    async fn create_from_mail(&self, mail: &MailSnapshot, title: Option<String>) -> Result<Event> {
        self.insert(Event::from_mail(mail, title)).await
    }

    async fn remove_mail(
        &self,
        event_id: EventId,
        entry_id: Option<&str>,
        internet_message_id: Option<&str>,
    ) -> Result<Event> {
        let entry_id = entry_id.map(String::from);
        let message_id = internet_message_id.map(String::from);
        let (event, _) = self
            .modify(
                event_id,
                move |event| {
                    if event.soft_remove(entry_id.as_deref(), message_id.as_deref()) {
                        Ok(())
                    } else {
                        Err(Error::NotFound(format!(
                            "mail {} in event {}",
                            entry_id.or(message_id).unwrap_or_default(),
                            event.id
                        )))
                    }
                },
                |_| Some(ChangeReason::MailRemoved),
            )
            .await?;
        Ok(event)
    }

    fn subscribe(&self) -> broadcast::Receiver<EventChange> {
        self.bus.subscribe()
    }
}

fn merge_reason(outcome: MergeOutcome) -> ChangeReason {
    match outcome {
        MergeOutcome::Added | MergeOutcome::Restored => ChangeReason::MailAppended,
        MergeOutcome::Updated | MergeOutcome::Unchanged => ChangeReason::Updated,
    }
}
