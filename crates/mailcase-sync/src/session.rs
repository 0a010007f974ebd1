//! The consumer context: one focused event, kept current.
//!
//! An `EventSession` owns the view channel. It publishes the focused event on
//! load, follows repository changes for it through a listener task, routes
//! the user's edits to the repository and delegates manual refreshes to a
//! [`RefreshCoordinator`] that shares the same view.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use mailcase_core::{
    ChangeReason, Error, Event, EventChange, EventId, MailMerge, MailSnapshot, Result,
};

use crate::context::SyncContext;
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::validator::MailValidator;
use crate::view::{shared_view, EventView, SharedView};

pub struct EventSession {
    ctx: SyncContext,
    view: SharedView,
    coordinator: RefreshCoordinator,
    listener: JoinHandle<()>,
}

impl EventSession {
    /// Create a session with nothing focused. Must be called inside a tokio
    /// runtime; the change listener is spawned here.
    pub fn new(ctx: SyncContext) -> Self {
        let view = shared_view(EventView::default());
        let coordinator = RefreshCoordinator::new(ctx.clone(), view.clone());
        let listener = tokio::spawn(follow_changes(ctx.repository.subscribe(), view.clone()));
        Self {
            ctx,
            view,
            coordinator,
            listener,
        }
    }

    pub fn view(&self) -> watch::Receiver<EventView> {
        self.view.subscribe()
    }

    pub fn current(&self) -> EventView {
        self.view.borrow().clone()
    }

    pub fn focus(&self) -> Option<EventId> {
        self.view.borrow().focus
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Focus on `event_id`, publish it, then run a quiet validation pass.
    ///
    /// Returns `Ok(None)` if the event does not exist; the focus is still
    /// moved so a pending refresh of another event will not commit.
    #[instrument(skip(self))]
    pub async fn load(&self, event_id: EventId) -> Result<Option<Event>> {
        self.view.send_replace(EventView::focused(event_id));

        let Some(event) = self.ctx.repository.get_by_id(event_id).await? else {
            debug!(%event_id, "Event not found");
            return Ok(None);
        };
        self.publish(event.clone());

        let validated = MailValidator::new(self.ctx.clone())
            .validate_event(&event, &CancellationToken::new(), |_, _| {})
            .await;
        match validated {
            Ok(summary) if summary.repaired > 0 => {
                info!(%event_id, repaired = summary.repaired, "Repaired members on load");
                if let Some(fresh) = self.ctx.repository.get_by_id(event_id).await? {
                    self.publish(fresh.clone());
                    return Ok(Some(fresh));
                }
            }
            Ok(_) => {}
            Err(e) => warn!(%event_id, error = %e, "Validation on load failed"),
        }
        Ok(Some(event))
    }

    /// Drop the focus. A refresh still in flight will not commit.
    pub fn clear(&self) {
        self.view.send_replace(EventView::default());
    }

    /// Manually refresh the focused event.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let event_id = self.focused()?;
        self.coordinator.refresh_event(event_id).await
    }

    /// Clear every unread highlight of the focused event.
    pub async fn mark_all_read(&self) -> Result<Event> {
        self.edit(|event| event.mark_all_read()).await
    }

    pub async fn archive(&self) -> Result<Event> {
        self.edit(|event| {
            if !event.is_open() {
                return false;
            }
            event.archive();
            true
        })
        .await
    }

    pub async fn reopen(&self) -> Result<Event> {
        self.edit(|event| {
            if event.is_open() {
                return false;
            }
            event.reopen();
            true
        })
        .await
    }

    /// Soft-remove a member of the focused event.
    pub async fn remove_mail(
        &self,
        entry_id: Option<&str>,
        internet_message_id: Option<&str>,
    ) -> Result<Event> {
        let event_id = self.focused()?;
        let event = self
            .ctx
            .repository
            .remove_mail(event_id, entry_id, internet_message_id)
            .await?;
        self.publish(event.clone());
        Ok(event)
    }

    /// Manually add a mail to the focused event. Restores it if it was
    /// removed earlier.
    pub async fn add_mail(&self, mail: &MailSnapshot) -> Result<MailMerge> {
        let event_id = self.focused()?;
        let merged = self.ctx.repository.add_or_merge_mail(event_id, mail).await?;
        self.publish(merged.event.clone());
        Ok(merged)
    }

    fn focused(&self) -> Result<EventId> {
        self.focus()
            .ok_or_else(|| Error::NotFound("no event is focused".to_string()))
    }

    /// Modify the focused event in place inside the repository. `f` reports
    /// whether it changed anything; unchanged events are not written.
    async fn edit(&self, f: impl FnOnce(&mut Event) -> bool + Send + 'static) -> Result<Event> {
        let event_id = self.focused()?;
        let event = self.ctx.repository.update_with(event_id, Box::new(f)).await?;
        self.publish(event.clone());
        Ok(event)
    }

    fn publish(&self, event: Event) {
        self.view.send_if_modified(|view| {
            if !view.is_focused_on(event.id) {
                return false;
            }
            view.event = Some(event);
            true
        });
    }
}

impl Drop for EventSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn follow_changes(mut rx: broadcast::Receiver<EventChange>, view: SharedView) {
    loop {
        match rx.recv().await {
            Ok(change) => apply_change(&view, change),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Session listener lagged behind the change feed");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn apply_change(view: &SharedView, change: EventChange) {
    view.send_if_modified(|view| {
        if !view.is_focused_on(change.event.id) {
            return false;
        }
        trace!(event_id = %change.event.id, reason = %change.reason, "Applying change to view");
        view.event = match change.reason {
            ChangeReason::Deleted => None,
            _ => Some(change.event),
        };
        true
    });
}
