//! The consumer's view of the focused event.

use std::sync::Arc;
use tokio::sync::watch;

use mailcase_core::{Event, EventId};

/// What the consumer is looking at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventView {
    /// The event the consumer is interested in.
    pub focus: Option<EventId>,
    /// Last committed state of the focused event.
    pub event: Option<Event>,
}

impl EventView {
    pub fn focused(event_id: EventId) -> Self {
        Self {
            focus: Some(event_id),
            event: None,
        }
    }

    pub fn is_focused_on(&self, event_id: EventId) -> bool {
        self.focus == Some(event_id)
    }
}

/// Shared publisher of the view. Writers go through `send_if_modified` so
/// the focus check and the write happen under the same lock.
pub type SharedView = Arc<watch::Sender<EventView>>;

pub fn shared_view(initial: EventView) -> SharedView {
    let (tx, _) = watch::channel(initial);
    Arc::new(tx)
}
