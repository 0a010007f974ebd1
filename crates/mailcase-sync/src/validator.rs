//! Mail validator and repairer.
//!
//! Re-resolves every active member of an event. Members whose live entry id or
//! store id drifted are merged back into the event with their unread flag
//! preserved. Members that cannot be resolved are left untouched; they may
//! have moved out of reach or been deleted, and are never auto-removed.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mailcase_core::{Error, Event, EventId, EventRepository, MailRef, MailSnapshot, Result};

use crate::context::{cancellable, SyncContext};
use crate::resolver::IdentityResolver;

/// Result of checking one member against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberCheck {
    /// Resolved with unchanged identifiers.
    Current,
    /// Resolved, but the live identifiers differ.
    Drifted(MailSnapshot),
    /// Not resolvable by any strategy.
    Unresolved,
}

/// Check one member. Runs on the store owner thread.
pub fn check_member(resolver: &IdentityResolver<'_>, mail: &MailRef) -> MemberCheck {
    match resolver.resolve(mail) {
        Some(found) if mail.identifiers_drifted(&found.mail) => MemberCheck::Drifted(found.mail),
        Some(_) => MemberCheck::Current,
        None => MemberCheck::Unresolved,
    }
}

/// Counters of a validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub validated: usize,
    pub repaired: usize,
    pub unresolved: usize,
    pub failed: usize,
}

/// Merge a drifted member's live identity back into its event. The prior
/// unread flag is carried over in the same repository write.
pub async fn repair_member(
    repository: &dyn EventRepository,
    event_id: EventId,
    prior: &MailRef,
    live: &MailSnapshot,
) -> Result<Event> {
    let mut live = live.clone();
    if live.internet_message_id.is_none() {
        live.internet_message_id = prior.internet_message_id.clone();
    }
    let merged = repository.repair_mail(event_id, &live, prior.is_new).await?;
    Ok(merged.event)
}

/// Validates and repairs event members.
#[derive(Clone)]
pub struct MailValidator {
    ctx: SyncContext,
}

impl MailValidator {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Validate every active member of `event`.
    ///
    /// `on_progress(done, total)` is called after each member. Returns
    /// `Error::Cancelled` if `cancel` fires; repairs already applied stay.
    pub async fn validate_event<F>(
        &self,
        event: &Event,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<ValidationSummary>
    where
        F: FnMut(usize, usize) + Send,
    {
        let members: Vec<MailRef> = event.active_mail().cloned().collect();
        let total = members.len();
        let mut summary = ValidationSummary::default();

        for (done, mail) in members.into_iter().enumerate() {
            let check = {
                let mail = mail.clone();
                let capabilities = self.ctx.capabilities.clone();
                let token = cancel.clone();
                let lookback = self.ctx.config.message_id_lookback_days;
                cancellable(
                    cancel,
                    self.ctx.client.run(move |store| {
                        let resolver = IdentityResolver::new(store, capabilities, token, lookback);
                        check_member(&resolver, &mail)
                    }),
                )
                .await?
            };
            summary.validated += 1;

            match check {
                MemberCheck::Current => {}
                MemberCheck::Unresolved => {
                    summary.unresolved += 1;
                    debug!(
                        event_id = %event.id,
                        entry_id = %mail.entry_id,
                        "Member unresolved, leaving it unchanged"
                    );
                }
                MemberCheck::Drifted(live) => {
                    let repaired = cancellable(
                        cancel,
                        repair_member(self.ctx.repository.as_ref(), event.id, &mail, &live),
                    )
                    .await;
                    match repaired {
                        Ok(_) => {
                            summary.repaired += 1;
                            info!(
                                event_id = %event.id,
                                old_entry_id = %mail.entry_id,
                                new_entry_id = %live.entry_id,
                                "Repaired drifted mail reference"
                            );
                        }
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) if e.is_benign() => {
                            summary.failed += 1;
                            debug!(event_id = %event.id, entry_id = %mail.entry_id, error = %e, "Repair skipped");
                        }
                        Err(e) => {
                            summary.failed += 1;
                            warn!(event_id = %event.id, entry_id = %mail.entry_id, error = %e, "Repair failed");
                        }
                    }
                }
            }

            on_progress(done + 1, total);
        }

        Ok(summary)
    }
}
