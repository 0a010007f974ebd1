//! Refresh orchestrator.
//!
//! A manual refresh of one event runs four stages:
//!
//! | Stage | Progress | What it does |
//! |-------|----------|--------------|
//! | Catch-up | 5 → 30 | Runs a full-history conversation catch-up and waits for the repository to confirm it |
//! | Discovery | 30 → 50 | Subject-driven discovery across the default store |
//! | Reload | 50 → 60 | Re-reads the event from the repository |
//! | Validation | 60 → 90 | Re-resolves every member and repairs drifted identifiers |
//!
//! and then commits the freshly loaded event into the shared view, but only
//! if the consumer is still focused on that event and the refresh was not
//! superseded. At most one refresh is in flight per coordinator; starting a
//! new one cancels the previous one and waits for it to wind down.
//!
//! Faults in the first four stages are logged and the pipeline carries on
//! with what it has. Only a failure to reload the event at commit time is
//! surfaced to the caller.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use mailcase_core::defaults::{
    EVENT_BUS_CAPACITY, PROGRESS_CATCH_UP_DONE, PROGRESS_DISCOVERY_DONE, PROGRESS_DONE,
    PROGRESS_PREPARED, PROGRESS_RELOADED, PROGRESS_START, PROGRESS_VALIDATED,
};
use mailcase_core::{Error, Event, EventId, Result};

use crate::config::lookback_cutoff;
use crate::context::{cancellable, SyncContext};
use crate::matcher::discover_by_subject;
use crate::validator::MailValidator;
use crate::view::{EventView, SharedView};
use crate::wait::{catch_up_confirmation, ChangeWaiter};

/// Pipeline stage, used in progress events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStage {
    Preparing,
    CatchUp,
    Discovery,
    Reload,
    Validation,
    Commit,
}

impl fmt::Display for RefreshStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preparing => "preparing",
            Self::CatchUp => "catch_up",
            Self::Discovery => "discovery",
            Self::Reload => "reload",
            Self::Validation => "validation",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Counters of one refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub event_id: EventId,
    /// The repository confirmed a catch-up change before the timeout.
    pub catch_up_confirmed: bool,
    /// The catch-up wait ran out. Not an error.
    pub catch_up_timed_out: bool,
    pub subject_matches: usize,
    pub validated: usize,
    pub repaired: usize,
    pub unresolved: usize,
    pub duration: Duration,
}

impl RefreshReport {
    fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            catch_up_confirmed: false,
            catch_up_timed_out: false,
            subject_matches: 0,
            validated: 0,
            repaired: 0,
            unresolved: 0,
            duration: Duration::ZERO,
        }
    }
}

/// How a refresh ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The view now shows the refreshed event.
    Completed(RefreshReport),
    /// All stages ran, but focus had moved on so the view was left alone.
    Discarded(RefreshReport),
    /// Cancelled or replaced by a newer refresh. The view was not touched.
    Superseded,
    /// The event no longer exists.
    EventMissing,
}

/// Progress notifications published while a refresh runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RefreshEvent {
    Started {
        event_id: EventId,
    },
    Progress {
        event_id: EventId,
        percent: u8,
        stage: RefreshStage,
        message: String,
    },
    Completed {
        event_id: EventId,
        report: RefreshReport,
    },
    Discarded {
        event_id: EventId,
    },
    Cancelled {
        event_id: EventId,
    },
    Failed {
        event_id: EventId,
        error: String,
    },
}

/// Current state of the coordinator. Terminal states stick until the next
/// refresh starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RefreshState {
    #[default]
    Idle,
    Running {
        event_id: EventId,
    },
    Completed {
        event_id: EventId,
    },
    Cancelled {
        event_id: EventId,
    },
    Failed {
        event_id: EventId,
        error: String,
    },
}

impl RefreshState {
    /// True unless a refresh is running.
    pub fn is_idle(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

enum Flow {
    Committed,
    Discarded,
    EventMissing,
}

struct InFlight {
    event_id: EventId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    ctx: SyncContext,
    view: SharedView,
    events: broadcast::Sender<RefreshEvent>,
    state: watch::Sender<RefreshState>,
    slot: Mutex<Option<InFlight>>,
}

/// Runs manual refreshes against a shared view.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(ctx: SyncContext, view: SharedView) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (state, _) = watch::channel(RefreshState::Idle);
        Self {
            inner: Arc::new(Inner {
                ctx,
                view,
                events,
                state,
                slot: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to progress notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<RefreshState> {
        self.inner.state.subscribe()
    }

    pub fn view(&self) -> watch::Receiver<EventView> {
        self.inner.view.subscribe()
    }

    /// Refresh `event_id`, superseding any refresh already in flight.
    ///
    /// Returns once this refresh has finished. If a later call supersedes
    /// it, this call returns `RefreshOutcome::Superseded`.
    #[instrument(skip(self))]
    pub async fn refresh_event(&self, event_id: EventId) -> Result<RefreshOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut slot = self.inner.slot.lock().await;
            if let Some(previous) = slot.take() {
                if !previous.task.is_finished() {
                    debug!(previous = %previous.event_id, "Superseding in-flight refresh");
                }
                previous.token.cancel();
                if let Err(e) = previous.task.await {
                    warn!(previous = %previous.event_id, error = %e, "Previous refresh ended abnormally");
                }
            }

            let token = CancellationToken::new();
            let inner = self.inner.clone();
            let task_token = token.clone();
            let task = tokio::spawn(async move {
                // A panicking run must still end in a terminal state.
                let run = tokio::spawn({
                    let inner = inner.clone();
                    async move { inner.execute(event_id, task_token).await }
                });
                let outcome = match run.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(inner.fail(
                        event_id,
                        Error::Internal(format!("refresh task failed: {e}")),
                    )),
                };
                let _ = done_tx.send(outcome);
            });
            *slot = Some(InFlight {
                event_id,
                token,
                task,
            });
        }

        done_rx
            .await
            .map_err(|_| Error::Internal("refresh task ended without an outcome".to_string()))?
    }

    /// Cancel the in-flight refresh, if any, and wait for it to stop.
    pub async fn cancel(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        match slot.take() {
            Some(in_flight) if !in_flight.task.is_finished() => {
                in_flight.token.cancel();
                let _ = in_flight.task.await;
                true
            }
            _ => false,
        }
    }
}

impl Inner {
    async fn execute(&self, event_id: EventId, token: CancellationToken) -> Result<RefreshOutcome> {
        let start = Instant::now();
        self.state.send_replace(RefreshState::Running { event_id });
        let _ = self.events.send(RefreshEvent::Started { event_id });

        let mut report = RefreshReport::new(event_id);
        let result = self.pipeline(event_id, &token, &mut report).await;
        report.duration = start.elapsed();

        match result {
            Ok(Flow::Committed) => {
                info!(
                    %event_id,
                    subject_matches = report.subject_matches,
                    repaired = report.repaired,
                    unresolved = report.unresolved,
                    catch_up_timed_out = report.catch_up_timed_out,
                    duration_ms = report.duration.as_millis() as u64,
                    "Refresh completed"
                );
                self.state.send_replace(RefreshState::Completed { event_id });
                let _ = self.events.send(RefreshEvent::Completed {
                    event_id,
                    report: report.clone(),
                });
                Ok(RefreshOutcome::Completed(report))
            }
            Ok(Flow::Discarded) => {
                debug!(%event_id, "Focus moved on, refresh result discarded");
                self.state.send_replace(RefreshState::Completed { event_id });
                let _ = self.events.send(RefreshEvent::Discarded { event_id });
                Ok(RefreshOutcome::Discarded(report))
            }
            Ok(Flow::EventMissing) => {
                info!(%event_id, "Event no longer exists, nothing to refresh");
                self.state.send_replace(RefreshState::Idle);
                let _ = self.events.send(RefreshEvent::Discarded { event_id });
                Ok(RefreshOutcome::EventMissing)
            }
            Err(Error::Cancelled) => {
                debug!(%event_id, "Refresh cancelled");
                self.state.send_replace(RefreshState::Cancelled { event_id });
                let _ = self.events.send(RefreshEvent::Cancelled { event_id });
                Ok(RefreshOutcome::Superseded)
            }
            Err(e) => Err(self.fail(event_id, e)),
        }
    }

    /// Record a failed refresh and hand the error back.
    fn fail(&self, event_id: EventId, e: Error) -> Error {
        error!(%event_id, error = %e, "Refresh failed");
        self.state.send_replace(RefreshState::Failed {
            event_id,
            error: e.to_string(),
        });
        let _ = self.events.send(RefreshEvent::Failed {
            event_id,
            error: e.to_string(),
        });
        e
    }

    fn progress(&self, event_id: EventId, percent: u8, stage: RefreshStage, message: impl Into<String>) {
        let message = message.into();
        debug!(%event_id, percent, %stage, "{}", message);
        let _ = self.events.send(RefreshEvent::Progress {
            event_id,
            percent,
            stage,
            message,
        });
    }

    async fn pipeline(
        &self,
        event_id: EventId,
        token: &CancellationToken,
        report: &mut RefreshReport,
    ) -> Result<Flow> {
        self.progress(event_id, PROGRESS_START, RefreshStage::Preparing, "Loading event");

        match cancellable(token, self.ctx.repository.get_by_id(event_id)).await {
            Ok(Some(event)) => {
                if !self.run_stages(event, token, report).await? {
                    return Ok(Flow::EventMissing);
                }
            }
            Ok(None) => return Ok(Flow::EventMissing),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(%event_id, error = %e, "Initial load failed, going straight to commit");
            }
        }

        self.commit(event_id, token).await
    }

    /// Catch-up, discovery, reload and validation. Only cancellation is
    /// returned as an error. `Ok(false)` means the event disappeared.
    async fn run_stages(
        &self,
        mut event: Event,
        token: &CancellationToken,
        report: &mut RefreshReport,
    ) -> Result<bool> {
        let event_id = event.id;
        let ctx = &self.ctx;
        let conversation_ids = event.distinct_conversation_ids();
        self.progress(
            event_id,
            PROGRESS_PREPARED,
            RefreshStage::Preparing,
            format!("{} conversation(s) tracked", conversation_ids.len()),
        );

        if !conversation_ids.is_empty() {
            // Subscribe before triggering so a fast catch-up is not missed.
            let waiter = ChangeWaiter::new(
                ctx.repository.subscribe(),
                catch_up_confirmation(event_id, conversation_ids.clone()),
            );
            let timeout = ctx.config.catch_up_timeout;
            let deadline = Instant::now() + timeout;
            let triggered = cancellable(
                token,
                ctx.catch_up
                    .trigger_catch_up(event_id, &conversation_ids, true, Some(timeout), true),
            )
            .await;
            match triggered {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_benign() => debug!(%event_id, error = %e, "Catch-up skipped"),
                Err(e) => warn!(%event_id, error = %e, "Catch-up trigger failed"),
            }

            // The trigger and the wait share one deadline.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let confirmed =
                cancellable(token, async { Ok::<_, Error>(waiter.wait(remaining).await) }).await?;
            if confirmed.is_some() {
                report.catch_up_confirmed = true;
            } else {
                report.catch_up_timed_out = true;
                debug!(%event_id, timeout_ms = timeout.as_millis() as u64, "No catch-up confirmation, continuing");
            }
        }
        self.progress(event_id, PROGRESS_CATCH_UP_DONE, RefreshStage::CatchUp, "Conversation catch-up done");

        if !event.related_subjects.is_empty() {
            report.subject_matches = self.discover(&event, token).await?;
        }
        self.progress(
            event_id,
            PROGRESS_DISCOVERY_DONE,
            RefreshStage::Discovery,
            format!("{} subject match(es)", report.subject_matches),
        );

        match cancellable(token, ctx.repository.get_by_id(event_id)).await {
            Ok(Some(fresh)) => event = fresh,
            Ok(None) => return Ok(false),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!(%event_id, error = %e, "Reload failed, validating the previous copy"),
        }
        self.progress(event_id, PROGRESS_RELOADED, RefreshStage::Reload, "Event reloaded");

        let events = self.events.clone();
        let span = PROGRESS_VALIDATED - PROGRESS_RELOADED;
        let validated = MailValidator::new(ctx.clone())
            .validate_event(&event, token, move |done, total| {
                let percent = PROGRESS_RELOADED + (span as usize * done / total.max(1)) as u8;
                let _ = events.send(RefreshEvent::Progress {
                    event_id,
                    percent,
                    stage: RefreshStage::Validation,
                    message: format!("Validated {done}/{total}"),
                });
            })
            .await;
        match validated {
            Ok(summary) => {
                report.validated = summary.validated;
                report.repaired = summary.repaired;
                report.unresolved = summary.unresolved;
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!(%event_id, error = %e, "Validation failed"),
        }
        self.progress(event_id, PROGRESS_VALIDATED, RefreshStage::Validation, "Validation done");

        Ok(true)
    }

    /// Subject discovery and merge. Returns how many matches were merged.
    async fn discover(&self, event: &Event, token: &CancellationToken) -> Result<usize> {
        let ctx = &self.ctx;
        let event_id = event.id;
        let cutoff = lookback_cutoff(ctx.config.subject_lookback_days);
        let snapshot = event.clone();
        let capabilities = ctx.capabilities.clone();
        let scan_token = token.clone();

        let found = cancellable(
            token,
            ctx.client.run(move |store| {
                discover_by_subject(store, &snapshot, cutoff, capabilities, scan_token)
            }),
        )
        .await;
        let discovered = match found {
            Ok(Ok((discovered, _))) => discovered,
            Ok(Err(e)) => {
                warn!(%event_id, error = %e, "Subject discovery failed");
                return Ok(0);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(%event_id, error = %e, "Subject discovery failed");
                return Ok(0);
            }
        };

        let mut merged = 0;
        for candidate in discovered {
            match cancellable(token, ctx.repository.add_or_merge_mail(event_id, &candidate.mail)).await {
                Ok(_) => merged += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(
                    %event_id,
                    entry_id = %candidate.mail.entry_id,
                    error = %e,
                    "Failed to merge discovered mail"
                ),
            }
        }
        Ok(merged)
    }

    /// Reload and publish. A reload failure here is the one fault that
    /// reaches the caller.
    async fn commit(&self, event_id: EventId, token: &CancellationToken) -> Result<Flow> {
        self.progress(event_id, PROGRESS_VALIDATED, RefreshStage::Commit, "Committing");

        let Some(fresh) = cancellable(token, self.ctx.repository.get_by_id(event_id)).await? else {
            return Ok(Flow::EventMissing);
        };

        let committed = self.view.send_if_modified(|view| {
            if token.is_cancelled() || !view.is_focused_on(event_id) {
                return false;
            }
            view.event = Some(fresh);
            true
        });
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.progress(event_id, PROGRESS_DONE, RefreshStage::Commit, "Refresh done");
        Ok(if committed {
            Flow::Committed
        } else {
            Flow::Discarded
        })
    }
}
