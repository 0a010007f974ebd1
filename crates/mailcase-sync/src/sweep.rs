//! Bulk conversation catch-up across every open event.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use mailcase_core::defaults::EVENT_BUS_CAPACITY;
use mailcase_core::{Error, EventId, Result};

use crate::context::{cancellable, SyncContext};

/// Counters of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub considered: usize,
    pub triggered: usize,
    /// Archived events and events without tracked conversations.
    pub skipped: usize,
    pub failed: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Cancelled or replaced by a newer sweep.
    Superseded(SweepReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SweepEvent {
    Started { total: usize },
    Progress { done: usize, total: usize, event_id: EventId },
    Completed { report: SweepReport },
    Cancelled { done: usize, total: usize },
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    ctx: SyncContext,
    events: broadcast::Sender<SweepEvent>,
    slot: Mutex<Option<Running>>,
}

/// Triggers conversation catch-up for all open events, one at a time.
///
/// Subject discovery is never part of a sweep; it only runs in a manual
/// refresh of a single event.
#[derive(Clone)]
pub struct CatchUpSweep {
    inner: Arc<Inner>,
}

impl CatchUpSweep {
    pub fn new(ctx: SyncContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ctx,
                events,
                slot: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.inner.events.subscribe()
    }

    /// Run a sweep, superseding one already in progress.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<SweepOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut slot = self.inner.slot.lock().await;
            if let Some(previous) = slot.take() {
                previous.token.cancel();
                if let Err(e) = previous.task.await {
                    warn!(error = %e, "Previous sweep ended abnormally");
                }
            }

            let token = CancellationToken::new();
            let inner = self.inner.clone();
            let task_token = token.clone();
            let task = tokio::spawn(async move {
                let _ = done_tx.send(inner.sweep(task_token).await);
            });
            *slot = Some(Running { token, task });
        }

        done_rx
            .await
            .map_err(|_| Error::Internal("sweep task ended without an outcome".to_string()))?
    }

    /// Cancel the running sweep and wait for it to stop.
    pub async fn cancel(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        match slot.take() {
            Some(running) if !running.task.is_finished() => {
                running.token.cancel();
                let _ = running.task.await;
                true
            }
            _ => false,
        }
    }
}

impl Inner {
    async fn sweep(&self, token: CancellationToken) -> Result<SweepOutcome> {
        let start = Instant::now();
        let ctx = &self.ctx;
        let mut report = SweepReport::default();

        let events = match cancellable(&token, ctx.repository.list()).await {
            Ok(events) => events,
            Err(Error::Cancelled) => return Ok(SweepOutcome::Superseded(report)),
            Err(e) => return Err(e),
        };
        let total = events.len();
        report.considered = total;
        let _ = self.events.send(SweepEvent::Started { total });
        info!(total, "Catch-up sweep started");

        for (done, event) in events.into_iter().enumerate() {
            let conversation_ids = event.distinct_conversation_ids();
            if !event.is_open() || conversation_ids.is_empty() {
                report.skipped += 1;
            } else {
                let triggered = cancellable(
                    &token,
                    ctx.catch_up.trigger_catch_up(
                        event.id,
                        &conversation_ids,
                        true,
                        Some(ctx.config.catch_up_timeout),
                        false,
                    ),
                )
                .await;
                match triggered {
                    Ok(()) => report.triggered += 1,
                    Err(Error::Cancelled) => {
                        debug!(done, total, "Catch-up sweep cancelled");
                        let _ = self.events.send(SweepEvent::Cancelled { done, total });
                        report.duration = start.elapsed();
                        return Ok(SweepOutcome::Superseded(report));
                    }
                    Err(e) if e.is_benign() => {
                        report.skipped += 1;
                        debug!(event_id = %event.id, error = %e, "Event gone before its catch-up");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(event_id = %event.id, error = %e, "Catch-up failed during sweep");
                    }
                }
            }
            let _ = self.events.send(SweepEvent::Progress {
                done: done + 1,
                total,
                event_id: event.id,
            });
        }

        report.duration = start.elapsed();
        info!(
            triggered = report.triggered,
            skipped = report.skipped,
            failed = report.failed,
            duration_ms = report.duration.as_millis() as u64,
            "Catch-up sweep finished"
        );
        let _ = self.events.send(SweepEvent::Completed {
            report: report.clone(),
        });
        Ok(SweepOutcome::Completed(report))
    }
}
