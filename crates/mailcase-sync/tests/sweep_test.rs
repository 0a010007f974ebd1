//! Integration tests for the bulk catch-up sweep.

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{bare_event, fixture, mail, quick_config};
use mailcase_core::{
    CatchUpTrigger, DefaultFolder, Error, Event, EventId, EventRepository, Result,
};
use mailcase_sync::{CatchUpSweep, SweepEvent, SweepOutcome};

/// Test that a sweep catches up open events only and skips subject discovery.
#[tokio::test]
async fn test_sweep_catches_up_open_events_only() {
    let fx = fixture(quick_config());
    let seed = mail("seed", Some("conv-1"), "Budget 2026", "alice@a.example", &["bob@b.example"]);
    let open = fx.repo.create_from_mail(&seed, None).await.unwrap();
    let mut archived = bare_event("Archived", "conv-2");
    archived.archive();
    let archived = fx.repo.insert(archived).await.unwrap();
    let untracked = fx.repo.insert(Event::new("Untracked")).await.unwrap();

    fx.mailbox.deliver(
        DefaultFolder::Inbox,
        mail("reply", Some("conv-1"), "RE: Budget 2026", "bob@b.example", &["alice@a.example"]),
    );
    fx.mailbox.deliver(
        DefaultFolder::Inbox,
        mail("late", Some("conv-2"), "Archived thread", "carol@c.example", &["dan@d.example"]),
    );
    // Same subject and participants but another conversation: only a manual
    // refresh would pick this up.
    fx.mailbox.deliver(
        DefaultFolder::Inbox,
        mail("sibling", Some("conv-7"), "Budget 2026", "bob@b.example", &["alice@a.example"]),
    );

    let sweep = CatchUpSweep::new(fx.ctx.clone());
    let mut progress = sweep.subscribe();
    let SweepOutcome::Completed(report) = sweep.run().await.unwrap() else {
        panic!("sweep should complete");
    };

    assert_eq!(report.considered, 3);
    assert_eq!(report.triggered, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed, 0);

    let open = fx.repo.get_by_id(open.id).await.unwrap().unwrap();
    let members: Vec<&str> = open.emails.iter().map(|m| m.entry_id.as_str()).collect();
    assert_eq!(members, vec!["seed", "reply"]);
    let archived = fx.repo.get_by_id(archived.id).await.unwrap().unwrap();
    assert!(archived.emails.is_empty());
    let untracked = fx.repo.get_by_id(untracked.id).await.unwrap().unwrap();
    assert!(untracked.emails.is_empty());

    let mut done = Vec::new();
    while let Ok(event) = progress.try_recv() {
        if let SweepEvent::Progress { done: n, .. } = event {
            done.push(n);
        }
    }
    assert_eq!(done, vec![1, 2, 3]);
}

/// Trigger whose first call never finishes.
struct StallFirst {
    calls: AtomicUsize,
}

#[async_trait]
impl CatchUpTrigger for StallFirst {
    async fn trigger_catch_up(
        &self,
        _event_id: EventId,
        _conversation_ids: &[String],
        _run_immediately: bool,
        _timeout: Option<Duration>,
        _use_full_history: bool,
    ) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Test that starting a sweep supersedes the one in progress.
#[tokio::test]
async fn test_new_sweep_supersedes_running_one() {
    let mut fx = fixture(quick_config());
    fx.ctx.catch_up = Arc::new(StallFirst {
        calls: AtomicUsize::new(0),
    });
    fx.repo.insert(bare_event("One", "conv-1")).await.unwrap();

    let sweep = CatchUpSweep::new(fx.ctx.clone());
    let mut progress = sweep.subscribe();
    let stalled = tokio::spawn({
        let sweep = sweep.clone();
        async move { sweep.run().await }
    });
    loop {
        if let SweepEvent::Started { .. } = progress.recv().await.unwrap() {
            break;
        }
    }

    let outcome = sweep.run().await.unwrap();
    assert!(matches!(outcome, SweepOutcome::Completed(ref r) if r.triggered == 1));
    assert!(matches!(stalled.await.unwrap().unwrap(), SweepOutcome::Superseded(_)));
    assert!(!sweep.cancel().await);
}

/// Trigger that fails every call, either because the event is gone or
/// because the backend is down.
struct Failing {
    gone: bool,
}

#[async_trait]
impl CatchUpTrigger for Failing {
    async fn trigger_catch_up(
        &self,
        event_id: EventId,
        _conversation_ids: &[String],
        _run_immediately: bool,
        _timeout: Option<Duration>,
        _use_full_history: bool,
    ) -> Result<()> {
        if self.gone {
            Err(Error::EventNotFound(event_id))
        } else {
            Err(Error::Repository("catch-up backend offline".to_string()))
        }
    }
}

/// Test that an event deleted mid-sweep is skipped while real faults count
/// as failures.
#[tokio::test]
async fn test_sweep_separates_vanished_events_from_failures() {
    for (gone, skipped, failed) in [(true, 1, 0), (false, 0, 1)] {
        let mut fx = fixture(quick_config());
        fx.ctx.catch_up = Arc::new(Failing { gone });
        fx.repo.insert(bare_event("One", "conv-1")).await.unwrap();

        let SweepOutcome::Completed(report) = CatchUpSweep::new(fx.ctx.clone()).run().await.unwrap()
        else {
            panic!("sweep should complete");
        };
        assert_eq!(report.triggered, 0);
        assert_eq!(report.skipped, skipped);
        assert_eq!(report.failed, failed);
    }
}
