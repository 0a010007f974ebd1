//! Integration tests for the refresh orchestrator.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

use common::{bare_event, fixture, mail, quick_config, scripted_fixture, FlakyRepository};
use mailcase_core::{DefaultFolder, Error, EventRepository};
use mailcase_sync::{
    shared_view, EventView, RefreshCoordinator, RefreshEvent, RefreshOutcome, RefreshState,
    SyncConfig,
};

/// Test that a refresh pulls new conversation mail and commits it to the view.
#[tokio::test]
async fn test_refresh_catches_up_conversation_and_commits() {
    let fx = fixture(quick_config());
    let seed = mail("seed", Some("conv-1"), "Budget 2026", "alice@a.example", &["bob@b.example"]);
    let event = fx.repo.create_from_mail(&seed, None).await.unwrap();
    fx.mailbox.deliver(
        DefaultFolder::SentMail,
        mail("reply", Some("conv-1"), "RE: Budget 2026", "bob@b.example", &["alice@a.example"]),
    );

    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), shared_view(EventView::focused(event.id)));
    let mut progress = coordinator.subscribe();

    let outcome = coordinator.refresh_event(event.id).await.unwrap();

    let RefreshOutcome::Completed(report) = outcome else {
        panic!("expected completed refresh, got {outcome:?}");
    };
    assert!(report.catch_up_confirmed);
    assert!(!report.catch_up_timed_out);
    // The seed is no longer in the mailbox; it stays a member regardless.
    assert_eq!(report.unresolved, 1);

    let view = coordinator.view().borrow().clone();
    let committed = view.event.expect("view should hold the event");
    assert_eq!(committed.emails.len(), 2);
    assert!(committed.emails.iter().any(|m| m.entry_id == "reply" && m.is_new));
    assert_eq!(*coordinator.state().borrow(), RefreshState::Completed { event_id: event.id });

    let mut notifications = Vec::new();
    while let Ok(notification) = progress.try_recv() {
        notifications.push(notification);
    }
    assert_eq!(notifications.first(), Some(&RefreshEvent::Started { event_id: event.id }));
    assert!(matches!(notifications.last(), Some(RefreshEvent::Completed { .. })));
    let percents: Vec<u8> = notifications
        .iter()
        .filter_map(|n| match n {
            RefreshEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));
}

/// Test that a manual refresh reaches conversation mail older than the
/// regular catch-up window.
#[tokio::test]
async fn test_refresh_catch_up_covers_full_history() {
    let config = quick_config();
    assert!(config.conversation_lookback_days < 30);
    let fx = fixture(config);
    let seed = mail("seed", Some("conv-1"), "Budget 2026", "alice@a.example", &["bob@b.example"]);
    let event = fx.repo.create_from_mail(&seed, None).await.unwrap();
    let mut old_reply = mail("old-reply", Some("conv-1"), "RE: Budget 2026", "bob@b.example", &["alice@a.example"]);
    old_reply.received_at = Some(Utc::now() - ChronoDuration::days(30));
    fx.mailbox.deliver(DefaultFolder::Inbox, old_reply);

    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), shared_view(EventView::focused(event.id)));
    let RefreshOutcome::Completed(report) = coordinator.refresh_event(event.id).await.unwrap() else {
        panic!("refresh should complete");
    };

    assert!(report.catch_up_confirmed);
    // Too old for subject discovery, so only the catch-up can have found it.
    assert_eq!(report.subject_matches, 0);
    let stored = fx.repo.get_by_id(event.id).await.unwrap().unwrap();
    assert!(stored.emails.iter().any(|m| m.entry_id == "old-reply"));
}

/// Test that an absurd subject lookback still yields a completed refresh.
#[tokio::test]
async fn test_oversized_subject_lookback_still_completes() {
    let mut config = quick_config().with_subject_lookback_days(1_000_000_000);
    assert_eq!(config.subject_lookback_days, mailcase_core::defaults::MAX_LOOKBACK_DAYS);
    // Fields are public, so the cutoff must cope with unclamped values too.
    config.subject_lookback_days = i64::MAX;
    let (fx, _trigger) = scripted_fixture(config);
    let seed = mail("seed", Some("conv-1"), "Budget 2026", "alice@a.example", &["bob@b.example"]);
    let event = fx.repo.create_from_mail(&seed, None).await.unwrap();

    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), shared_view(EventView::focused(event.id)));
    let outcome = coordinator.refresh_event(event.id).await.unwrap();

    assert!(matches!(outcome, RefreshOutcome::Completed(_)));
    assert_eq!(*coordinator.state().borrow(), RefreshState::Completed { event_id: event.id });
}

/// Test that a stale entry id is repaired once and the unread flag survives.
#[tokio::test]
async fn test_stale_entry_id_repaired_once_preserving_unread() {
    let fx = fixture(quick_config());
    let seed = mail("seed", None, "Budget", "alice@a.example", &["bob@b.example"]);
    fx.mailbox.deliver(DefaultFolder::Inbox, seed.clone());
    let mut event = fx.repo.create_from_mail(&seed, None).await.unwrap();
    event.mark_all_read();
    fx.repo.update(&event).await.unwrap();

    let fresh_id = fx.mailbox.reissue_entry_id("seed").unwrap();
    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), shared_view(EventView::focused(event.id)));

    let RefreshOutcome::Completed(first) = coordinator.refresh_event(event.id).await.unwrap() else {
        panic!("first refresh should complete");
    };
    assert_eq!(first.repaired, 1);
    assert_eq!(first.unresolved, 0);

    let stored = fx.repo.get_by_id(event.id).await.unwrap().unwrap();
    assert_eq!(stored.emails.len(), 1);
    assert_eq!(stored.emails[0].entry_id, fresh_id);
    assert!(!stored.emails[0].is_new);

    let RefreshOutcome::Completed(second) = coordinator.refresh_event(event.id).await.unwrap() else {
        panic!("second refresh should complete");
    };
    assert_eq!(second.validated, 1);
    assert_eq!(second.repaired, 0);
    assert_eq!(fx.mailbox.open_handles(), 0);
}

/// Test that subject discovery needs a shared participant, and that a
/// re-run neither duplicates nor resurrects members.
#[tokio::test]
async fn test_subject_discovery_requires_participant_overlap() {
    let (fx, trigger) = scripted_fixture(quick_config());

    let seed = mail("seed", Some("conv-1"), "Budget 2026", "alice@a.example", &["bob@b.example"]);
    let event = fx.repo.create_from_mail(&seed, None).await.unwrap();
    fx.mailbox.deliver(
        DefaultFolder::Inbox,
        mail("forward", Some("conv-9"), "FW: Budget 2026", "Bob@B.example", &["carol@c.example"]),
    );
    fx.mailbox.deliver(
        DefaultFolder::Inbox,
        mail("stranger", Some("conv-8"), "Budget 2026", "mallory@m.example", &["eve@e.example"]),
    );

    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), shared_view(EventView::focused(event.id)));
    let RefreshOutcome::Completed(report) = coordinator.refresh_event(event.id).await.unwrap() else {
        panic!("refresh should complete");
    };
    assert_eq!(report.subject_matches, 1);
    assert_eq!(trigger.calls(), 1);

    let stored = fx.repo.get_by_id(event.id).await.unwrap().unwrap();
    let members: Vec<&str> = stored.emails.iter().map(|m| m.entry_id.as_str()).collect();
    assert_eq!(members, vec!["seed", "forward"]);
    assert!(stored.tracks_conversation("conv-9"));

    fx.repo.remove_mail(event.id, Some("forward"), None).await.unwrap();
    let RefreshOutcome::Completed(rerun) = coordinator.refresh_event(event.id).await.unwrap() else {
        panic!("re-run should complete");
    };
    assert_eq!(rerun.subject_matches, 0);

    let stored = fx.repo.get_by_id(event.id).await.unwrap().unwrap();
    assert_eq!(stored.emails.len(), 2);
    assert!(stored.emails.iter().any(|m| m.entry_id == "forward" && m.is_removed));
}

/// Test that a superseded refresh never writes to the view.
#[tokio::test]
async fn test_superseded_refresh_never_commits() {
    let (fx, trigger) = scripted_fixture(quick_config());
    let first = fx.repo.insert(bare_event("First", "conv-a")).await.unwrap();
    let second = fx.repo.insert(bare_event("Second", "conv-b")).await.unwrap();
    trigger.hold(first.id);

    let view = shared_view(EventView::focused(first.id));
    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), view.clone());
    let mut state = coordinator.state();

    let pending = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.refresh_event(first.id).await }
    });
    state
        .wait_for(|s| *s == RefreshState::Running { event_id: first.id })
        .await
        .unwrap();

    view.send_replace(EventView::focused(second.id));
    let outcome = coordinator.refresh_event(second.id).await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::Completed(_)));

    assert_eq!(pending.await.unwrap().unwrap(), RefreshOutcome::Superseded);
    let current = view.borrow().clone();
    assert_eq!(current.event.map(|e| e.id), Some(second.id));
}

/// Test that cancel() stops a refresh without touching the view.
#[tokio::test]
async fn test_cancel_leaves_view_untouched() {
    let (fx, trigger) = scripted_fixture(quick_config());
    let event = fx.repo.insert(bare_event("Held", "conv-a")).await.unwrap();
    trigger.hold(event.id);

    let view = shared_view(EventView::focused(event.id));
    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), view.clone());
    let mut state = coordinator.state();

    let pending = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.refresh_event(event.id).await }
    });
    state
        .wait_for(|s| *s == RefreshState::Running { event_id: event.id })
        .await
        .unwrap();

    assert!(coordinator.cancel().await);
    assert_eq!(pending.await.unwrap().unwrap(), RefreshOutcome::Superseded);
    assert_eq!(*coordinator.state().borrow(), RefreshState::Cancelled { event_id: event.id });
    assert!(view.borrow().event.is_none());
    assert!(!coordinator.cancel().await);
}

/// Test that an unconfirmed catch-up times out after 45s and the refresh
/// still completes.
#[tokio::test(start_paused = true)]
async fn test_catch_up_timeout_is_not_an_error() {
    let (fx, trigger) = scripted_fixture(SyncConfig::default());
    let event = fx.repo.insert(bare_event("Quiet", "conv-a")).await.unwrap();
    trigger.hold(event.id);

    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), shared_view(EventView::focused(event.id)));
    let start = tokio::time::Instant::now();
    let outcome = coordinator.refresh_event(event.id).await.unwrap();

    let RefreshOutcome::Completed(report) = outcome else {
        panic!("expected completed refresh, got {outcome:?}");
    };
    assert!(report.catch_up_timed_out);
    assert!(!report.catch_up_confirmed);
    assert!(start.elapsed() >= Duration::from_secs(45));
    assert!(coordinator.view().borrow().event.is_some());
}

/// Test that moving focus away while a refresh runs discards its result.
#[tokio::test(start_paused = true)]
async fn test_focus_change_discards_result() {
    let (fx, trigger) = scripted_fixture(SyncConfig::default());
    let event = fx.repo.insert(bare_event("Left behind", "conv-a")).await.unwrap();
    trigger.hold(event.id);

    let view = shared_view(EventView::focused(event.id));
    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), view.clone());
    let mut state = coordinator.state();

    let pending = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.refresh_event(event.id).await }
    });
    state
        .wait_for(|s| *s == RefreshState::Running { event_id: event.id })
        .await
        .unwrap();
    view.send_replace(EventView::focused(Uuid::new_v4()));

    let outcome = pending.await.unwrap().unwrap();
    assert!(matches!(outcome, RefreshOutcome::Discarded(_)));
    assert!(view.borrow().event.is_none());
}

/// Test that refreshing an unknown event reports it missing.
#[tokio::test]
async fn test_missing_event() {
    let fx = fixture(quick_config());
    let id = Uuid::new_v4();
    let coordinator = RefreshCoordinator::new(fx.ctx.clone(), shared_view(EventView::focused(id)));

    let outcome = coordinator.refresh_event(id).await.unwrap();

    assert_eq!(outcome, RefreshOutcome::EventMissing);
    assert!(coordinator.state().borrow().is_idle());
}

/// Test that a repository failure at commit is surfaced to the caller.
#[tokio::test]
async fn test_commit_failure_is_surfaced() {
    let event = bare_event("Flaky", "conv-a");
    let repo = FlakyRepository::new(vec![event.clone()]);
    let ctx = FlakyRepository::context(&repo, quick_config());

    repo.fail_reads.store(true, Ordering::SeqCst);
    let coordinator = RefreshCoordinator::new(ctx, shared_view(EventView::focused(event.id)));
    let result = coordinator.refresh_event(event.id).await;

    assert!(matches!(result, Err(Error::Repository(_))));
    assert!(matches!(*coordinator.state().borrow(), RefreshState::Failed { .. }));
}

/// Test that a refresh that dies mid-run leaves a terminal state and does not
/// block the next refresh.
#[tokio::test]
async fn test_crashed_refresh_ends_failed() {
    let event = bare_event("Crashy", "conv-a");
    let repo = FlakyRepository::new(vec![event.clone()]);
    let config = quick_config().with_catch_up_timeout(Duration::from_millis(200));
    let ctx = FlakyRepository::context(&repo, config);
    let coordinator = RefreshCoordinator::new(ctx, shared_view(EventView::focused(event.id)));
    let mut progress = coordinator.subscribe();

    repo.panic_reads.store(true, Ordering::SeqCst);
    let result = coordinator.refresh_event(event.id).await;

    assert!(matches!(result, Err(Error::Internal(_))));
    assert!(matches!(
        *coordinator.state().borrow(),
        RefreshState::Failed { event_id, .. } if event_id == event.id
    ));
    let mut failed = false;
    while let Ok(notification) = progress.try_recv() {
        failed |= matches!(notification, RefreshEvent::Failed { .. });
    }
    assert!(failed);

    repo.panic_reads.store(false, Ordering::SeqCst);
    let outcome = coordinator.refresh_event(event.id).await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::Completed(_)));
    assert_eq!(*coordinator.state().borrow(), RefreshState::Completed { event_id: event.id });
}
