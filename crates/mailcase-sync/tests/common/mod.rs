//! Shared fixtures for the sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use mailcase_core::{
    CatchUpTrigger, Error, Event, EventChange, EventEdit, EventId, EventRepository, MailMerge,
    MailSnapshot, Result,
};
use mailcase_memory::{MemoryEventRepository, MemoryMailbox};
use mailcase_sync::{FilterCapabilities, StoreClient, StoreWorker, SyncConfig, SyncContext};

pub const STORE: &str = "store-a";

/// A mail received a day ago in the test store.
pub fn mail(
    entry_id: &str,
    conversation: Option<&str>,
    subject: &str,
    sender: &str,
    recipients: &[&str],
) -> MailSnapshot {
    MailSnapshot {
        entry_id: entry_id.to_string(),
        store_id: Some(STORE.to_string()),
        internet_message_id: Some(format!("<{entry_id}@mail.example>")),
        conversation_id: conversation.map(String::from),
        subject: Some(subject.to_string()),
        sender: Some(sender.to_string()),
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        received_at: Some(Utc::now() - ChronoDuration::days(1)),
        ..Default::default()
    }
}

pub struct Fixture {
    pub mailbox: MemoryMailbox,
    pub repo: Arc<MemoryEventRepository>,
    pub client: StoreClient,
    pub ctx: SyncContext,
}

/// Mailbox, repository and an in-process catch-up wired together.
pub fn fixture(config: SyncConfig) -> Fixture {
    let mailbox = MemoryMailbox::with_store(STORE);
    let repo = Arc::new(MemoryEventRepository::new());
    let client = StoreWorker::spawn(mailbox.clone()).unwrap();
    let ctx = SyncContext::in_process(
        client.clone(),
        repo.clone(),
        Arc::new(FilterCapabilities::new()),
        config,
    );
    Fixture {
        mailbox,
        repo,
        client,
        ctx,
    }
}

/// Same as [`fixture`] but with a [`ScriptedCatchUp`] standing in for the
/// in-process catch-up.
pub fn scripted_fixture(config: SyncConfig) -> (Fixture, Arc<ScriptedCatchUp>) {
    let mut fixture = fixture(config);
    let trigger = ScriptedCatchUp::new(fixture.repo.clone());
    fixture.ctx.catch_up = trigger.clone() as Arc<dyn CatchUpTrigger>;
    (fixture, trigger)
}

pub fn quick_config() -> SyncConfig {
    SyncConfig::default().with_catch_up_timeout(Duration::from_secs(10))
}

/// Catch-up trigger that confirms by touching the event, unless the event
/// is held, in which case it never confirms.
pub struct ScriptedCatchUp {
    repo: Arc<MemoryEventRepository>,
    held: Mutex<HashSet<EventId>>,
    calls: AtomicUsize,
}

impl ScriptedCatchUp {
    pub fn new(repo: Arc<MemoryEventRepository>) -> Arc<Self> {
        Arc::new(Self {
            repo,
            held: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn hold(&self, event_id: EventId) {
        self.held.lock().unwrap().insert(event_id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatchUpTrigger for ScriptedCatchUp {
    async fn trigger_catch_up(
        &self,
        event_id: EventId,
        _conversation_ids: &[String],
        _run_immediately: bool,
        _timeout: Option<Duration>,
        _use_full_history: bool,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.held.lock().unwrap().contains(&event_id) {
            return Ok(());
        }
        let event = self
            .repo
            .get_by_id(event_id)
            .await?
            .ok_or(Error::EventNotFound(event_id))?;
        self.repo.update(&event).await?;
        Ok(())
    }
}

/// Repository whose reads can be switched to fail, or to panic.
pub struct FlakyRepository {
    pub inner: MemoryEventRepository,
    pub fail_reads: AtomicBool,
    pub panic_reads: AtomicBool,
}

impl FlakyRepository {
    pub fn new(events: Vec<Event>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryEventRepository::with_events(events),
            fail_reads: AtomicBool::new(false),
            panic_reads: AtomicBool::new(false),
        })
    }

    /// A context over an empty mailbox that reads events from `repo`.
    pub fn context(repo: &Arc<Self>, config: SyncConfig) -> SyncContext {
        let mailbox = MemoryMailbox::with_store(STORE);
        let client = StoreWorker::spawn(mailbox).unwrap();
        SyncContext::in_process(client, repo.clone(), Arc::new(FilterCapabilities::new()), config)
    }
}

#[async_trait]
impl EventRepository for FlakyRepository {
    async fn get_by_id(&self, id: EventId) -> Result<Option<Event>> {
        if self.panic_reads.load(Ordering::SeqCst) {
            panic!("event store connection poisoned");
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Repository("connection reset".to_string()));
        }
        self.inner.get_by_id(id).await
    }

    async fn list(&self) -> Result<Vec<Event>> {
        self.inner.list().await
    }

    async fn update(&self, event: &Event) -> Result<Event> {
        self.inner.update(event).await
    }

    async fn update_with(&self, event_id: EventId, edit: EventEdit) -> Result<Event> {
        self.inner.update_with(event_id, edit).await
    }

    async fn add_or_merge_mail(&self, event_id: EventId, mail: &MailSnapshot) -> Result<MailMerge> {
        self.inner.add_or_merge_mail(event_id, mail).await
    }

    async fn repair_mail(
        &self,
        event_id: EventId,
        mail: &MailSnapshot,
        is_new: bool,
    ) -> Result<MailMerge> {
        self.inner.repair_mail(event_id, mail, is_new).await
    }

    async fn create_from_mail(&self, mail: &MailSnapshot, title: Option<String>) -> Result<Event> {
        self.inner.create_from_mail(mail, title).await
    }

    async fn remove_mail(
        &self,
        event_id: EventId,
        entry_id: Option<&str>,
        internet_message_id: Option<&str>,
    ) -> Result<Event> {
        self.inner
            .remove_mail(event_id, entry_id, internet_message_id)
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<EventChange> {
        self.inner.subscribe()
    }
}

/// An open event tracking `conversation` with no members.
pub fn bare_event(title: &str, conversation: &str) -> Event {
    let mut event = Event::new(title);
    event.track_conversation(conversation);
    event
}
