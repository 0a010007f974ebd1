//! In-process conversation catch-up.
//!
//! Pulls messages of an event's tracked conversations from the default
//! store's Inbox (whole subtree), Sent Items and Deleted Items, and merges
//! them into the event through the repository. Each merge is published on
//! the repository's change feed, which is what a waiting refresh observes.
//! Catch-up never does subject discovery.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use mailcase_core::{
    CatchUpTrigger, Error, EventId, EventRepository, MailSnapshot, MergeOutcome, Result, Scoped,
};

use crate::capability::FilterCapabilities;
use crate::config::{lookback_cutoff, SyncConfig};
use crate::scanner::FolderScanner;
use crate::worker::StoreClient;

/// Counters of one catch-up run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub scanned: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Soft-removed members seen again; never re-added implicitly.
    pub skipped_removed: usize,
}

/// Conversation catch-up against the store owned by a [`StoreClient`].
#[derive(Clone)]
pub struct ConversationCatchUp {
    client: StoreClient,
    repository: Arc<dyn EventRepository>,
    capabilities: Arc<FilterCapabilities>,
    config: SyncConfig,
}

impl ConversationCatchUp {
    pub fn new(client: StoreClient, repository: Arc<dyn EventRepository>) -> Self {
        Self {
            client,
            repository,
            capabilities: FilterCapabilities::global(),
            config: SyncConfig::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Arc<FilterCapabilities>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Run a catch-up to completion.
    #[instrument(skip(self, conversation_ids), fields(conversations = conversation_ids.len()))]
    pub async fn run(
        &self,
        event_id: EventId,
        conversation_ids: &[String],
        use_full_history: bool,
    ) -> Result<CatchUpReport> {
        let start = Instant::now();
        let mut seen = HashSet::new();
        let conversation_ids: Vec<String> = conversation_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.to_lowercase()))
            .collect();
        if conversation_ids.is_empty() {
            return Ok(CatchUpReport::default());
        }

        let days = if use_full_history {
            self.config.full_history_lookback_days
        } else {
            self.config.conversation_lookback_days
        };
        let cutoff = lookback_cutoff(days);

        let capabilities = self.capabilities.clone();
        let found: Vec<MailSnapshot> = self
            .client
            .run(move |store| -> Result<Vec<MailSnapshot>> {
                let root = Scoped::new(store, store.default_store()?);
                let scanner = FolderScanner::new(store, capabilities, CancellationToken::new());
                let mut entries = HashSet::new();
                let mut found = Vec::new();
                for conversation_id in &conversation_ids {
                    let (mail, _) = scanner.scan_mail_folders(root.get(), cutoff, Some(conversation_id.as_str()))?;
                    found.extend(mail.into_iter().filter(|m| entries.insert(m.entry_id.clone())));
                }
                Ok(found)
            })
            .await??;

        let event = self
            .repository
            .get_by_id(event_id)
            .await?
            .ok_or(Error::EventNotFound(event_id))?;

        let mut report = CatchUpReport {
            scanned: found.len(),
            ..Default::default()
        };
        for mail in &found {
            let removed = event
                .find_mail(mail.internet_message_id.as_deref(), Some(mail.entry_id.as_str()))
                .is_some_and(|existing| existing.is_removed);
            if removed {
                report.skipped_removed += 1;
                continue;
            }
            match self.repository.add_or_merge_mail(event_id, mail).await?.outcome {
                MergeOutcome::Added | MergeOutcome::Restored => report.added += 1,
                MergeOutcome::Updated => report.updated += 1,
                MergeOutcome::Unchanged => report.unchanged += 1,
            }
        }

        info!(
            %event_id,
            scanned = report.scanned,
            added = report.added,
            updated = report.updated,
            skipped_removed = report.skipped_removed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Conversation catch-up finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl CatchUpTrigger for ConversationCatchUp {
    async fn trigger_catch_up(
        &self,
        event_id: EventId,
        conversation_ids: &[String],
        run_immediately: bool,
        timeout: Option<Duration>,
        use_full_history: bool,
    ) -> Result<()> {
        let this = self.clone();
        let conversation_ids = conversation_ids.to_vec();
        let task = tokio::spawn(async move {
            let result = this.run(event_id, &conversation_ids, use_full_history).await;
            if let Err(e) = &result {
                warn!(%event_id, error = %e, "Conversation catch-up failed");
            }
            result
        });

        if !run_immediately {
            debug!(%event_id, "Conversation catch-up scheduled");
            return Ok(());
        }

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!(%event_id, timeout_ms = limit.as_millis() as u64, "Catch-up still running after timeout");
                    return Ok(());
                }
            },
            None => task.await,
        };
        joined
            .map_err(|e| Error::Internal(format!("catch-up task failed: {e}")))?
            .map(|_| ())
    }
}
