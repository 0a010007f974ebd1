//! Identity resolver: persisted mail reference to live message.
//!
//! Strategies run in order and the first success wins:
//! 1. entry id within the recorded store
//! 2. entry id in any store
//! 3. message-id search across all stores, bounded by a lookback window
//!
//! A store fault inside a strategy is that strategy's failure. An exhausted
//! chain is an ordinary outcome, not an error.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use mailcase_core::{
    read_snapshot, DefaultFolder, ItemHandle, MailRef, MailSnapshot, MailStore, Scoped, StoreError,
    StoreHandle, StoreResult,
};

use crate::capability::FilterCapabilities;
use crate::config::lookback_cutoff;
use crate::scanner::{Depth, FolderScanner};

/// Which strategy resolved a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStrategy {
    EntryInStore,
    EntryAnyStore,
    MessageIdSearch,
}

impl fmt::Display for ResolveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveStrategy::EntryInStore => write!(f, "entry_in_store"),
            ResolveStrategy::EntryAnyStore => write!(f, "entry_any_store"),
            ResolveStrategy::MessageIdSearch => write!(f, "message_id_search"),
        }
    }
}

/// A resolved live message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub mail: MailSnapshot,
    pub strategy: ResolveStrategy,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Resolves mail references against one store. Runs on the store owner thread.
pub struct IdentityResolver<'s> {
    store: &'s dyn MailStore,
    capabilities: Arc<FilterCapabilities>,
    cancel: CancellationToken,
    message_id_lookback_days: i64,
}

impl<'s> IdentityResolver<'s> {
    pub fn new(
        store: &'s dyn MailStore,
        capabilities: Arc<FilterCapabilities>,
        cancel: CancellationToken,
        message_id_lookback_days: i64,
    ) -> Self {
        Self {
            store,
            capabilities,
            cancel,
            message_id_lookback_days,
        }
    }

    /// Resolve a reference, or `None` when every strategy failed.
    pub fn resolve(&self, mail: &MailRef) -> Option<Resolution> {
        let entry_id = non_blank(Some(mail.entry_id.as_str()));
        let store_id = non_blank(mail.store_id.as_deref());
        let message_id = non_blank(mail.internet_message_id.as_deref());

        if let (Some(entry_id), Some(store_id)) = (entry_id, store_id) {
            let attempt = self.read_resolved(self.store.resolve_by_id(entry_id, Some(store_id)));
            if let Some(found) = self.finish(attempt, ResolveStrategy::EntryInStore, entry_id) {
                return Some(found);
            }
        }

        if let Some(entry_id) = entry_id {
            let attempt = self.read_resolved(self.store.resolve_by_id(entry_id, None));
            if let Some(found) = self.finish(attempt, ResolveStrategy::EntryAnyStore, entry_id) {
                return Some(found);
            }
        }

        if let Some(message_id) = message_id {
            let attempt = self.search_by_message_id(message_id);
            if let Some(found) = self.finish(attempt, ResolveStrategy::MessageIdSearch, message_id) {
                return Some(found);
            }
        }

        debug!(entry_id = %mail.entry_id, "Reference could not be resolved");
        None
    }

    fn finish(
        &self,
        attempt: StoreResult<MailSnapshot>,
        strategy: ResolveStrategy,
        key: &str,
    ) -> Option<Resolution> {
        match attempt {
            Ok(mail) => {
                trace!(%strategy, key, "Resolved");
                Some(Resolution { mail, strategy })
            }
            Err(e) => {
                debug!(%strategy, key, error = %e, "Resolve strategy failed");
                None
            }
        }
    }

    fn read_resolved(&self, item: StoreResult<ItemHandle>) -> StoreResult<MailSnapshot> {
        let item = Scoped::new(self.store, item?);
        read_snapshot(self.store, item.get())
    }

    fn search_by_message_id(&self, message_id: &str) -> StoreResult<MailSnapshot> {
        let cutoff = lookback_cutoff(self.message_id_lookback_days);
        match self.store.search_by_message_id(message_id, cutoff) {
            Ok(item) => self.read_resolved(Ok(item)),
            Err(StoreError::Unsupported(_)) => self.scan_for_message_id(message_id, cutoff),
            Err(e) => Err(e),
        }
    }

    /// Bounded folder scan used when the store has no native message-id
    /// search: per store, Inbox and its direct children, then Sent Items,
    /// then Deleted Items.
    fn scan_for_message_id(&self, message_id: &str, cutoff: DateTime<Utc>) -> StoreResult<MailSnapshot> {
        let scanner = FolderScanner::new(self.store, self.capabilities.clone(), self.cancel.clone());
        let stores = Scoped::all(self.store, self.store.stores()?);

        for store in &stores {
            if let Some(found) = self.scan_store(&scanner, store.get(), message_id, cutoff) {
                return Ok(found);
            }
        }
        Err(StoreError::NotFound)
    }

    fn scan_store(
        &self,
        scanner: &FolderScanner<'s>,
        store: StoreHandle,
        message_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Option<MailSnapshot> {
        let plan = [
            (DefaultFolder::Inbox, Depth::Children),
            (DefaultFolder::SentMail, Depth::Folder),
            (DefaultFolder::DeletedItems, Depth::Folder),
        ];
        for (kind, depth) in plan {
            if self.cancel.is_cancelled() {
                return None;
            }
            let folder = match self.store.default_folder(store, kind) {
                Ok(folder) => Scoped::new(self.store, folder),
                Err(e) => {
                    trace!(folder = %kind, error = %e, "Folder unavailable for message-id search");
                    continue;
                }
            };
            let found = scanner.scan(folder, cutoff, None, depth).find(|mail| {
                mail.internet_message_id
                    .as_deref()
                    .is_some_and(|id| id.trim().eq_ignore_ascii_case(message_id))
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }
}
