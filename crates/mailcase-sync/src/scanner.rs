//! Folder scanner.
//!
//! Enumerates candidate mail from a folder (optionally its subtree) within a
//! received-time window, newest-first per folder. Conversation filtering is
//! pushed down to the store while the store accepts it; after the first
//! rejection the capability is downgraded for the whole process and the
//! conversation is matched in memory instead.
//!
//! Runs on the store owner thread. Every handle the scan opens is held in a
//! [`Scoped`] guard, so dropping a [`Scan`] at any point releases everything.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use mailcase_core::{
    read_snapshot, DefaultFolder, FolderHandle, ItemFilter, ItemHandle, ItemsHandle, MailSnapshot,
    MailStore, Scoped, StoreError, StoreHandle, StoreResult,
};

use crate::capability::FilterCapabilities;

/// How far below the starting folder a scan descends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// The folder itself.
    Folder,
    /// The folder and its direct children.
    Children,
    /// The whole subtree.
    Subtree,
}

impl Depth {
    fn descends_below(self, level: usize) -> bool {
        match self {
            Depth::Folder => false,
            Depth::Children => level == 0,
            Depth::Subtree => true,
        }
    }
}

/// Counters for a finished or abandoned scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub folders: usize,
    pub items: usize,
    pub yielded: usize,
    pub faults: usize,
}

/// Creates scans against one store.
pub struct FolderScanner<'s> {
    store: &'s dyn MailStore,
    capabilities: Arc<FilterCapabilities>,
    cancel: CancellationToken,
}

impl<'s> FolderScanner<'s> {
    pub fn new(
        store: &'s dyn MailStore,
        capabilities: Arc<FilterCapabilities>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            capabilities,
            cancel,
        }
    }

    /// Scan `folder`, taking ownership of its handle.
    pub fn scan(
        &self,
        folder: Scoped<'s, FolderHandle>,
        cutoff: DateTime<Utc>,
        conversation_id: Option<&str>,
        depth: Depth,
    ) -> Scan<'s> {
        Scan {
            store: self.store,
            capabilities: self.capabilities.clone(),
            cancel: self.cancel.clone(),
            cutoff,
            conversation_id: conversation_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from),
            depth,
            pending: vec![(folder, 0)],
            current: None,
            stats: ScanStats::default(),
        }
    }

    /// Scan a store's Inbox (whole subtree), Sent Items and Deleted Items,
    /// collecting distinct messages.
    pub fn scan_mail_folders(
        &self,
        store: StoreHandle,
        cutoff: DateTime<Utc>,
        conversation_id: Option<&str>,
    ) -> StoreResult<(Vec<MailSnapshot>, ScanStats)> {
        let plan = [
            (DefaultFolder::Inbox, Depth::Subtree),
            (DefaultFolder::SentMail, Depth::Folder),
            (DefaultFolder::DeletedItems, Depth::Folder),
        ];

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut totals = ScanStats::default();

        for (kind, depth) in plan {
            if self.cancel.is_cancelled() {
                break;
            }
            let folder = match self.store.default_folder(store, kind) {
                Ok(folder) => Scoped::new(self.store, folder),
                Err(e) => {
                    debug!(folder = %kind, error = %e, "Default folder unavailable, skipping");
                    continue;
                }
            };
            let mut scan = self.scan(folder, cutoff, conversation_id, depth);
            for mail in scan.by_ref() {
                if seen.insert(mail.entry_id.clone()) {
                    found.push(mail);
                }
            }
            let stats = scan.stats();
            totals.folders += stats.folders;
            totals.items += stats.items;
            totals.yielded += stats.yielded;
            totals.faults += stats.faults;
        }

        Ok((found, totals))
    }
}

/// The folder currently being enumerated.
struct Cursor<'s> {
    items: Scoped<'s, ItemsHandle>,
    // Held so the folder outlives its item collection.
    _folder: Scoped<'s, FolderHandle>,
    name: String,
    post_filter: bool,
}

/// A lazy, finite scan. Yields owned snapshots; item handles never escape.
pub struct Scan<'s> {
    store: &'s dyn MailStore,
    capabilities: Arc<FilterCapabilities>,
    cancel: CancellationToken,
    cutoff: DateTime<Utc>,
    conversation_id: Option<String>,
    depth: Depth,
    pending: Vec<(Scoped<'s, FolderHandle>, usize)>,
    current: Option<Cursor<'s>>,
    stats: ScanStats,
}

impl<'s> Scan<'s> {
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Restrict a folder, downgrading the conversation filter on rejection.
    fn restrict(&self, folder: FolderHandle, name: &str) -> StoreResult<(ItemsHandle, bool)> {
        let time_only = ItemFilter::since(self.cutoff);

        let Some(conversation_id) = self.conversation_id.as_deref() else {
            return Ok((self.store.restrict(folder, &time_only)?, false));
        };
        if !self.capabilities.supports_conversation_filter() {
            return Ok((self.store.restrict(folder, &time_only)?, true));
        }

        let filter = time_only.clone().with_conversation(conversation_id);
        match self.store.restrict(folder, &filter) {
            Ok(items) => Ok((items, false)),
            Err(StoreError::Unsupported(reason)) => {
                if self.capabilities.mark_conversation_filter_unsupported() {
                    warn!(
                        folder = name,
                        reason = %reason,
                        "Store rejected the conversation filter; using time-only filtering from now on"
                    );
                }
                Ok((self.store.restrict(folder, &time_only)?, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Open the next pending folder. Returns `false` when none is left.
    fn advance_folder(&mut self) -> bool {
        while let Some((folder, level)) = self.pending.pop() {
            let handle = folder.get();
            let name = self.store.folder_name(handle).unwrap_or_default();

            if self.depth.descends_below(level) {
                match self.store.child_folders(handle) {
                    // Reversed so children are visited in store order.
                    Ok(children) => self.pending.extend(
                        Scoped::all(self.store, children)
                            .into_iter()
                            .rev()
                            .map(|child| (child, level + 1)),
                    ),
                    Err(e) => debug!(folder = %name, error = %e, "Could not list child folders"),
                }
            }

            match self.store.holds_mail(handle) {
                Ok(true) => {}
                Ok(false) => {
                    trace!(folder = %name, "Skipping non-mail folder");
                    continue;
                }
                Err(e) => {
                    debug!(folder = %name, error = %e, "Could not inspect folder, skipping");
                    continue;
                }
            }

            match self.restrict(handle, &name) {
                Ok((items, post_filter)) => {
                    self.stats.folders += 1;
                    trace!(folder = %name, post_filter, "Scanning folder");
                    self.current = Some(Cursor {
                        items: Scoped::new(self.store, items),
                        _folder: folder,
                        name,
                        post_filter,
                    });
                    return true;
                }
                Err(e) => {
                    warn!(folder = %name, error = %e, "Folder restriction failed, skipping");
                }
            }
        }
        false
    }

    /// Read one item. `Ok(None)` for items that are not mail or are filtered out.
    fn read(&self, item: ItemHandle, post_filter: bool) -> StoreResult<Option<MailSnapshot>> {
        if !self.store.is_mail(item)? {
            return Ok(None);
        }
        let mail = read_snapshot(self.store, item)?;
        if post_filter {
            let wanted = self.conversation_id.as_deref().unwrap_or_default();
            let same = mail
                .conversation_id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(wanted));
            if !same {
                return Ok(None);
            }
        }
        Ok(Some(mail))
    }
}

impl Iterator for Scan<'_> {
    type Item = MailSnapshot;

    fn next(&mut self) -> Option<MailSnapshot> {
        loop {
            if self.cancel.is_cancelled() {
                self.current = None;
                self.pending.clear();
                return None;
            }

            if self.current.is_none() && !self.advance_folder() {
                return None;
            }
            let Some(cursor) = self.current.as_ref() else {
                continue;
            };

            let next = self.store.next_item(cursor.items.get());
            match next {
                Ok(Some(item)) => {
                    let item = Scoped::new(self.store, item);
                    self.stats.items += 1;
                    match self.read(item.get(), cursor.post_filter) {
                        Ok(Some(mail)) => {
                            self.stats.yielded += 1;
                            return Some(mail);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.stats.faults += 1;
                            debug!(folder = %cursor.name, error = %e, "Skipping unreadable item");
                        }
                    }
                }
                Ok(None) => self.current = None,
                Err(e) => {
                    warn!(folder = %cursor.name, error = %e, "Item enumeration failed, abandoning folder");
                    self.current = None;
                }
            }
        }
    }
}
