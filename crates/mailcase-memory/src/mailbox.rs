//! In-memory mailbox implementing [`MailStore`].
//!
//! Emulates the traits of a real mailbox that matter to the engine:
//! - entry ids and store ids are volatile and can be reissued at any time
//! - every handle is accounted for, so tests can assert that none leak
//! - the conversation filter can be rejected as unsupported
//! - individual items can be made to fault
//! - every call is counted per kind

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use mailcase_core::{
    DefaultFolder, FolderHandle, ItemFilter, ItemHandle, ItemsHandle, MailSnapshot, MailStore,
    PropertyTag, PropertyValue, RawHandle, StoreError, StoreHandle, StoreResult,
};

// =============================================================================
// SNAPSHOT FORMAT
// =============================================================================

fn default_true() -> bool {
    true
}

/// Serializable description of a mailbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxSnapshot {
    #[serde(default)]
    pub stores: Vec<StoreSnapshot>,
    /// Index into `stores` of the session's default store.
    #[serde(default)]
    pub default_store: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub store_id: String,
    #[serde(default)]
    pub inbox: FolderSnapshot,
    #[serde(default)]
    pub sent: FolderSnapshot,
    #[serde(default)]
    pub deleted: FolderSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSnapshot {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub holds_mail: bool,
    #[serde(default)]
    pub messages: Vec<MessageSnapshot>,
    #[serde(default)]
    pub children: Vec<FolderSnapshot>,
}

impl Default for FolderSnapshot {
    fn default() -> Self {
        Self {
            name: String::new(),
            holds_mail: true,
            messages: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// A stored item. `store_id` of the embedded mail is ignored; items report the
/// id of the store that holds them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSnapshot {
    #[serde(flatten)]
    pub mail: MailSnapshot,
    #[serde(default = "default_true")]
    pub is_mail: bool,
}

// =============================================================================
// INSTRUMENTATION
// =============================================================================

/// Counted store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    Stores,
    /// `resolve_by_id` with a store id.
    ResolveInStore,
    /// `resolve_by_id` without a store id.
    ResolveAnyStore,
    SearchByMessageId,
    Restrict,
    NextItem,
    Property,
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug)]
struct Message {
    mail: MailSnapshot,
    is_mail: bool,
}

#[derive(Debug)]
struct Folder {
    name: String,
    holds_mail: bool,
    store: usize,
    children: Vec<usize>,
    messages: Vec<Message>,
}

#[derive(Debug)]
struct Store {
    id: String,
    inbox: usize,
    sent: usize,
    deleted: usize,
}

#[derive(Debug)]
enum Opened {
    Store(usize),
    Folder(usize),
    Items(VecDeque<(usize, usize)>),
    Item(usize, usize),
}

#[derive(Debug, Default)]
struct State {
    stores: Vec<Store>,
    folders: Vec<Folder>,
    default_store: usize,
    open: HashMap<u64, Opened>,
    next_handle: u64,
    calls: HashMap<StoreCall, usize>,
    filters: Vec<String>,
    double_releases: usize,
    reject_conversation_filter: bool,
    message_id_search: bool,
    faulty: HashSet<String>,
    reissued: u64,
}

impl State {
    fn count(&mut self, call: StoreCall) {
        *self.calls.entry(call).or_default() += 1;
    }

    fn open(&mut self, opened: Opened) -> RawHandle {
        self.next_handle += 1;
        self.open.insert(self.next_handle, opened);
        RawHandle(self.next_handle)
    }

    fn get(&self, handle: RawHandle) -> StoreResult<&Opened> {
        self.open.get(&handle.0).ok_or(StoreError::Released)
    }

    fn store_of(&self, handle: StoreHandle) -> StoreResult<usize> {
        match self.get(handle.0)? {
            Opened::Store(index) => Ok(*index),
            _ => Err(StoreError::Transient("not a store handle".into())),
        }
    }

    fn folder_of(&self, handle: FolderHandle) -> StoreResult<usize> {
        match self.get(handle.0)? {
            Opened::Folder(index) => Ok(*index),
            _ => Err(StoreError::Transient("not a folder handle".into())),
        }
    }

    fn message_of(&self, handle: ItemHandle) -> StoreResult<&Message> {
        match self.get(handle.0)? {
            Opened::Item(folder, index) => self.folders[*folder]
                .messages
                .get(*index)
                .ok_or(StoreError::NotFound),
            _ => Err(StoreError::Transient("not an item handle".into())),
        }
    }

    fn add_folder(&mut self, snapshot: FolderSnapshot, store: usize) -> usize {
        let index = self.folders.len();
        self.folders.push(Folder {
            name: snapshot.name,
            holds_mail: snapshot.holds_mail,
            store,
            children: Vec::new(),
            messages: snapshot
                .messages
                .into_iter()
                .map(|m| Message {
                    mail: m.mail,
                    is_mail: m.is_mail,
                })
                .collect(),
        });
        for child in snapshot.children {
            let child = self.add_folder(child, store);
            self.folders[index].children.push(child);
        }
        index
    }

    fn add_store(&mut self, snapshot: StoreSnapshot) -> usize {
        let store = self.stores.len();
        let named = |mut folder: FolderSnapshot, name: &str| {
            if folder.name.is_empty() {
                folder.name = name.to_string();
            }
            folder
        };
        let inbox = self.add_folder(named(snapshot.inbox, "Inbox"), store);
        let sent = self.add_folder(named(snapshot.sent, "Sent Items"), store);
        let deleted = self.add_folder(named(snapshot.deleted, "Deleted Items"), store);
        self.stores.push(Store {
            id: snapshot.store_id,
            inbox,
            sent,
            deleted,
        });
        store
    }

    fn well_known(&self, store: usize, kind: DefaultFolder) -> usize {
        let store = &self.stores[store];
        match kind {
            DefaultFolder::Inbox => store.inbox,
            DefaultFolder::SentMail => store.sent,
            DefaultFolder::DeletedItems => store.deleted,
        }
    }

    /// Locate a message by entry id, optionally only within one store.
    fn locate(&self, entry_id: &str, store: Option<usize>) -> Option<(usize, usize)> {
        self.folders
            .iter()
            .enumerate()
            .filter(|(_, f)| store.map_or(true, |s| f.store == s))
            .find_map(|(fi, f)| {
                f.messages
                    .iter()
                    .position(|m| m.mail.entry_id == entry_id)
                    .map(|mi| (fi, mi))
            })
    }

    fn locate_message_id(&self, message_id: &str, cutoff: DateTime<Utc>) -> Option<(usize, usize)> {
        self.folders.iter().enumerate().find_map(|(fi, f)| {
            f.messages
                .iter()
                .position(|m| {
                    m.is_mail
                        && m.mail.received_at.is_some_and(|t| t >= cutoff)
                        && m
                            .mail
                            .internet_message_id
                            .as_deref()
                            .is_some_and(|id| id.eq_ignore_ascii_case(message_id))
                })
                .map(|mi| (fi, mi))
        })
    }

    fn find_folder(&self, parent: usize, name: &str) -> Option<usize> {
        self.folders[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.folders[c].name.eq_ignore_ascii_case(name))
    }
}

// =============================================================================
// MAILBOX
// =============================================================================

/// Cloneable handle to a shared in-memory mailbox.
///
/// Clones share state, so a test can hand one clone to the store owner thread
/// and inspect instrumentation through another.
#[derive(Debug, Clone)]
pub struct MemoryMailbox {
    state: Arc<Mutex<State>>,
}

impl MemoryMailbox {
    /// Build a mailbox from a snapshot. An empty snapshot gets one store.
    pub fn new(snapshot: MailboxSnapshot) -> Self {
        let mut state = State::default();
        let stores = if snapshot.stores.is_empty() {
            vec![StoreSnapshot {
                store_id: "store-default".to_string(),
                inbox: FolderSnapshot::default(),
                sent: FolderSnapshot::default(),
                deleted: FolderSnapshot::default(),
            }]
        } else {
            snapshot.stores
        };
        let count = stores.len();
        for store in stores {
            state.add_store(store);
        }
        state.default_store = snapshot.default_store.min(count - 1);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A mailbox with a single, empty store.
    pub fn with_store(store_id: impl Into<String>) -> Self {
        Self::new(MailboxSnapshot {
            stores: vec![StoreSnapshot {
                store_id: store_id.into(),
                inbox: FolderSnapshot::default(),
                sent: FolderSnapshot::default(),
                deleted: FolderSnapshot::default(),
            }],
            default_store: 0,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add another empty store.
    pub fn add_store(&self, store_id: impl Into<String>) {
        self.state().add_store(StoreSnapshot {
            store_id: store_id.into(),
            inbox: FolderSnapshot::default(),
            sent: FolderSnapshot::default(),
            deleted: FolderSnapshot::default(),
        });
    }

    /// Deliver a message to a well-known folder of the default store.
    pub fn deliver(&self, folder: DefaultFolder, mail: MailSnapshot) {
        let mut state = self.state();
        let store = state.default_store;
        let folder = state.well_known(store, folder);
        state.folders[folder].messages.push(Message { mail, is_mail: true });
    }

    /// Deliver a message to a well-known folder of a specific store.
    pub fn deliver_in_store(&self, store_id: &str, folder: DefaultFolder, mail: MailSnapshot) -> bool {
        let mut state = self.state();
        let Some(store) = state.stores.iter().position(|s| s.id == store_id) else {
            return false;
        };
        let folder = state.well_known(store, folder);
        state.folders[folder].messages.push(Message { mail, is_mail: true });
        true
    }

    /// Deliver a non-mail item (meeting request, report...) to a folder.
    pub fn deliver_item(&self, folder: DefaultFolder, mail: MailSnapshot) {
        let mut state = self.state();
        let store = state.default_store;
        let folder = state.well_known(store, folder);
        state.folders[folder].messages.push(Message { mail, is_mail: false });
    }

    /// Deliver a message to a direct subfolder of a well-known folder of the
    /// default store, creating the subfolder on first use.
    pub fn deliver_to_subfolder(&self, parent: DefaultFolder, name: &str, mail: MailSnapshot) {
        let mut state = self.state();
        let store = state.default_store;
        let parent = state.well_known(store, parent);
        let folder = match state.find_folder(parent, name) {
            Some(folder) => folder,
            None => {
                let folder = state.add_folder(
                    FolderSnapshot {
                        name: name.to_string(),
                        ..Default::default()
                    },
                    store,
                );
                state.folders[parent].children.push(folder);
                folder
            }
        };
        state.folders[folder].messages.push(Message { mail, is_mail: true });
    }

    /// Give a message a fresh entry id, as a store does after a move or a
    /// profile rebuild. Returns the new id.
    pub fn reissue_entry_id(&self, entry_id: &str) -> Option<String> {
        let mut state = self.state();
        let (folder, index) = state.locate(entry_id, None)?;
        state.reissued += 1;
        let fresh = format!("{entry_id}~{}", state.reissued);
        state.folders[folder].messages[index].mail.entry_id = fresh.clone();
        Some(fresh)
    }

    /// Delete a message outright.
    pub fn purge(&self, entry_id: &str) -> bool {
        let mut state = self.state();
        match state.locate(entry_id, None) {
            Some((folder, index)) => {
                state.folders[folder].messages.remove(index);
                true
            }
            None => false,
        }
    }

    /// Change a store's id.
    pub fn rename_store(&self, old: &str, new: impl Into<String>) -> bool {
        let mut state = self.state();
        match state.stores.iter_mut().find(|s| s.id == old) {
            Some(store) => {
                store.id = new.into();
                true
            }
            None => false,
        }
    }

    /// Make restrictions with a conversation clause fail as unsupported.
    pub fn reject_conversation_filter(&self, reject: bool) {
        self.state().reject_conversation_filter = reject;
    }

    /// Enable the native message-id search.
    pub fn enable_message_id_search(&self, enabled: bool) {
        self.state().message_id_search = enabled;
    }

    /// Make every property read of this entry id fail with a transient fault.
    pub fn fault_on(&self, entry_id: impl Into<String>) {
        self.state().faulty.insert(entry_id.into());
    }

    pub fn call_count(&self, call: StoreCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Every restriction requested so far, rendered in the store dialect.
    pub fn filters(&self) -> Vec<String> {
        self.state().filters.clone()
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state().open.len()
    }

    /// Releases of handles that were not open.
    pub fn double_releases(&self) -> usize {
        self.state().double_releases
    }
}

impl MailStore for MemoryMailbox {
    fn stores(&self) -> StoreResult<Vec<StoreHandle>> {
        let mut state = self.state();
        state.count(StoreCall::Stores);
        Ok((0..state.stores.len())
            .map(|s| StoreHandle(state.open(Opened::Store(s))))
            .collect())
    }

    fn default_store(&self) -> StoreResult<StoreHandle> {
        let mut state = self.state();
        let store = state.default_store;
        Ok(StoreHandle(state.open(Opened::Store(store))))
    }

    fn store_id(&self, store: StoreHandle) -> StoreResult<String> {
        let state = self.state();
        let index = state.store_of(store)?;
        Ok(state.stores[index].id.clone())
    }

    fn default_folder(&self, store: StoreHandle, kind: DefaultFolder) -> StoreResult<FolderHandle> {
        let mut state = self.state();
        let index = state.store_of(store)?;
        let folder = state.well_known(index, kind);
        Ok(FolderHandle(state.open(Opened::Folder(folder))))
    }

    fn folder_name(&self, folder: FolderHandle) -> StoreResult<String> {
        let state = self.state();
        let index = state.folder_of(folder)?;
        Ok(state.folders[index].name.clone())
    }

    fn holds_mail(&self, folder: FolderHandle) -> StoreResult<bool> {
        let state = self.state();
        let index = state.folder_of(folder)?;
        Ok(state.folders[index].holds_mail)
    }

    fn child_folders(&self, folder: FolderHandle) -> StoreResult<Vec<FolderHandle>> {
        let mut state = self.state();
        let index = state.folder_of(folder)?;
        let children = state.folders[index].children.clone();
        Ok(children
            .into_iter()
            .map(|c| FolderHandle(state.open(Opened::Folder(c))))
            .collect())
    }

    fn resolve_by_id(&self, entry_id: &str, store_id: Option<&str>) -> StoreResult<ItemHandle> {
        let mut state = self.state();
        let scope = match store_id {
            Some(store_id) => {
                state.count(StoreCall::ResolveInStore);
                let store = state
                    .stores
                    .iter()
                    .position(|s| s.id == store_id)
                    .ok_or(StoreError::NotFound)?;
                Some(store)
            }
            None => {
                state.count(StoreCall::ResolveAnyStore);
                None
            }
        };
        let (folder, index) = state.locate(entry_id, scope).ok_or(StoreError::NotFound)?;
        Ok(ItemHandle(state.open(Opened::Item(folder, index))))
    }

    fn search_by_message_id(
        &self,
        internet_message_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<ItemHandle> {
        let mut state = self.state();
        state.count(StoreCall::SearchByMessageId);
        if !state.message_id_search {
            return Err(StoreError::Unsupported("message-id search".to_string()));
        }
        let (folder, index) = state
            .locate_message_id(internet_message_id, cutoff)
            .ok_or(StoreError::NotFound)?;
        Ok(ItemHandle(state.open(Opened::Item(folder, index))))
    }

    fn restrict(&self, folder: FolderHandle, filter: &ItemFilter) -> StoreResult<ItemsHandle> {
        let mut state = self.state();
        state.count(StoreCall::Restrict);
        state.filters.push(filter.to_query());
        let index = state.folder_of(folder)?;
        if filter.has_conversation_clause() && state.reject_conversation_filter {
            return Err(StoreError::Unsupported("conversation filter".to_string()));
        }

        let mut hits: Vec<(usize, DateTime<Utc>)> = state.folders[index]
            .messages
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                let received = m.mail.received_at?;
                if received < filter.received_since {
                    return None;
                }
                if let Some(conversation) = &filter.conversation_id {
                    let same = m
                        .mail
                        .conversation_id
                        .as_deref()
                        .is_some_and(|c| c.eq_ignore_ascii_case(conversation));
                    if !same {
                        return None;
                    }
                }
                Some((i, received))
            })
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1));

        let queue = hits.into_iter().map(|(i, _)| (index, i)).collect();
        Ok(ItemsHandle(state.open(Opened::Items(queue))))
    }

    fn next_item(&self, items: ItemsHandle) -> StoreResult<Option<ItemHandle>> {
        let mut state = self.state();
        state.count(StoreCall::NextItem);
        let next = match state.open.get_mut(&items.0 .0) {
            Some(Opened::Items(queue)) => queue.pop_front(),
            Some(_) => return Err(StoreError::Transient("not an item collection".into())),
            None => return Err(StoreError::Released),
        };
        Ok(next.map(|(folder, index)| ItemHandle(state.open(Opened::Item(folder, index)))))
    }

    fn is_mail(&self, item: ItemHandle) -> StoreResult<bool> {
        let state = self.state();
        Ok(state.message_of(item)?.is_mail)
    }

    fn property(&self, item: ItemHandle, tag: PropertyTag) -> StoreResult<PropertyValue> {
        let mut state = self.state();
        state.count(StoreCall::Property);
        let folder = match state.get(item.0)? {
            Opened::Item(folder, _) => *folder,
            _ => return Err(StoreError::Transient("not an item handle".into())),
        };
        let message = state.message_of(item)?;
        if state.faulty.contains(&message.mail.entry_id) {
            return Err(StoreError::Transient(format!(
                "property read failed for {}",
                message.mail.entry_id
            )));
        }

        let mail = &message.mail;
        let text = |value: &Option<String>| {
            value
                .clone()
                .map(PropertyValue::Text)
                .unwrap_or(PropertyValue::Empty)
        };
        Ok(match tag {
            PropertyTag::EntryId => PropertyValue::Text(mail.entry_id.clone()),
            PropertyTag::StoreId => {
                PropertyValue::Text(state.stores[state.folders[folder].store].id.clone())
            }
            PropertyTag::InternetMessageId => text(&mail.internet_message_id),
            PropertyTag::InReplyTo => text(&mail.in_reply_to),
            PropertyTag::ConversationId => text(&mail.conversation_id),
            PropertyTag::Subject => text(&mail.subject),
            PropertyTag::Sender => text(&mail.sender),
            PropertyTag::Recipients => PropertyValue::Addresses(mail.recipients.clone()),
            PropertyTag::ReceivedTime => mail
                .received_at
                .map(PropertyValue::Time)
                .unwrap_or(PropertyValue::Empty),
        })
    }

    fn release(&self, handle: RawHandle) {
        let mut state = self.state();
        if state.open.remove(&handle.0).is_none() {
            state.double_releases += 1;
            warn!(handle = handle.0, "Release of a handle that is not open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mailcase_core::{read_snapshot, Scoped};

    fn mail(entry_id: &str, days_ago: i64) -> MailSnapshot {
        MailSnapshot {
            entry_id: entry_id.to_string(),
            internet_message_id: Some(format!("<{entry_id}@x>")),
            conversation_id: Some("conv-1".to_string()),
            received_at: Some(Utc::now() - Duration::days(days_ago)),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_and_read() {
        let mailbox = MemoryMailbox::with_store("store-a");
        mailbox.deliver(DefaultFolder::Inbox, mail("e1", 1));

        {
            let item = Scoped::new(&mailbox, mailbox.resolve_by_id("e1", Some("store-a")).unwrap());
            let snapshot = read_snapshot(&mailbox, item.get()).unwrap();
            assert_eq!(snapshot.store_id.as_deref(), Some("store-a"));
            assert_eq!(snapshot.internet_message_id.as_deref(), Some("<e1@x>"));
        }

        assert_eq!(mailbox.open_handles(), 0);
        assert_eq!(mailbox.call_count(StoreCall::ResolveInStore), 1);
        assert_eq!(mailbox.call_count(StoreCall::ResolveAnyStore), 0);
    }

    #[test]
    fn test_reissued_entry_id_no_longer_resolves() {
        let mailbox = MemoryMailbox::with_store("store-a");
        mailbox.deliver(DefaultFolder::Inbox, mail("e1", 1));
        let fresh = mailbox.reissue_entry_id("e1").unwrap();

        assert_eq!(mailbox.resolve_by_id("e1", None), Err(StoreError::NotFound));
        let item = mailbox.resolve_by_id(&fresh, None).unwrap();
        mailbox.release(item.0);
    }

    #[test]
    fn test_restrict_newest_first_with_cutoff() {
        let mailbox = MemoryMailbox::with_store("store-a");
        mailbox.deliver(DefaultFolder::Inbox, mail("old", 30));
        mailbox.deliver(DefaultFolder::Inbox, mail("mid", 3));
        mailbox.deliver(DefaultFolder::Inbox, mail("new", 1));

        let store = mailbox.default_store().unwrap();
        let inbox = mailbox.default_folder(store, DefaultFolder::Inbox).unwrap();
        let items = mailbox
            .restrict(inbox, &ItemFilter::since(Utc::now() - Duration::days(14)))
            .unwrap();

        let mut seen = Vec::new();
        while let Some(item) = mailbox.next_item(items).unwrap() {
            seen.push(read_snapshot(&mailbox, item).unwrap().entry_id);
            mailbox.release(item.0);
        }
        for handle in [items.0, inbox.0, store.0] {
            mailbox.release(handle);
        }

        assert_eq!(seen, vec!["new", "mid"]);
        assert_eq!(mailbox.open_handles(), 0);
    }

    #[test]
    fn test_rejects_conversation_filter() {
        let mailbox = MemoryMailbox::with_store("store-a");
        mailbox.reject_conversation_filter(true);
        let store = mailbox.default_store().unwrap();
        let inbox = mailbox.default_folder(store, DefaultFolder::Inbox).unwrap();

        let filter = ItemFilter::since(Utc::now()).with_conversation("conv-1");
        assert!(matches!(
            mailbox.restrict(inbox, &filter),
            Err(StoreError::Unsupported(_))
        ));
        assert_eq!(mailbox.filters().len(), 1);
    }

    #[test]
    fn test_double_release_is_counted() {
        let mailbox = MemoryMailbox::with_store("store-a");
        let store = mailbox.default_store().unwrap();
        mailbox.release(store.0);
        mailbox.release(store.0);
        assert_eq!(mailbox.double_releases(), 1);
        assert_eq!(mailbox.store_id(store), Err(StoreError::Released));
    }

    #[test]
    fn test_snapshot_json() {
        let json = r#"{
            "stores": [{
                "store_id": "s1",
                "inbox": {"messages": [{"entry_id": "e1", "subject": "Hi"}],
                          "children": [{"name": "Projects"}]}
            }]
        }"#;
        let snapshot: MailboxSnapshot = serde_json::from_str(json).unwrap();
        let mailbox = MemoryMailbox::new(snapshot);

        let store = mailbox.default_store().unwrap();
        let inbox = mailbox.default_folder(store, DefaultFolder::Inbox).unwrap();
        let children = mailbox.child_folders(inbox).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(mailbox.folder_name(children[0]).unwrap(), "Projects");
        assert_eq!(mailbox.folder_name(inbox).unwrap(), "Inbox");
    }
}
