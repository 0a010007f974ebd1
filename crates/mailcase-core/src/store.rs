//! Mail store adapter contract.
//!
//! The mailbox is an external, mutable store that hands out opaque handles
//! with hard per-process ceilings. Everything here is synchronous: a store is
//! owned by exactly one thread and every handle obtained from it must be
//! released on every exit path. [`Scoped`] is how the engine guarantees that.

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::models::MailSnapshot;

/// Store-level failure taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The item or folder does not exist (or no longer exists).
    #[error("item not found")]
    NotFound,

    /// The store declined an optional capability (e.g. a filter clause).
    #[error("operation not supported by store: {0}")]
    Unsupported(String),

    /// A fault while talking to the store about a single item.
    #[error("transient store fault: {0}")]
    Transient(String),

    /// A handle was used after it was released.
    #[error("handle already released")]
    Released,
}

/// Result alias for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// =============================================================================
// HANDLES
// =============================================================================

/// Untyped handle id, as seen by [`MailStore::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

/// A typed store handle.
pub trait Handle: Copy + fmt::Debug {
    fn raw(self) -> RawHandle;
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub RawHandle);

        impl Handle for $name {
            fn raw(self) -> RawHandle {
                self.0
            }
        }
    };
}

typed_handle!(
    /// An open message store.
    StoreHandle
);
typed_handle!(
    /// An open folder.
    FolderHandle
);
typed_handle!(
    /// A filtered, newest-first item collection.
    ItemsHandle
);
typed_handle!(
    /// A single item (not necessarily a mail message).
    ItemHandle
);

/// Well-known folders of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultFolder {
    Inbox,
    SentMail,
    DeletedItems,
}

impl fmt::Display for DefaultFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultFolder::Inbox => write!(f, "inbox"),
            DefaultFolder::SentMail => write!(f, "sent"),
            DefaultFolder::DeletedItems => write!(f, "deleted"),
        }
    }
}

// =============================================================================
// PROPERTIES
// =============================================================================

/// Item properties the engine reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyTag {
    EntryId,
    StoreId,
    InternetMessageId,
    InReplyTo,
    ConversationId,
    Subject,
    Sender,
    Recipients,
    ReceivedTime,
}

/// A property value read from an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Empty,
    Text(String),
    Addresses(Vec<String>),
    Time(DateTime<Utc>),
}

impl PropertyValue {
    /// Text content, with blank strings treated as absent.
    pub fn into_text(self) -> Option<String> {
        match self {
            PropertyValue::Text(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn into_addresses(self) -> Vec<String> {
        match self {
            PropertyValue::Addresses(list) => list,
            PropertyValue::Text(s) if !s.trim().is_empty() => vec![s],
            _ => Vec::new(),
        }
    }

    pub fn into_time(self) -> Option<DateTime<Utc>> {
        match self {
            PropertyValue::Time(t) => Some(t),
            _ => None,
        }
    }
}

// =============================================================================
// FILTERS
// =============================================================================

/// A store-side item restriction: a hard lower bound on received time plus an
/// optional conversation equality clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFilter {
    pub received_since: DateTime<Utc>,
    pub conversation_id: Option<String>,
}

impl ItemFilter {
    /// Time-only filter.
    pub fn since(received_since: DateTime<Utc>) -> Self {
        Self {
            received_since,
            conversation_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn has_conversation_clause(&self) -> bool {
        self.conversation_id.is_some()
    }

    /// Render in the store's restriction dialect.
    pub fn to_query(&self) -> String {
        let time_clause = format!(
            "[ReceivedTime] >= \"{}\"",
            self.received_since.format("%m/%d/%Y %I:%M %p")
        );
        match &self.conversation_id {
            Some(id) => format!(
                "[ConversationID] = '{}' AND {}",
                id.replace('\'', "''"),
                time_clause
            ),
            None => time_clause,
        }
    }
}

impl fmt::Display for ItemFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

// =============================================================================
// STORE CONTRACT
// =============================================================================

/// Capability surface over a mailbox.
///
/// Every returned handle must be released exactly once through
/// [`MailStore::release`]; wrap it in a [`Scoped`] as soon as it is obtained.
pub trait MailStore: Send {
    /// All stores accessible in this session.
    fn stores(&self) -> StoreResult<Vec<StoreHandle>>;

    fn default_store(&self) -> StoreResult<StoreHandle>;

    /// The store's current (volatile) identifier.
    fn store_id(&self, store: StoreHandle) -> StoreResult<String>;

    fn default_folder(&self, store: StoreHandle, kind: DefaultFolder) -> StoreResult<FolderHandle>;

    fn folder_name(&self, folder: FolderHandle) -> StoreResult<String>;

    /// Whether the folder holds mail items (as opposed to calendar, contacts...).
    fn holds_mail(&self, folder: FolderHandle) -> StoreResult<bool>;

    /// Direct children only.
    fn child_folders(&self, folder: FolderHandle) -> StoreResult<Vec<FolderHandle>>;

    /// Resolve an entry id, optionally scoped to one store.
    fn resolve_by_id(&self, entry_id: &str, store_id: Option<&str>) -> StoreResult<ItemHandle>;

    /// Native message-id search across stores. Adapters without one leave the
    /// default, and callers fall back to a bounded folder scan.
    fn search_by_message_id(
        &self,
        _internet_message_id: &str,
        _cutoff: DateTime<Utc>,
    ) -> StoreResult<ItemHandle> {
        Err(StoreError::Unsupported("message-id search".to_string()))
    }

    /// Restrict a folder's items. The returned collection iterates newest-first.
    fn restrict(&self, folder: FolderHandle, filter: &ItemFilter) -> StoreResult<ItemsHandle>;

    /// Next item of a restricted collection, `None` when exhausted.
    fn next_item(&self, items: ItemsHandle) -> StoreResult<Option<ItemHandle>>;

    fn is_mail(&self, item: ItemHandle) -> StoreResult<bool>;

    fn property(&self, item: ItemHandle, tag: PropertyTag) -> StoreResult<PropertyValue>;

    fn release(&self, handle: RawHandle);
}

/// Scoped acquisition of a store handle: released when dropped, on every exit
/// path including early returns and unwinding.
pub struct Scoped<'s, H: Handle> {
    store: &'s dyn MailStore,
    handle: H,
}

impl<'s, H: Handle> Scoped<'s, H> {
    pub fn new(store: &'s dyn MailStore, handle: H) -> Self {
        Self { store, handle }
    }

    pub fn get(&self) -> H {
        self.handle
    }

    /// Wrap every handle of a batch.
    pub fn all(store: &'s dyn MailStore, handles: Vec<H>) -> Vec<Self> {
        handles.into_iter().map(|h| Scoped::new(store, h)).collect()
    }
}

impl<H: Handle> fmt::Debug for Scoped<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scoped").field(&self.handle).finish()
    }
}

impl<H: Handle> Drop for Scoped<'_, H> {
    fn drop(&mut self) {
        self.store.release(self.handle.raw());
    }
}

/// Read an owned snapshot of a mail item. The caller keeps ownership of the
/// handle.
pub fn read_snapshot(store: &dyn MailStore, item: ItemHandle) -> StoreResult<MailSnapshot> {
    let text = |tag| store.property(item, tag).map(PropertyValue::into_text);

    let entry_id = text(PropertyTag::EntryId)?.ok_or(StoreError::NotFound)?;
    Ok(MailSnapshot {
        entry_id,
        store_id: text(PropertyTag::StoreId)?,
        internet_message_id: text(PropertyTag::InternetMessageId)?,
        in_reply_to: text(PropertyTag::InReplyTo)?,
        conversation_id: text(PropertyTag::ConversationId)?,
        subject: text(PropertyTag::Subject)?,
        sender: text(PropertyTag::Sender)?,
        recipients: store
            .property(item, PropertyTag::Recipients)?
            .into_addresses(),
        received_at: store
            .property(item, PropertyTag::ReceivedTime)?
            .into_time(),
    })
}
