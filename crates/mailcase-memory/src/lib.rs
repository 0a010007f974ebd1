//! # mailcase-memory
//!
//! In-process reference implementations of the mailcase collaborators:
//! - [`MemoryEventRepository`]: event repository with a change feed
//! - [`MemoryMailbox`]: a mail store with volatile identifiers, handle
//!   accounting and call instrumentation
//! - [`SnapshotFile`]: JSON snapshots of both

pub mod events;
pub mod mailbox;
pub mod snapshot;

pub use events::MemoryEventRepository;
pub use mailbox::{
    FolderSnapshot, MailboxSnapshot, MemoryMailbox, MessageSnapshot, StoreCall, StoreSnapshot,
};
pub use snapshot::SnapshotFile;
