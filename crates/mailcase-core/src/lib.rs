//! # mailcase-core
//!
//! Core types, traits, and abstractions for mailcase.
//!
//! This crate provides the event model, the error taxonomy, the mail store
//! adapter contract and the collaborator traits that the other mailcase
//! crates depend on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod participants;
pub mod store;
pub mod subject;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{ChangeBus, ChangeReason, EventChange};
pub use models::*;
pub use store::{
    read_snapshot, DefaultFolder, FolderHandle, Handle, ItemFilter, ItemHandle, ItemsHandle,
    MailStore, PropertyTag, PropertyValue, RawHandle, Scoped, StoreError, StoreHandle,
    StoreResult,
};
pub use traits::*;
