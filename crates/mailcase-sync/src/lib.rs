//! # mailcase-sync
//!
//! The engine that keeps events in step with a live mailbox.
//!
//! This crate provides:
//! - A single-owner store context that serializes every mail store call
//! - Identity resolution with an entry id, any-store and message-id fallback chain
//! - Lazy folder scanning with conversation-filter negotiation
//! - Conversation catch-up and subject-driven discovery
//! - Validation and repair of drifted mail identifiers
//! - A single-flight refresh orchestrator with progress notifications
//! - Bulk catch-up, the focused-event session and debounced preview sync
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailcase_memory::{MemoryEventRepository, MemoryMailbox};
//! use mailcase_sync::{EventSession, FilterCapabilities, StoreWorker, SyncConfig, SyncContext};
//!
//! let client = StoreWorker::spawn(MemoryMailbox::with_store("primary"))?;
//! let repository = Arc::new(MemoryEventRepository::new());
//! let ctx = SyncContext::in_process(client, repository, FilterCapabilities::global(), SyncConfig::from_env());
//!
//! let session = EventSession::new(ctx);
//! session.load(event_id).await?;
//! let outcome = session.refresh().await?;
//! ```

pub mod capability;
pub mod catch_up;
pub mod config;
pub mod context;
pub mod matcher;
pub mod preview;
pub mod refresh;
pub mod resolver;
pub mod scanner;
pub mod session;
pub mod sweep;
pub mod validator;
pub mod view;
pub mod wait;
pub mod worker;

pub use capability::{FilterCapabilities, FilterSupport};
pub use catch_up::{CatchUpReport, ConversationCatchUp};
pub use config::{lookback_cutoff, SyncConfig};
pub use context::SyncContext;
pub use matcher::{discover_by_subject, match_rule, matches, Discovered, MatchRule};
pub use preview::{PreviewSync, PreviewTarget, SuppressGuard};
pub use refresh::{
    RefreshCoordinator, RefreshEvent, RefreshOutcome, RefreshReport, RefreshStage, RefreshState,
};
pub use resolver::{IdentityResolver, Resolution, ResolveStrategy};
pub use scanner::{Depth, FolderScanner, Scan, ScanStats};
pub use session::EventSession;
pub use sweep::{CatchUpSweep, SweepEvent, SweepOutcome, SweepReport};
pub use validator::{check_member, repair_member, MailValidator, MemberCheck, ValidationSummary};
pub use view::{shared_view, EventView, SharedView};
pub use wait::{catch_up_confirmation, ChangeWaiter};
pub use worker::{StoreClient, StoreWorker};
