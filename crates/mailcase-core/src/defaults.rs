//! Centralized default constants for mailcase.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers. Organized by pipeline area.

// =============================================================================
// CATCH-UP
// =============================================================================

/// How long a manual refresh waits for the catch-up confirmation signal.
pub const CATCH_UP_TIMEOUT_SECS: u64 = 45;

/// Lookback window for conversation catch-up scans.
pub const CONVERSATION_LOOKBACK_DAYS: i64 = 14;

/// Lookback used when a catch-up asks for full history (roughly ten years).
pub const FULL_HISTORY_LOOKBACK_DAYS: i64 = 3650;

/// Upper bound for every configurable lookback window.
pub const MAX_LOOKBACK_DAYS: i64 = FULL_HISTORY_LOOKBACK_DAYS;

// =============================================================================
// DISCOVERY
// =============================================================================

/// Lookback window for subject-driven discovery during a manual refresh.
pub const SUBJECT_LOOKBACK_DAYS: i64 = 14;

/// Lookback window for the message-id fallback search of the identity resolver.
pub const MESSAGE_ID_LOOKBACK_DAYS: i64 = 7;

// =============================================================================
// PREVIEW
// =============================================================================

/// Debounce applied before a selected mail is revealed in the mailbox view.
pub const PREVIEW_DEBOUNCE_MS: u64 = 300;

// =============================================================================
// EVENT BUS
// =============================================================================

/// Broadcast capacity for change feeds and refresh progress channels.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// REFRESH PROGRESS
// =============================================================================

/// Progress reported when the pipeline starts.
pub const PROGRESS_START: u8 = 0;

/// Reported right after the refresh collected its conversation ids.
pub const PROGRESS_PREPARED: u8 = 5;

/// End of the conversation catch-up stage.
pub const PROGRESS_CATCH_UP_DONE: u8 = 30;

/// End of the subject discovery stage.
pub const PROGRESS_DISCOVERY_DONE: u8 = 50;

/// End of the reload stage.
pub const PROGRESS_RELOADED: u8 = 60;

/// End of the validation stage.
pub const PROGRESS_VALIDATED: u8 = 90;

/// Commit complete.
pub const PROGRESS_DONE: u8 = 100;
