//! Engine configuration.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use mailcase_core::defaults::{self, MAX_LOOKBACK_DAYS};
use mailcase_core::{Error, Result};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a refresh waits for the catch-up confirmation.
    pub catch_up_timeout: Duration,
    /// Lookback for subject discovery, in days.
    pub subject_lookback_days: i64,
    /// Lookback for the resolver's message-id search, in days.
    pub message_id_lookback_days: i64,
    /// Lookback for conversation catch-up, in days.
    pub conversation_lookback_days: i64,
    /// Lookback for full-history catch-up, in days.
    pub full_history_lookback_days: i64,
    /// Delay before a selected mail is revealed.
    pub preview_debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catch_up_timeout: Duration::from_secs(defaults::CATCH_UP_TIMEOUT_SECS),
            subject_lookback_days: defaults::SUBJECT_LOOKBACK_DAYS,
            message_id_lookback_days: defaults::MESSAGE_ID_LOOKBACK_DAYS,
            conversation_lookback_days: defaults::CONVERSATION_LOOKBACK_DAYS,
            full_history_lookback_days: defaults::FULL_HISTORY_LOOKBACK_DAYS,
            preview_debounce: Duration::from_millis(defaults::PREVIEW_DEBOUNCE_MS),
        }
    }
}

impl SyncConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `MAILCASE_CATCH_UP_TIMEOUT_SECS` | `45` | Wait for catch-up confirmation |
    /// | `MAILCASE_SUBJECT_LOOKBACK_DAYS` | `14` | Subject discovery window |
    /// | `MAILCASE_MESSAGE_ID_LOOKBACK_DAYS` | `7` | Message-id search window |
    /// | `MAILCASE_CONVERSATION_LOOKBACK_DAYS` | `14` | Conversation catch-up window |
    /// | `MAILCASE_PREVIEW_DEBOUNCE_MS` | `300` | Preview selection debounce |
    ///
    /// Day counts are clamped to `1..=MAX_LOOKBACK_DAYS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i64>().ok());
        let days = |key: &str, default: i64| clamp_days(parsed(key).unwrap_or(default));

        let catch_up_timeout_secs = parsed("MAILCASE_CATCH_UP_TIMEOUT_SECS")
            .filter(|v| *v >= 0)
            .map(|v| v as u64)
            .unwrap_or(defaults::CATCH_UP_TIMEOUT_SECS);

        let preview_debounce_ms = parsed("MAILCASE_PREVIEW_DEBOUNCE_MS")
            .filter(|v| *v >= 0)
            .map(|v| v as u64)
            .unwrap_or(defaults::PREVIEW_DEBOUNCE_MS);

        Self {
            catch_up_timeout: Duration::from_secs(catch_up_timeout_secs),
            subject_lookback_days: days(
                "MAILCASE_SUBJECT_LOOKBACK_DAYS",
                defaults::SUBJECT_LOOKBACK_DAYS,
            ),
            message_id_lookback_days: days(
                "MAILCASE_MESSAGE_ID_LOOKBACK_DAYS",
                defaults::MESSAGE_ID_LOOKBACK_DAYS,
            ),
            conversation_lookback_days: days(
                "MAILCASE_CONVERSATION_LOOKBACK_DAYS",
                defaults::CONVERSATION_LOOKBACK_DAYS,
            ),
            full_history_lookback_days: defaults::FULL_HISTORY_LOOKBACK_DAYS,
            preview_debounce: Duration::from_millis(preview_debounce_ms),
        }
    }

    pub fn with_catch_up_timeout(mut self, timeout: Duration) -> Self {
        self.catch_up_timeout = timeout;
        self
    }

    /// Set the subject discovery window, clamped to `1..=MAX_LOOKBACK_DAYS`.
    pub fn with_subject_lookback_days(mut self, days: i64) -> Self {
        self.subject_lookback_days = clamp_days(days);
        self
    }

    /// Like [`Self::with_subject_lookback_days`] but rejects an out-of-range
    /// value instead of clamping it.
    pub fn try_with_subject_lookback_days(self, days: i64) -> Result<Self> {
        if !(1..=MAX_LOOKBACK_DAYS).contains(&days) {
            return Err(Error::Config(format!(
                "subject lookback must be between 1 and {MAX_LOOKBACK_DAYS} days, got {days}"
            )));
        }
        Ok(self.with_subject_lookback_days(days))
    }

    pub fn with_message_id_lookback_days(mut self, days: i64) -> Self {
        self.message_id_lookback_days = clamp_days(days);
        self
    }

    pub fn with_conversation_lookback_days(mut self, days: i64) -> Self {
        self.conversation_lookback_days = clamp_days(days);
        self
    }

    pub fn with_preview_debounce(mut self, debounce: Duration) -> Self {
        self.preview_debounce = debounce;
        self
    }
}

fn clamp_days(days: i64) -> i64 {
    days.clamp(1, MAX_LOOKBACK_DAYS)
}

/// Start of a lookback window of `days` ending now. The day count is clamped
/// first, so the subtraction cannot overflow.
pub fn lookback_cutoff(days: i64) -> DateTime<Utc> {
    let now = Utc::now();
    ChronoDuration::try_days(clamp_days(days))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
