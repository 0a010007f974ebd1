//! Core data models for mailcase.
//!
//! An [`Event`] is a user-curated case that owns an ordered list of
//! [`MailRef`]s. The live mailbox is read-only input; what crosses from the
//! mailbox into the model is always an owned [`MailSnapshot`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::participants::participant_set;
use crate::subject;

/// Event identifier.
pub type EventId = Uuid;

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// =============================================================================
// FOLDED SET
// =============================================================================

/// A case-insensitive string set that remembers the first spelling it saw.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct FoldedSet {
    entries: BTreeMap<String, String>,
}

impl FoldedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. Returns `true` if it was not present (ignoring case).
    pub fn insert(&mut self, value: impl Into<String>) -> bool {
        let value = value.into();
        let key = value.to_lowercase();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    pub fn contains(&self, value: &str) -> bool {
        self.entries.contains_key(&value.to_lowercase())
    }

    pub fn remove(&mut self, value: &str) -> bool {
        self.entries.remove(&value.to_lowercase()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the stored spellings, in case-folded order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }

    /// Whether the two sets share at least one value.
    pub fn intersects(&self, other: &FoldedSet) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.entries.keys().any(|k| large.entries.contains_key(k))
    }
}

impl From<Vec<String>> for FoldedSet {
    fn from(values: Vec<String>) -> Self {
        values.into_iter().collect()
    }
}

impl From<FoldedSet> for Vec<String> {
    fn from(set: FoldedSet) -> Self {
        set.entries.into_values().collect()
    }
}

impl FromIterator<String> for FoldedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = FoldedSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<String> for FoldedSet {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        for value in iter {
            self.insert(value);
        }
    }
}

// =============================================================================
// MAIL TYPES
// =============================================================================

/// Owned copy of a live message's correlation-relevant properties.
///
/// Produced on the store owner thread while the item handle is held; the
/// handle itself never leaves that thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailSnapshot {
    pub entry_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

impl MailSnapshot {
    pub fn normalized_subject(&self) -> String {
        subject::normalize_opt(self.subject.as_deref())
    }

    /// Canonical participant set (sender plus all recipients).
    pub fn participants(&self) -> FoldedSet {
        participant_set(
            self.sender.as_deref(),
            self.recipients.iter().map(String::as_str),
        )
    }
}

/// A persisted reference to a message that belongs to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRef {
    /// Volatile, store-session-scoped identifier.
    pub entry_id: String,
    /// Volatile store identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    /// Stable RFC 5322 Message-ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    /// Unread highlight.
    #[serde(default)]
    pub is_new: bool,
    /// Soft delete. Removed members are never rediscovered implicitly.
    #[serde(default)]
    pub is_removed: bool,
}

impl MailRef {
    /// Identity match: by Message-ID when both sides have one, or by entry id.
    pub fn is_same_message(&self, internet_message_id: Option<&str>, entry_id: Option<&str>) -> bool {
        let by_message_id = match (non_blank(self.internet_message_id.as_deref()), non_blank(internet_message_id)) {
            (Some(a), Some(b)) => eq_ignore_case(a, b),
            _ => false,
        };
        let by_entry_id = match (non_blank(Some(self.entry_id.as_str())), non_blank(entry_id)) {
            (Some(a), Some(b)) => eq_ignore_case(a, b),
            _ => false,
        };
        by_message_id || by_entry_id
    }

    /// Whether the live identifiers in `snapshot` differ from the persisted ones.
    ///
    /// A store id missing on the live side is not treated as drift.
    pub fn identifiers_drifted(&self, snapshot: &MailSnapshot) -> bool {
        let entry_drift = !eq_ignore_case(&self.entry_id, &snapshot.entry_id);
        let store_drift = match non_blank(snapshot.store_id.as_deref()) {
            Some(live) => match self.store_id.as_deref() {
                Some(stored) => !eq_ignore_case(stored, live),
                None => true,
            },
            None => false,
        };
        entry_drift || store_drift
    }

    fn from_snapshot(snapshot: &MailSnapshot) -> Self {
        let mut mail = MailRef::default();
        mail.apply(snapshot);
        mail
    }

    /// Refresh identifiers and metadata from a live snapshot, keeping flags.
    fn apply(&mut self, snapshot: &MailSnapshot) {
        self.entry_id = snapshot.entry_id.clone();
        if non_blank(snapshot.store_id.as_deref()).is_some() {
            self.store_id = snapshot.store_id.clone();
        }
        if non_blank(snapshot.internet_message_id.as_deref()).is_some() {
            self.internet_message_id = snapshot.internet_message_id.clone();
        }
        if snapshot.conversation_id.is_some() {
            self.conversation_id = snapshot.conversation_id.clone();
        }
        if snapshot.sender.is_some() {
            self.sender = snapshot.sender.clone();
        }
        if !snapshot.recipients.is_empty() {
            self.recipients = snapshot.recipients.clone();
        }
        if snapshot.subject.is_some() {
            self.subject = snapshot.subject.clone();
        }
        if snapshot.received_at.is_some() {
            self.received_at = snapshot.received_at;
        }
    }
}

// =============================================================================
// EVENT
// =============================================================================

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Open,
    Archived,
}

/// Result of merging a live message into an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new member was appended.
    Added,
    /// A soft-removed member was explicitly added back.
    Restored,
    /// An existing member's identifiers changed.
    Updated,
    /// The message was already a member with the same identifiers.
    Unchanged,
}

/// A user-curated case aggregating correlated email messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    #[serde(default)]
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub conversation_ids: Vec<String>,
    #[serde(default)]
    pub related_subjects: FoldedSet,
    #[serde(default)]
    pub participants: FoldedSet,
    #[serde(default)]
    pub processed_message_ids: FoldedSet,
    #[serde(default)]
    pub not_found_message_ids: FoldedSet,
    #[serde(default)]
    pub emails: Vec<MailRef>,
}

impl Event {
    /// Create an empty open event.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            title: title.into(),
            status: EventStatus::Open,
            created_at: now,
            updated_at: now,
            conversation_ids: Vec::new(),
            related_subjects: FoldedSet::new(),
            participants: FoldedSet::new(),
            processed_message_ids: FoldedSet::new(),
            not_found_message_ids: FoldedSet::new(),
            emails: Vec::new(),
        }
    }

    /// Create an event seeded from a mail: its conversation, normalized
    /// subject and participants become the event's correlation keys.
    pub fn from_mail(snapshot: &MailSnapshot, title: Option<String>) -> Self {
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| snapshot.normalized_subject());
        let mut event = Event::new(title);
        event.add_or_merge(snapshot);
        event
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_open(&self) -> bool {
        self.status == EventStatus::Open
    }

    pub fn archive(&mut self) {
        self.status = EventStatus::Archived;
        self.touch();
    }

    pub fn reopen(&mut self) {
        self.status = EventStatus::Open;
        self.touch();
    }

    pub fn tracks_conversation(&self, conversation_id: &str) -> bool {
        self.conversation_ids
            .iter()
            .any(|id| eq_ignore_case(id, conversation_id))
    }

    /// Start tracking a conversation. Blank ids are ignored.
    pub fn track_conversation(&mut self, conversation_id: &str) -> bool {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() || self.tracks_conversation(conversation_id) {
            return false;
        }
        self.conversation_ids.push(conversation_id.to_string());
        true
    }

    /// Distinct, non-blank conversation ids in tracking order.
    pub fn distinct_conversation_ids(&self) -> Vec<String> {
        let mut seen = FoldedSet::new();
        self.conversation_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .filter(|id| seen.insert(*id))
            .map(String::from)
            .collect()
    }

    pub fn find_mail(&self, internet_message_id: Option<&str>, entry_id: Option<&str>) -> Option<&MailRef> {
        self.emails
            .iter()
            .find(|m| m.is_same_message(internet_message_id, entry_id))
    }

    pub fn find_mail_mut(
        &mut self,
        internet_message_id: Option<&str>,
        entry_id: Option<&str>,
    ) -> Option<&mut MailRef> {
        self.emails
            .iter_mut()
            .find(|m| m.is_same_message(internet_message_id, entry_id))
    }

    /// Whether the message is already a member, soft-removed members included.
    pub fn contains_message(&self, snapshot: &MailSnapshot) -> bool {
        self.find_mail(
            snapshot.internet_message_id.as_deref(),
            Some(snapshot.entry_id.as_str()),
        )
        .is_some()
    }

    /// Members that are not soft-removed.
    pub fn active_mail(&self) -> impl Iterator<Item = &MailRef> {
        self.emails.iter().filter(|m| !m.is_removed)
    }

    /// Add a live message, or merge it into the existing member with the same
    /// Message-ID (or entry id).
    ///
    /// The message's conversation, normalized subject and participants are
    /// appended to the event's correlation sets. An explicit add restores a
    /// soft-removed member. Added, restored and re-identified members are
    /// flagged new.
    pub fn add_or_merge(&mut self, snapshot: &MailSnapshot) -> MergeOutcome {
        let outcome = match self.find_mail_mut(
            snapshot.internet_message_id.as_deref(),
            Some(snapshot.entry_id.as_str()),
        ) {
            Some(mail) => {
                let drifted = mail.identifiers_drifted(snapshot);
                let restored = mail.is_removed;
                mail.apply(snapshot);
                mail.is_removed = false;
                if restored {
                    mail.is_new = true;
                    MergeOutcome::Restored
                } else if drifted {
                    mail.is_new = true;
                    MergeOutcome::Updated
                } else {
                    MergeOutcome::Unchanged
                }
            }
            None => {
                let mut mail = MailRef::from_snapshot(snapshot);
                mail.is_new = true;
                self.emails.push(mail);
                MergeOutcome::Added
            }
        };

        if let Some(conversation_id) = snapshot.conversation_id.as_deref() {
            self.track_conversation(conversation_id);
        }
        let subject = snapshot.normalized_subject();
        if !subject.is_empty() {
            self.related_subjects.insert(subject);
        }
        self.participants.extend(snapshot.participants().iter().map(String::from));
        if let Some(message_id) = non_blank(snapshot.internet_message_id.as_deref()) {
            self.processed_message_ids.insert(message_id);
            self.not_found_message_ids.remove(message_id);
        }

        if outcome != MergeOutcome::Unchanged {
            self.touch();
        }
        outcome
    }

    /// Merge a re-identified member and set its unread flag to `is_new`
    /// rather than flagging it new.
    pub fn repair_member(&mut self, snapshot: &MailSnapshot, is_new: bool) -> MergeOutcome {
        let outcome = self.add_or_merge(snapshot);
        if let Some(mail) = self.find_mail_mut(
            snapshot.internet_message_id.as_deref(),
            Some(snapshot.entry_id.as_str()),
        ) {
            mail.is_new = is_new;
        }
        outcome
    }

    /// Soft-remove a member. Returns `false` if no such member exists.
    pub fn soft_remove(&mut self, entry_id: Option<&str>, internet_message_id: Option<&str>) -> bool {
        let removed = match self.find_mail_mut(internet_message_id, entry_id) {
            Some(mail) => {
                mail.is_removed = true;
                mail.is_new = false;
                true
            }
            None => false,
        };
        if removed {
            self.touch();
        }
        removed
    }

    /// Clear every unread highlight and record the message ids as processed
    /// so a later refresh does not highlight them again. Returns whether
    /// anything changed.
    pub fn mark_all_read(&mut self) -> bool {
        let mut changed = false;
        for mail in self.emails.iter_mut().filter(|m| m.is_new) {
            mail.is_new = false;
            changed = true;
            if let Some(message_id) = non_blank(mail.internet_message_id.as_deref()) {
                self.processed_message_ids.insert(message_id);
            }
        }
        if changed {
            self.touch();
        }
        changed
    }
}
