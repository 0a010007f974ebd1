//! Mail matcher: does a live candidate belong to an event?

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use mailcase_core::{Event, MailSnapshot, MailStore, Scoped, StoreResult};

use crate::capability::FilterCapabilities;
use crate::scanner::{FolderScanner, ScanStats};

/// The rule that matched a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// The candidate's conversation is tracked by the event.
    Conversation,
    /// Same normalized subject and at least one shared participant.
    SubjectAndParticipants,
    /// The candidate replies to a message the event already processed.
    ReplyChain,
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchRule::Conversation => write!(f, "conversation"),
            MatchRule::SubjectAndParticipants => write!(f, "subject_participants"),
            MatchRule::ReplyChain => write!(f, "reply_chain"),
        }
    }
}

/// Decide which rule, if any, admits `candidate` into `event`.
///
/// Candidates that are already members are never matched, including
/// soft-removed ones: removal stays in force until an explicit add.
pub fn match_rule(candidate: &MailSnapshot, event: &Event) -> Option<MatchRule> {
    if event.contains_message(candidate) {
        return None;
    }

    if let Some(conversation_id) = candidate.conversation_id.as_deref() {
        if event.tracks_conversation(conversation_id) {
            return Some(MatchRule::Conversation);
        }
    }

    let subject = candidate.normalized_subject();
    if !subject.is_empty()
        && event.related_subjects.contains(&subject)
        && candidate.participants().intersects(&event.participants)
    {
        return Some(MatchRule::SubjectAndParticipants);
    }

    if let Some(in_reply_to) = candidate.in_reply_to.as_deref().map(str::trim) {
        if !in_reply_to.is_empty() && event.processed_message_ids.contains(in_reply_to) {
            return Some(MatchRule::ReplyChain);
        }
    }

    None
}

pub fn matches(candidate: &MailSnapshot, event: &Event) -> bool {
    match_rule(candidate, event).is_some()
}

/// A candidate admitted by the matcher.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub mail: MailSnapshot,
    pub rule: MatchRule,
}

/// Subject-driven discovery over the default store's mail folders.
///
/// Runs on the store owner thread. Matches are returned, not applied; the
/// caller submits them to the repository.
pub fn discover_by_subject(
    store: &dyn MailStore,
    event: &Event,
    cutoff: DateTime<Utc>,
    capabilities: Arc<FilterCapabilities>,
    cancel: CancellationToken,
) -> StoreResult<(Vec<Discovered>, ScanStats)> {
    let root = Scoped::new(store, store.default_store()?);
    let scanner = FolderScanner::new(store, capabilities, cancel);
    let (candidates, stats) = scanner.scan_mail_folders(root.get(), cutoff, None)?;

    let discovered: Vec<Discovered> = candidates
        .into_iter()
        .filter_map(|mail| {
            let rule = match_rule(&mail, event)?;
            trace!(entry_id = %mail.entry_id, %rule, "Candidate matched");
            Some(Discovered { mail, rule })
        })
        .collect();

    debug!(
        event_id = %event.id,
        scanned = stats.yielded,
        matched = discovered.len(),
        "Subject discovery finished"
    );
    Ok((discovered, stats))
}
