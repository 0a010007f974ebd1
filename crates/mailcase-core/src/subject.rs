//! Subject canonicalization for coarse mail correlation.
//!
//! A normalized subject is only ever a candidate filter. Matching on subject
//! alone produces false positives on generic subjects, so the matcher always
//! pairs it with a participant check.

use once_cell::sync::Lazy;
use regex::Regex;

/// Reply/forward prefixes, including the CJK variants produced by localized
/// clients. The colon may be ASCII or full-width.
static REPLY_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:re|fw|fwd|回复|转发|回覆|轉寄)\s*[:：]\s*")
        .expect("reply prefix pattern is valid")
});

/// Canonicalize a subject line.
///
/// Trims, then repeatedly strips reply/forward prefixes from the start until
/// none matches, so `"RE: FW: X"` and `"X"` normalize identically.
pub fn normalize(subject: &str) -> String {
    let mut rest = subject.trim();
    while let Some(m) = REPLY_PREFIX.find(rest) {
        rest = rest[m.end()..].trim_start();
    }
    rest.trim_end().to_string()
}

/// Normalize an optional subject, treating a missing one as empty.
pub fn normalize_opt(subject: Option<&str>) -> String {
    subject.map(normalize).unwrap_or_default()
}
