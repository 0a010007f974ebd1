//! Participant address canonicalization.
//!
//! Addresses arrive in many shapes (`"Doe, Jane" <Jane.Doe@Example.com>`,
//! `mailto:` URIs, bare addresses). Participant sets compare canonical forms.

use crate::models::FoldedSet;

/// Canonicalize a single address. Returns `None` for blank input.
pub fn canonical_address(raw: &str) -> Option<String> {
    let raw = raw.trim();

    // "Name <email>" form
    let addr = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(open), Some(close)) if close > open => &raw[open + 1..close],
        _ => raw,
    };

    let addr = addr.trim().trim_matches('"').trim_matches('\'').trim();
    let addr = match addr.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("mailto:") => &addr[7..],
        _ => addr,
    };

    if addr.is_empty() {
        return None;
    }
    Some(addr.to_lowercase())
}

/// Split a recipient list on `;` or `,`, ignoring separators that appear in
/// quoted display names or inside angle brackets.
pub fn split_addresses(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in list.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ';' | ',' if !in_quotes && depth == 0 => {
                parts.push(&list[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);

    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// Build the canonical participant set of a message from its sender and
/// recipient fields. Each recipient entry may itself be a list.
pub fn participant_set<'a>(
    sender: Option<&'a str>,
    recipients: impl IntoIterator<Item = &'a str>,
) -> FoldedSet {
    sender
        .into_iter()
        .chain(recipients)
        .flat_map(split_addresses)
        .filter_map(canonical_address)
        .collect()
}
