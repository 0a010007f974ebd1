//! Store capability negotiation.
//!
//! Optional store features are assumed to work until the store rejects one.
//! The rejection is sticky for the rest of the process: once downgraded, a
//! capability is never probed again.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const ASSUMED_SUPPORTED: u8 = 0;
const CONFIRMED_UNSUPPORTED: u8 = 1;

static GLOBAL: Lazy<Arc<FilterCapabilities>> = Lazy::new(|| Arc::new(FilterCapabilities::new()));

/// Negotiated state of an optional filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSupport {
    AssumedSupported,
    ConfirmedUnsupported,
}

/// Filter capabilities of the mail store.
#[derive(Debug)]
pub struct FilterCapabilities {
    conversation_filter: AtomicU8,
}

impl FilterCapabilities {
    /// A fresh negotiation, independent of the process-wide one.
    pub fn new() -> Self {
        Self {
            conversation_filter: AtomicU8::new(ASSUMED_SUPPORTED),
        }
    }

    /// The process-wide instance.
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    pub fn conversation_filter(&self) -> FilterSupport {
        match self.conversation_filter.load(Ordering::Acquire) {
            CONFIRMED_UNSUPPORTED => FilterSupport::ConfirmedUnsupported,
            _ => FilterSupport::AssumedSupported,
        }
    }

    pub fn supports_conversation_filter(&self) -> bool {
        self.conversation_filter() == FilterSupport::AssumedSupported
    }

    /// Downgrade the conversation filter. Returns `true` only for the call
    /// that performed the transition.
    pub fn mark_conversation_filter_unsupported(&self) -> bool {
        self.conversation_filter
            .compare_exchange(
                ASSUMED_SUPPORTED,
                CONFIRMED_UNSUPPORTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for FilterCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downgrade_is_sticky_and_reported_once() {
        let caps = FilterCapabilities::new();
        assert!(caps.supports_conversation_filter());

        assert!(caps.mark_conversation_filter_unsupported());
        assert!(!caps.mark_conversation_filter_unsupported());
        assert_eq!(caps.conversation_filter(), FilterSupport::ConfirmedUnsupported);
        assert!(!caps.supports_conversation_filter());
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&FilterCapabilities::global(), &FilterCapabilities::global()));
    }

    #[test]
    fn test_fresh_instances_are_independent() {
        let a = FilterCapabilities::new();
        let b = FilterCapabilities::new();
        a.mark_conversation_filter_unsupported();
        assert!(b.supports_conversation_filter());
    }
}
