//! Debounced preview synchronization.
//!
//! Selecting a mail in the event view reveals it in the host mail client
//! after a short quiet period. Revealing moves the host's selection, which
//! the host reports back as a selection change; those programmatic changes
//! are recognized and ignored so the synchronizer never fights the user.
//! A genuine user selection in the host cancels any pending reveal.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use mailcase_core::{MailRef, Result};

use crate::config::SyncConfig;

/// Something that can show a mail to the user.
pub trait PreviewTarget: Send + Sync {
    fn reveal(&self, mail: &MailRef) -> Result<()>;
}

struct Pending {
    generation: u64,
    token: CancellationToken,
}

struct Inner {
    target: Arc<dyn PreviewTarget>,
    debounce: Duration,
    pending: Mutex<Option<Pending>>,
    generation: AtomicU64,
    revealing: AtomicBool,
    suppressed: AtomicUsize,
}

#[derive(Clone)]
pub struct PreviewSync {
    inner: Arc<Inner>,
}

impl PreviewSync {
    pub fn new(target: Arc<dyn PreviewTarget>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                debounce,
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
                revealing: AtomicBool::new(false),
                suppressed: AtomicUsize::new(0),
            }),
        }
    }

    /// Synchronizer using the configured preview debounce.
    pub fn from_config(target: Arc<dyn PreviewTarget>, config: &SyncConfig) -> Self {
        Self::new(target, config.preview_debounce)
    }

    /// A mail was selected in the event view. Schedules a reveal after the
    /// debounce, replacing any reveal still pending. Must be called inside a
    /// tokio runtime.
    pub fn on_mail_selected(&self, mail: MailRef) {
        if self.inner.suppressed.load(Ordering::Acquire) > 0 {
            trace!(entry_id = %mail.entry_id, "Selection during suppressed update, no preview");
            return;
        }

        let token = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Pending {
            generation,
            token: token.clone(),
        };
        if let Some(previous) = self.inner.swap_pending(Some(next)) {
            previous.token.cancel();
        }

        let inner = self.inner.clone();
        let debounce = self.inner.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(entry_id = %mail.entry_id, "Pending preview cancelled");
                }
                _ = tokio::time::sleep(debounce) => inner.reveal(&mail, generation, &token),
            }
        });
    }

    /// The host's selection changed. Returns `true` if the change was
    /// treated as user-driven, which cancels the pending reveal.
    pub fn on_external_selection_change(&self) -> bool {
        if self.inner.revealing.load(Ordering::Acquire) {
            trace!("Ignoring selection change caused by a reveal");
            return false;
        }
        if let Some(pending) = self.inner.swap_pending(None) {
            debug!("User selection in host, pending preview cancelled");
            pending.token.cancel();
        }
        true
    }

    /// Suppress previews while the returned guard lives, for programmatic
    /// changes to the event view's selection.
    pub fn suppressed(&self) -> SuppressGuard {
        self.inner.suppressed.fetch_add(1, Ordering::AcqRel);
        SuppressGuard {
            inner: self.inner.clone(),
        }
    }

    /// Cancel the pending reveal, if any.
    pub fn cancel(&self) -> bool {
        match self.inner.swap_pending(None) {
            Some(pending) => {
                pending.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|pending| !pending.token.is_cancelled())
    }
}

impl Inner {
    fn swap_pending(&self, next: Option<Pending>) -> Option<Pending> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *pending, next)
    }

    fn reveal(&self, mail: &MailRef, generation: u64, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        {
            let _revealing = RevealGuard::enter(&self.revealing);
            if let Err(e) = self.target.reveal(mail) {
                warn!(entry_id = %mail.entry_id, error = %e, "Preview failed");
            }
        }

        // A newer selection may already own the slot.
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if pending
            .as_ref()
            .is_some_and(|current| current.generation == generation)
        {
            *pending = None;
        }
    }
}

struct RevealGuard<'a>(&'a AtomicBool);

impl<'a> RevealGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for RevealGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps previews suppressed until dropped.
pub struct SuppressGuard {
    inner: Arc<Inner>,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        self.inner.suppressed.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        shown: Mutex<Vec<String>>,
        echo: Mutex<Option<PreviewSync>>,
        echo_results: Mutex<Vec<bool>>,
    }

    impl PreviewTarget for Recorder {
        fn reveal(&self, mail: &MailRef) -> Result<()> {
            self.shown.lock().unwrap().push(mail.entry_id.clone());
            // The host reports the selection it just made.
            let echo = self.echo.lock().unwrap().clone();
            if let Some(sync) = echo {
                let user_driven = sync.on_external_selection_change();
                self.echo_results.lock().unwrap().push(user_driven);
            }
            Ok(())
        }
    }

    fn mail(entry_id: &str) -> MailRef {
        MailRef {
            entry_id: entry_id.to_string(),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<Recorder>, PreviewSync) {
        let recorder = Arc::new(Recorder::default());
        let sync = PreviewSync::new(recorder.clone(), Duration::from_millis(300));
        (recorder, sync)
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_last_selection_is_revealed() {
        let (recorder, sync) = setup();

        sync.on_mail_selected(mail("a"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        sync.on_mail_selected(mail("b"));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(recorder.shown.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*recorder.shown.lock().unwrap(), vec!["b".to_string()]);
        assert!(!sync.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_selection_cancels_pending_preview() {
        let (recorder, sync) = setup();

        sync.on_mail_selected(mail("a"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sync.on_external_selection_change());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(recorder.shown.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_echo_during_reveal_is_ignored() {
        let (recorder, sync) = setup();
        *recorder.echo.lock().unwrap() = Some(sync.clone());

        sync.on_mail_selected(mail("a"));
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(*recorder.shown.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(*recorder.echo_results.lock().unwrap(), vec![false]);
        // Outside a reveal the same call counts as user-driven.
        assert!(sync.on_external_selection_change());

        recorder.echo.lock().unwrap().take();
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_updates_do_not_preview() {
        let (recorder, sync) = setup();

        {
            let _guard = sync.suppressed();
            sync.on_mail_selected(mail("a"));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(recorder.shown.lock().unwrap().is_empty());

        sync.on_mail_selected(mail("b"));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*recorder.shown.lock().unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_comes_from_config() {
        let recorder = Arc::new(Recorder::default());
        let config = SyncConfig::default().with_preview_debounce(Duration::from_millis(50));
        let sync = PreviewSync::from_config(recorder.clone(), &config);

        sync.on_mail_selected(mail("a"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(recorder.shown.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*recorder.shown.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_preview() {
        let (recorder, sync) = setup();
        sync.on_mail_selected(mail("a"));
        assert!(sync.is_pending());
        assert!(sync.cancel());
        assert!(!sync.cancel());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(recorder.shown.lock().unwrap().is_empty());
    }
}
