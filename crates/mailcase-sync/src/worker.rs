//! Store owner thread.
//!
//! A mail store's handles are not safe to use from more than one thread, so
//! every store call runs on one dedicated OS thread. Async code submits
//! closures through a [`StoreClient`] and awaits the result over a oneshot.
//! Jobs run strictly one at a time, which also keeps two scans of the same
//! folder from overlapping.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use mailcase_core::{Error, MailStore, Result};

type Job = Box<dyn FnOnce(&dyn MailStore) + Send>;

enum Message {
    Job(Job),
    Shutdown,
}

/// Spawns the store owner thread.
pub struct StoreWorker;

impl StoreWorker {
    /// Move `store` onto a new owner thread and return a client for it.
    ///
    /// The thread exits once every client has been dropped or
    /// [`StoreClient::shutdown`] is called.
    pub fn spawn<S>(store: S) -> Result<StoreClient>
    where
        S: MailStore + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        thread::Builder::new()
            .name("mailcase-store".to_string())
            .spawn(move || {
                let store: &dyn MailStore = &store;
                info!("Store worker started");
                let mut jobs = 0u64;
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        Message::Job(job) => {
                            jobs += 1;
                            let result = catch_unwind(AssertUnwindSafe(|| job(store)));
                            if result.is_err() {
                                error!(job = jobs, "Store job panicked");
                            }
                        }
                        Message::Shutdown => {
                            debug!("Store worker received shutdown signal");
                            break;
                        }
                    }
                }
                info!(jobs, "Store worker stopped");
            })?;

        Ok(StoreClient { tx })
    }
}

/// Cloneable handle for submitting work to the store owner thread.
#[derive(Clone)]
pub struct StoreClient {
    tx: mpsc::UnboundedSender<Message>,
}

impl StoreClient {
    /// Run `job` on the owner thread and wait for its result.
    ///
    /// Dropping the returned future does not abort the job; it runs to
    /// completion and releases its handles.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&dyn MailStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |store| {
            let _ = result_tx.send(job(store));
        });
        self.tx
            .send(Message::Job(job))
            .map_err(|_| Error::Internal("store worker is not running".into()))?;
        result_rx
            .await
            .map_err(|_| Error::Internal("store job did not complete".into()))
    }

    /// Ask the owner thread to stop after the jobs already queued.
    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Message::Shutdown)
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("running", &self.is_running())
            .finish()
    }
}
