//! Shared collaborators of the sync components.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use mailcase_core::{CatchUpTrigger, Error, EventRepository, Result};

use crate::capability::FilterCapabilities;
use crate::catch_up::ConversationCatchUp;
use crate::config::SyncConfig;
use crate::worker::StoreClient;

/// Everything a sync component talks to.
#[derive(Clone)]
pub struct SyncContext {
    pub client: StoreClient,
    pub repository: Arc<dyn EventRepository>,
    pub catch_up: Arc<dyn CatchUpTrigger>,
    pub capabilities: Arc<FilterCapabilities>,
    pub config: SyncConfig,
}

impl SyncContext {
    /// Context with the process-wide capabilities and default config.
    pub fn new(
        client: StoreClient,
        repository: Arc<dyn EventRepository>,
        catch_up: Arc<dyn CatchUpTrigger>,
    ) -> Self {
        Self {
            client,
            repository,
            catch_up,
            capabilities: FilterCapabilities::global(),
            config: SyncConfig::default(),
        }
    }

    /// Context whose catch-up runs in-process against the same store.
    pub fn in_process(
        client: StoreClient,
        repository: Arc<dyn EventRepository>,
        capabilities: Arc<FilterCapabilities>,
        config: SyncConfig,
    ) -> Self {
        let catch_up = ConversationCatchUp::new(client.clone(), repository.clone())
            .with_capabilities(capabilities.clone())
            .with_config(config.clone());
        Self {
            client,
            repository,
            catch_up: Arc::new(catch_up),
            capabilities,
            config,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Arc<FilterCapabilities>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }
}

/// Run `fut` unless `token` is cancelled first.
pub(crate) async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
