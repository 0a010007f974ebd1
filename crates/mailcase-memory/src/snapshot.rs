//! JSON snapshot files: a mailbox description plus the tracked events.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use mailcase_core::{Event, Result};

use crate::mailbox::MailboxSnapshot;

/// On-disk layout of a snapshot file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    #[serde(default)]
    pub mailbox: MailboxSnapshot,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl SnapshotFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let file: SnapshotFile = serde_json::from_str(&raw)?;
        info!(
            path = %path.display(),
            stores = file.mailbox.stores.len(),
            events = file.events.len(),
            "Loaded snapshot"
        );
        Ok(file)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        info!(path = %path.display(), events = self.events.len(), "Saved snapshot");
        Ok(())
    }
}
