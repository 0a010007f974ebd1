//! `mailcase` command-line runner.
//!
//! Loads a JSON snapshot (mailbox plus tracked events), runs a manual refresh
//! of one event or a catch-up sweep over all open events, and prints the
//! report. With `--write` the updated events are written back.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use mailcase_memory::{MemoryEventRepository, MemoryMailbox, SnapshotFile};
use mailcase_sync::{
    CatchUpSweep, EventSession, FilterCapabilities, RefreshEvent, RefreshOutcome, StoreClient,
    StoreWorker, SweepOutcome, SyncConfig, SyncContext,
};

#[derive(Debug, Parser)]
#[command(name = "mailcase", version, about = "Keep events in step with a mailbox")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manually refresh one event
    Refresh {
        /// Snapshot file with the mailbox and events
        #[arg(long)]
        snapshot: PathBuf,
        /// Event to refresh
        #[arg(long)]
        event: Uuid,
        /// Subject discovery lookback in days
        #[arg(long)]
        subject_days: Option<i64>,
        /// Write the updated events back to the snapshot
        #[arg(long)]
        write: bool,
    },
    /// Run conversation catch-up for every open event
    Sweep {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        write: bool,
    },
}

/// Everything a command needs, built from a snapshot.
struct Runtime {
    file: SnapshotFile,
    repository: Arc<MemoryEventRepository>,
    client: StoreClient,
    ctx: SyncContext,
}

impl Runtime {
    fn open(path: &Path, config: SyncConfig) -> anyhow::Result<Self> {
        let file = SnapshotFile::load(path)
            .with_context(|| format!("failed to load snapshot {}", path.display()))?;
        let mailbox = MemoryMailbox::new(file.mailbox.clone());
        let repository = Arc::new(MemoryEventRepository::with_events(file.events.clone()));
        let client = StoreWorker::spawn(mailbox)?;
        let ctx = SyncContext::in_process(
            client.clone(),
            repository.clone(),
            FilterCapabilities::global(),
            config,
        );
        Ok(Self {
            file,
            repository,
            client,
            ctx,
        })
    }

    async fn finish(mut self, path: &Path, write: bool) -> anyhow::Result<()> {
        if write {
            self.file.events = self.repository.snapshot().await;
            self.file
                .save(path)
                .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        }
        if let Err(e) = self.client.shutdown() {
            warn!(error = %e, "Store worker already stopped");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Refresh {
            snapshot,
            event,
            subject_days,
            write,
        } => {
            let mut config = SyncConfig::from_env();
            if let Some(days) = subject_days {
                config = config
                    .try_with_subject_lookback_days(days)
                    .context("invalid --subject-days")?;
            }
            let runtime = Runtime::open(&snapshot, config)?;
            refresh(&runtime, event).await?;
            runtime.finish(&snapshot, write).await
        }
        Command::Sweep { snapshot, write } => {
            let runtime = Runtime::open(&snapshot, SyncConfig::from_env())?;
            sweep(&runtime).await?;
            runtime.finish(&snapshot, write).await
        }
    }
}

async fn refresh(runtime: &Runtime, event_id: Uuid) -> anyhow::Result<()> {
    let session = EventSession::new(runtime.ctx.clone());
    if session.load(event_id).await?.is_none() {
        bail!("event {event_id} not found in snapshot");
    }

    let mut progress = session.coordinator().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            if let RefreshEvent::Progress {
                percent,
                stage,
                message,
                ..
            } = event
            {
                info!(percent, %stage, "{}", message);
            }
        }
    });

    let outcome = session.refresh().await?;
    printer.abort();

    match outcome {
        RefreshOutcome::Completed(report) | RefreshOutcome::Discarded(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        RefreshOutcome::Superseded => println!("refresh was superseded"),
        RefreshOutcome::EventMissing => bail!("event {event_id} disappeared during refresh"),
    }
    Ok(())
}

async fn sweep(runtime: &Runtime) -> anyhow::Result<()> {
    match CatchUpSweep::new(runtime.ctx.clone()).run().await? {
        SweepOutcome::Completed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SweepOutcome::Superseded(report) => {
            println!("sweep was cancelled after {} event(s)", report.triggered);
        }
    }
    Ok(())
}

/// Initialize tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "mailcase=info")
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "mailcase=info,mailcase_sync=info,mailcase_memory=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = Path::new(path);
        let file_dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("mailcase.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Logs go to stderr so stdout carries only the report.
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}
