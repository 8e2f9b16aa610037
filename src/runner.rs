//! Wiring of complete runs from resolved configuration.
//!
//! Everything that can make a run impossible (credentials, identity file,
//! destination, checkpoint, ledger) is checked here before the first
//! request goes out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::auth::{CredentialError, CredentialStore};
use crate::checkpoint::{CheckpointError, CheckpointState};
use crate::config::{DownloadConfig, EngineConfig, ExportConfig, UploadConfig};
use crate::db::{Database, DbError};
use crate::identity::{IdentityError, IdentityPool};
use crate::ledger::{Ledger, LedgerError};
use crate::orchestrator::{Orchestrator, OrchestratorError, ProgressReporter, RunSummary, plan};
use crate::shutdown::SharedShutdown;
use crate::stats::Statistics;
use crate::transfer::{
    DownloadTransfer, HttpClient, RateLimiter, Transfer, TransferWorker, UploadTransfer,
    WorkerContext,
};
use crate::work::{collect_images, scan_existing};

/// Reasons a run cannot start or had to stop.
#[derive(Debug, Error)]
pub enum RunError {
    /// Credential bundle unavailable or incomplete.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// Identity file unusable.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Destination or source directory unusable.
    #[error("{action} '{path}': {source}")]
    Filesystem {
        /// What was attempted.
        action: &'static str,
        /// Directory involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint unreadable or unwritable.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Ledger database could not be opened.
    #[error(transparent)]
    Database(#[from] DbError),

    /// Ledger query failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Orchestrator failure.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl RunError {
    fn filesystem(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Downloads `config.start..=config.end` into the output directory.
///
/// # Errors
///
/// Returns [`RunError`] when the run cannot start or the checkpoint cannot
/// be saved. Items that fail are reported in the summary instead.
#[instrument(skip_all, fields(start = config.start, end = config.end))]
pub async fn run_download(
    config: &DownloadConfig,
    shutdown: SharedShutdown,
    reporter: Option<Arc<dyn ProgressReporter>>,
) -> Result<RunSummary, RunError> {
    let credentials = Arc::new(CredentialStore::new(config.credentials.resolve().await?));
    let identities = load_identities(&config.engine)?;
    ensure_writable(&config.output_dir)?;

    let checkpoint_path = &config.engine.orchestrator.checkpoint_path;
    let mut checkpoint = CheckpointState::<u64>::load(checkpoint_path)?;
    let present = scan_existing(&config.output_dir, &config.layout)
        .map_err(|e| RunError::filesystem("cannot scan destination", &config.output_dir, e))?;
    info!(on_disk = present.len(), "scanned destination");
    let items = plan(
        config.start..=config.end,
        &mut checkpoint,
        present,
        config.engine.recheck_not_found,
    );

    let client = Arc::new(HttpClient::new(
        config.engine.client.clone(),
        Arc::clone(&credentials),
    ));
    let transfer = DownloadTransfer::new(client, config.layout.clone(), config.output_dir.clone());
    let orchestrator = build(
        transfer,
        &config.engine,
        identities,
        credentials,
        shutdown,
        reporter,
    )?;
    execute(&orchestrator, items, &mut checkpoint, checkpoint_path).await
}

/// Uploads every image below the source directory not yet in the ledger.
///
/// # Errors
///
/// Returns [`RunError`] when the run cannot start or the checkpoint cannot
/// be saved.
#[instrument(skip_all, fields(source = %config.source_dir.display()))]
pub async fn run_upload(
    config: &UploadConfig,
    shutdown: SharedShutdown,
    reporter: Option<Arc<dyn ProgressReporter>>,
) -> Result<RunSummary, RunError> {
    let credentials = Arc::new(CredentialStore::new(config.credentials.resolve().await?));
    let identities = load_identities(&config.engine)?;

    let images = collect_images(&config.source_dir)
        .map_err(|e| RunError::filesystem("cannot scan upload source", &config.source_dir, e))?;
    let ledger = Ledger::new(Database::new(&config.ledger).await?);
    let uploaded = ledger.successful_items().await?;
    info!(images = images.len(), uploaded = uploaded.len(), "planned uploads");

    let checkpoint_path = &config.engine.orchestrator.checkpoint_path;
    let mut checkpoint = CheckpointState::<String>::load(checkpoint_path)?;
    let items = plan(
        images,
        &mut checkpoint,
        uploaded,
        config.engine.recheck_not_found,
    );

    let client = Arc::new(HttpClient::new(
        config.engine.client.clone(),
        Arc::clone(&credentials),
    ));
    let transfer = UploadTransfer::new(client, config.layout.clone(), config.source_dir.clone())
        .with_ledger(ledger.clone());
    let orchestrator = build(
        transfer,
        &config.engine,
        identities,
        credentials,
        shutdown,
        reporter,
    )?;
    let summary = execute(&orchestrator, items, &mut checkpoint, checkpoint_path).await?;

    match ledger.counts().await {
        Ok(counts) => info!(
            success = counts.success,
            failed = counts.failed,
            pending = counts.pending,
            "upload ledger"
        ),
        Err(e) => warn!(error = %e, "cannot read upload ledger counts"),
    }
    ledger.database().clone().close().await;
    Ok(summary)
}

/// Writes the ledger's `{local_path: cdn_url}` map and returns its size.
///
/// # Errors
///
/// Returns [`RunError`] when the ledger cannot be opened or the file
/// cannot be written.
#[instrument(skip_all, fields(ledger = %config.ledger.display()))]
pub async fn export_mapping(config: &ExportConfig) -> Result<usize, RunError> {
    let ledger = Ledger::new(Database::new(&config.ledger).await?);
    let count = ledger.export_mapping(&config.output).await?;
    ledger.database().clone().close().await;
    Ok(count)
}

fn load_identities(engine: &EngineConfig) -> Result<IdentityPool, IdentityError> {
    match &engine.proxies {
        Some(path) => {
            let pool = IdentityPool::from_file(path, engine.chunk_size)?;
            if pool.is_empty() {
                warn!(
                    path = %path.display(),
                    "identity file lists no proxies, connecting directly"
                );
            }
            Ok(pool)
        }
        None => {
            info!("no identity file, connecting directly");
            Ok(IdentityPool::empty())
        }
    }
}

/// Creates `dir` and proves a file can be created inside it.
fn ensure_writable(dir: &Path) -> Result<(), RunError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| RunError::filesystem("cannot create destination", dir, e))?;
    tempfile::tempfile_in(dir)
        .map_err(|e| RunError::filesystem("destination not writable", dir, e))?;
    Ok(())
}

fn build<T: Transfer>(
    transfer: T,
    engine: &EngineConfig,
    identities: IdentityPool,
    credentials: Arc<CredentialStore>,
    shutdown: SharedShutdown,
    reporter: Option<Arc<dyn ProgressReporter>>,
) -> Result<Orchestrator<T>, OrchestratorError> {
    let context = Arc::new(WorkerContext {
        rate_limiter: Arc::new(RateLimiter::new(engine.rate)),
        identities: Arc::new(identities),
        credentials,
        stats: Arc::new(Statistics::new()),
        retry: engine.retry.clone(),
    });
    let worker = TransferWorker::new(Arc::new(transfer), context);
    let orchestrator = Orchestrator::new(worker, engine.orchestrator.clone(), shutdown)?;
    Ok(match reporter {
        Some(reporter) => orchestrator.with_reporter(reporter),
        None => orchestrator,
    })
}

async fn execute<T: Transfer>(
    orchestrator: &Orchestrator<T>,
    items: Vec<T::Item>,
    checkpoint: &mut CheckpointState<T::Item>,
    checkpoint_path: &Path,
) -> Result<RunSummary, RunError> {
    if items.is_empty() {
        info!("nothing left to transfer");
        // Persist whatever the destination scan folded in.
        checkpoint.save(checkpoint_path)?;
    }
    Ok(orchestrator.run(items, checkpoint).await?)
}
