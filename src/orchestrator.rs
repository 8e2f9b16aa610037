//! Batch driver.
//!
//! The [`Orchestrator`] splits a planned work set into fixed-size batches.
//! For every batch it rotates the identity chunk, runs the items on
//! [`TransferWorker`]s under a batch-local semaphore, folds the outcomes
//! into the checkpoint and saves it. Progress and ETA are logged after each
//! batch; the failure report is written once the run completes.
//!
//! An interrupt aborts the in-flight batch without saving it, so the file
//! on disk always describes whole batches.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::{CheckpointError, CheckpointState, write_failure_report};
use crate::shutdown::SharedShutdown;
use crate::stats::{Counters, StatsSnapshot, format_bytes, format_duration};
use crate::transfer::{Transfer, TransferOutcome, TransferWorker, WorkResult};
use crate::work::{WorkKey, plan_work};

/// Default number of simultaneous transfers.
pub const DEFAULT_CONCURRENCY: usize = 20;
/// Default number of items per batch.
pub const DEFAULT_BATCH_SIZE: usize = 5000;
/// Minimum allowed concurrency.
pub const MIN_CONCURRENCY: usize = 1;
/// Maximum allowed concurrency.
pub const MAX_CONCURRENCY: usize = 1000;

/// Errors that stop a run.
///
/// Item failures are never reported here; they end up in the checkpoint.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// Batch size of zero.
    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    /// Checkpoint or failure report could not be written.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Observer of run progress, used by the binary to draw a progress bar.
pub trait ProgressReporter: Send + Sync {
    /// Called once with the number of planned items.
    fn run_started(&self, _total: u64) {}

    /// Called when an item reaches its terminal outcome.
    fn item_finished(&self, _outcome: &TransferOutcome) {}

    /// Called after a batch was checkpointed.
    fn batch_finished(&self, _batch: usize, _batches: usize, _snapshot: &StatsSnapshot) {}
}

/// Batch and persistence settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Simultaneous transfers per batch.
    pub concurrency: usize,
    /// Items per batch.
    pub batch_size: usize,
    /// Checkpoint document.
    pub checkpoint_path: PathBuf,
    /// Failure report written at the end of a run.
    pub failure_report: PathBuf,
}

impl OrchestratorSettings {
    /// Settings with default concurrency and batch size.
    #[must_use]
    pub fn new(checkpoint_path: impl Into<PathBuf>, failure_report: impl Into<PathBuf>) -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_path: checkpoint_path.into(),
            failure_report: failure_report.into(),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Items planned for this run.
    pub planned: u64,
    /// Items that reached a terminal outcome in saved batches.
    pub processed: u64,
    /// Batches saved.
    pub batches: usize,
    /// Counters at the end of the run.
    pub counters: Counters,
    /// Items left untouched because the session expired.
    pub credential_expired: u64,
    /// Failed items in the checkpoint after the run.
    pub failed: usize,
    /// The run stopped on an interrupt.
    pub interrupted: bool,
}

impl RunSummary {
    /// Whether the operator has to refresh credentials before re-running.
    #[must_use]
    pub fn needs_new_credentials(&self) -> bool {
        self.credential_expired > 0
    }
}

/// Items to transfer: `requested` minus the checkpoint's completed set and
/// whatever is already `present` at the destination.
///
/// `present` items are folded into the checkpoint's completed set, and with
/// `recheck_not_found` earlier absence verdicts are dropped first.
pub fn plan<K, I>(
    requested: I,
    checkpoint: &mut CheckpointState<K>,
    present: BTreeSet<K>,
    recheck_not_found: bool,
) -> Vec<K>
where
    K: WorkKey,
    I: IntoIterator<Item = K>,
{
    if recheck_not_found {
        checkpoint.forget_not_found();
    }
    let pending = plan_work(requested, &[&checkpoint.completed, &present]);
    checkpoint.absorb_existing(present);
    pending
}

/// Runs batches of one [`Transfer`].
pub struct Orchestrator<T: Transfer> {
    worker: TransferWorker<T>,
    settings: OrchestratorSettings,
    shutdown: SharedShutdown,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl<T: Transfer> std::fmt::Debug for Orchestrator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("has_reporter", &self.reporter.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Transfer> Orchestrator<T> {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConcurrency`] or
    /// [`OrchestratorError::InvalidBatchSize`] for out-of-range settings.
    pub fn new(
        worker: TransferWorker<T>,
        settings: OrchestratorSettings,
        shutdown: SharedShutdown,
    ) -> Result<Self, OrchestratorError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&settings.concurrency) {
            return Err(OrchestratorError::InvalidConcurrency {
                value: settings.concurrency,
            });
        }
        if settings.batch_size == 0 {
            return Err(OrchestratorError::InvalidBatchSize);
        }
        Ok(Self {
            worker,
            settings,
            shutdown,
            reporter: None,
        })
    }

    /// Attaches a progress observer.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// The batch settings.
    #[must_use]
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Transfers `items` batch by batch, saving `checkpoint` after each one.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Checkpoint`] when the checkpoint or the
    /// failure report cannot be written. Item failures are not errors.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn run(
        &self,
        items: Vec<T::Item>,
        checkpoint: &mut CheckpointState<T::Item>,
    ) -> Result<RunSummary, OrchestratorError> {
        let planned = items.len() as u64;
        let batches = items.len().div_ceil(self.settings.batch_size);
        let stats = Arc::clone(&self.worker.context().stats);
        let identities = Arc::clone(&self.worker.context().identities);

        info!(
            planned,
            batches,
            batch_size = self.settings.batch_size,
            concurrency = self.settings.concurrency,
            identities = identities.len(),
            "starting run"
        );
        if let Some(reporter) = &self.reporter {
            reporter.run_started(planned);
        }

        let mut processed: u64 = 0;
        let mut saved_batches = 0usize;
        let mut credential_expired: u64 = 0;
        let mut interrupted = false;

        for (index, batch) in items.chunks(self.settings.batch_size).enumerate() {
            if self.shutdown.is_shutdown_requested() {
                interrupted = true;
                break;
            }
            identities.advance_chunk();
            debug!(
                batch = index + 1,
                size = batch.len(),
                chunk = identities.current_chunk(),
                "dispatching batch"
            );

            let Some(results) = self.run_batch(batch.to_vec()).await? else {
                interrupted = true;
                break;
            };

            let mut expired_in_batch = 0u64;
            for result in &results {
                if result.outcome == TransferOutcome::CredentialExpired {
                    expired_in_batch += 1;
                }
                checkpoint.record(&result.item, &result.outcome);
            }
            checkpoint.save(&self.settings.checkpoint_path)?;
            processed += results.len() as u64;
            saved_batches += 1;
            credential_expired += expired_in_batch;

            let snapshot = stats.snapshot(planned.saturating_sub(processed));
            let counters = snapshot.counters;
            info!(
                batch = index + 1,
                batches,
                success = counters.success,
                not_found = counters.not_found,
                failed = counters.failed,
                retries = counters.retries,
                files_per_sec = %format!("{:.1}", snapshot.items_per_sec),
                downloaded = %format_bytes(counters.bytes),
                eta = %snapshot.eta.map_or_else(|| "unknown".to_string(), format_duration),
                "batch complete"
            );
            if expired_in_batch > 0 {
                error!(
                    batch = index + 1,
                    items = expired_in_batch,
                    "session expired during batch; refresh credentials and re-run"
                );
            }
            if let Some(reporter) = &self.reporter {
                reporter.batch_finished(index + 1, batches, &snapshot);
            }
        }

        if interrupted {
            warn!(
                saved_batches,
                "interrupted; last saved checkpoint kept, run again to resume"
            );
        } else {
            write_failure_report(&self.settings.failure_report, &checkpoint.failed)?;
        }

        let summary = RunSummary {
            planned,
            processed,
            batches: saved_batches,
            counters: stats.counters(),
            credential_expired,
            failed: checkpoint.failed.len(),
            interrupted,
        };
        info!(
            processed = summary.processed,
            success = summary.counters.success,
            not_found = summary.counters.not_found,
            failed = summary.failed,
            credential_expired = summary.credential_expired,
            elapsed = %format_duration(stats.elapsed()),
            "run finished"
        );
        Ok(summary)
    }

    /// Runs one batch; `None` when an interrupt aborted it.
    async fn run_batch(
        &self,
        batch: Vec<T::Item>,
    ) -> Result<Option<Vec<WorkResult<T::Item>>>, OrchestratorError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut handles: Vec<JoinHandle<WorkResult<T::Item>>> = Vec::with_capacity(batch.len());

        for item in batch {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|_| OrchestratorError::SemaphoreClosed)?
                }
                () = self.shutdown.wait_for_shutdown() => {
                    abort_all(handles).await;
                    return Ok(None);
                }
            };

            let worker = self.worker.clone();
            let reporter = self.reporter.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = worker.run(item).await;
                if let Some(reporter) = reporter {
                    reporter.item_finished(&result.outcome);
                }
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut index = 0;
        while index < handles.len() {
            let joined = tokio::select! {
                joined = &mut handles[index] => Some(joined),
                () = self.shutdown.wait_for_shutdown() => None,
            };
            match joined {
                Some(Ok(result)) => results.push(result),
                // A panicking transfer leaves its item out of the checkpoint.
                Some(Err(e)) => warn!(error = %e, "transfer task panicked"),
                None => {
                    abort_all(handles.split_off(index)).await;
                    return Ok(None);
                }
            }
            index += 1;
        }
        Ok(Some(results))
    }
}

async fn abort_all<R>(handles: Vec<JoinHandle<R>>) {
    debug!(tasks = handles.len(), "aborting in-flight transfers");
    for handle in &handles {
        handle.abort();
    }
    // Wait so temporary files are dropped before the caller returns.
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::auth::CredentialStore;
    use crate::identity::{Identity, IdentityPool};
    use crate::shutdown::ShutdownCoordinator;
    use crate::stats::Statistics;
    use crate::transfer::{RateLimiter, RetryPolicy, StatusPolicy, TransferError, WorkerContext};

    /// Answers every attempt of an item with a fixed status (`None` = 200).
    struct FixedStatus {
        policy: StatusPolicy,
        statuses: HashMap<u64, u16>,
        attempts: Mutex<Vec<u64>>,
        hang: bool,
    }

    impl FixedStatus {
        fn new(statuses: &[(u64, u16)]) -> Self {
            Self {
                policy: StatusPolicy::document_host(),
                statuses: statuses.iter().copied().collect(),
                attempts: Mutex::new(Vec::new()),
                hang: false,
            }
        }

        fn attempted(&self) -> Vec<u64> {
            let mut items = self.attempts.lock().unwrap().clone();
            items.sort_unstable();
            items
        }
    }

    #[async_trait]
    impl Transfer for FixedStatus {
        type Item = u64;

        fn status_policy(&self) -> &StatusPolicy {
            &self.policy
        }

        async fn attempt(
            &self,
            item: &u64,
            _identity: Option<&Identity>,
        ) -> Result<u64, TransferError> {
            self.attempts.lock().unwrap().push(*item);
            if self.hang {
                std::future::pending::<()>().await;
            }
            match self.statuses.get(item) {
                Some(status) => Err(TransferError::http_status("http://test/", *status)),
                None => Ok(10),
            }
        }
    }

    fn orchestrator(
        transfer: Arc<FixedStatus>,
        dir: &std::path::Path,
        batch_size: usize,
        shutdown: SharedShutdown,
    ) -> Orchestrator<FixedStatus> {
        let context = Arc::new(WorkerContext {
            rate_limiter: Arc::new(RateLimiter::disabled()),
            identities: Arc::new(IdentityPool::empty()),
            credentials: Arc::new(CredentialStore::default()),
            stats: Arc::new(Statistics::new()),
            retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40), 2.0)
                .jitter(Duration::ZERO),
        });
        let mut settings =
            OrchestratorSettings::new(dir.join("checkpoint.json"), dir.join("failed.txt"));
        settings.batch_size = batch_size;
        settings.concurrency = 4;
        Orchestrator::new(TransferWorker::new(transfer, context), settings, shutdown).unwrap()
    }

    #[test]
    fn test_plan_skips_completed_and_present() {
        let mut checkpoint = CheckpointState::<u64>::default();
        checkpoint.completed.extend([1, 2]);
        checkpoint.failed.insert(5);
        let present: BTreeSet<u64> = [3, 5].into_iter().collect();

        let pending = plan(1..=6, &mut checkpoint, present, false);
        assert_eq!(pending, vec![4, 6]);
        assert!(checkpoint.completed.contains(&5));
        assert!(checkpoint.failed.is_empty());
    }

    #[test]
    fn test_plan_recheck_not_found_releases_absent_items() {
        let mut checkpoint = CheckpointState::<u64>::default();
        checkpoint.not_found.insert(2);
        checkpoint.normalize();

        assert_eq!(plan(1..=3, &mut checkpoint.clone(), BTreeSet::new(), false), vec![1, 3]);
        assert_eq!(plan(1..=3, &mut checkpoint, BTreeSet::new(), true), vec![1, 2, 3]);
        assert!(checkpoint.not_found.is_empty());
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Arc::new(FixedStatus::new(&[]));
        let context = Arc::new(WorkerContext {
            rate_limiter: Arc::new(RateLimiter::disabled()),
            identities: Arc::new(IdentityPool::empty()),
            credentials: Arc::new(CredentialStore::default()),
            stats: Arc::new(Statistics::new()),
            retry: RetryPolicy::default(),
        });
        let worker = TransferWorker::new(transfer, context);

        let mut settings = OrchestratorSettings::new(dir.path().join("c"), dir.path().join("f"));
        settings.concurrency = 0;
        assert!(matches!(
            Orchestrator::new(worker.clone(), settings.clone(), ShutdownCoordinator::shared()),
            Err(OrchestratorError::InvalidConcurrency { value: 0 })
        ));
        settings.concurrency = 1;
        settings.batch_size = 0;
        assert!(matches!(
            Orchestrator::new(worker, settings, ShutdownCoordinator::shared()),
            Err(OrchestratorError::InvalidBatchSize)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_records_outcomes_and_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Arc::new(FixedStatus::new(&[(3, 404), (4, 503)]));
        let orch = orchestrator(
            Arc::clone(&transfer),
            dir.path(),
            2,
            ShutdownCoordinator::shared(),
        );
        let mut checkpoint = CheckpointState::default();

        let summary = orch.run((1..=5).collect(), &mut checkpoint).await.unwrap();

        assert_eq!(summary.planned, 5);
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.failed, 1);
        assert!(!summary.interrupted);
        assert_eq!(checkpoint.completed, [1, 2, 3, 5].into_iter().collect());
        assert_eq!(checkpoint.not_found, [3].into_iter().collect());
        assert_eq!(checkpoint.failed, [4].into_iter().collect());

        let saved = CheckpointState::<u64>::load(&dir.path().join("checkpoint.json")).unwrap();
        assert_eq!(saved.completed, checkpoint.completed);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("failed.txt")).unwrap(),
            "4\n"
        );
        // 404 once, 503 three times, the rest once each.
        assert_eq!(transfer.attempted(), vec![1, 2, 3, 4, 4, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_is_reported_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Arc::new(FixedStatus::new(&[(1, 302), (2, 302)]));
        let orch = orchestrator(transfer, dir.path(), 10, ShutdownCoordinator::shared());
        let mut checkpoint = CheckpointState::default();

        let summary = orch.run(vec![1, 2], &mut checkpoint).await.unwrap();

        assert_eq!(summary.credential_expired, 2);
        assert!(summary.needs_new_credentials());
        assert!(checkpoint.completed.is_empty());
        assert!(checkpoint.failed.is_empty());
        assert!(!dir.path().join("failed.txt").exists());
    }

    #[tokio::test]
    async fn test_interrupt_keeps_last_saved_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut transfer = FixedStatus::new(&[]);
        transfer.hang = true;
        let shutdown = ShutdownCoordinator::shared();
        let orch = orchestrator(Arc::new(transfer), dir.path(), 10, Arc::clone(&shutdown));
        let mut checkpoint = CheckpointState::default();

        let trigger = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.request_shutdown();
            })
        };
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            orch.run((1..=20).collect(), &mut checkpoint),
        )
        .await
        .unwrap()
        .unwrap();
        trigger.await.unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.batches, 0);
        assert!(checkpoint.completed.is_empty());
        assert!(!dir.path().join("checkpoint.json").exists());
    }
}
