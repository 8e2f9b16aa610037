//! Per-item transfer state machine.
//!
//! A [`TransferWorker`] drives one item from its first attempt to a terminal
//! [`TransferOutcome`]:
//!
//! - success, not-found and credential-expired end the item immediately;
//! - overload and transient failures back off exponentially and consume the
//!   attempt budget;
//! - rate limiting pauses for the long fixed delay without consuming an
//!   attempt, up to the pause budget;
//! - an exhausted budget ends the item as [`TransferOutcome::RetriesExhausted`].
//!
//! Every attempt takes a rate-limiter token and the next identity of the
//! current chunk. What an attempt actually does is the [`Transfer`]'s
//! business.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::TransferError;
use super::outcome::{StatusPolicy, TransferOutcome};
use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy};
use crate::auth::CredentialStore;
use crate::identity::{Identity, IdentityPool};
use crate::stats::Statistics;
use crate::work::WorkKey;

/// One kind of transfer (download, upload) applied to work items.
#[async_trait]
pub trait Transfer: Send + Sync + 'static {
    /// Identifier of the items this transfer works on.
    type Item: WorkKey;

    /// How the remote's statuses map onto outcomes.
    fn status_policy(&self) -> &StatusPolicy;

    /// Performs one attempt, returning the payload size on success.
    async fn attempt(
        &self,
        item: &Self::Item,
        identity: Option<&Identity>,
    ) -> Result<u64, TransferError>;

    /// Hook called before the first attempt on an item.
    async fn started(&self, _item: &Self::Item) {}

    /// Hook called once the item reached its terminal outcome.
    async fn finished(&self, _result: &WorkResult<Self::Item>) {}
}

/// Terminal result of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResult<K> {
    /// The item.
    pub item: K,
    /// Terminal outcome.
    pub outcome: TransferOutcome,
    /// Network attempts made.
    pub attempts: u32,
    /// Retries scheduled (backoffs plus rate-limit pauses).
    pub retries: u32,
}

/// Shared run state every worker draws from.
#[derive(Debug)]
pub struct WorkerContext {
    /// Run-wide admission control.
    pub rate_limiter: Arc<RateLimiter>,
    /// Egress identities.
    pub identities: Arc<IdentityPool>,
    /// Credential staleness flag.
    pub credentials: Arc<CredentialStore>,
    /// Run counters.
    pub stats: Arc<Statistics>,
    /// Backoff and pause timing.
    pub retry: RetryPolicy,
}

/// Executes items of one [`Transfer`] to a terminal outcome.
#[derive(Debug)]
pub struct TransferWorker<T> {
    transfer: Arc<T>,
    context: Arc<WorkerContext>,
}

impl<T> Clone for TransferWorker<T> {
    fn clone(&self) -> Self {
        Self {
            transfer: Arc::clone(&self.transfer),
            context: Arc::clone(&self.context),
        }
    }
}

impl<T: Transfer> TransferWorker<T> {
    /// Creates a worker.
    #[must_use]
    pub fn new(transfer: Arc<T>, context: Arc<WorkerContext>) -> Self {
        Self { transfer, context }
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    /// Runs `item` to a terminal outcome.
    pub async fn run(&self, item: T::Item) -> WorkResult<T::Item> {
        let ctx = &self.context;
        let mut attempt: u32 = 1;
        let mut attempts: u32 = 0;
        let mut pauses: u32 = 0;
        let mut retries: u32 = 0;

        self.transfer.started(&item).await;
        let outcome = loop {
            ctx.rate_limiter.acquire().await;
            let identity = ctx.identities.next();
            attempts += 1;

            let outcome = match self.transfer.attempt(&item, identity.as_ref()).await {
                Ok(bytes) => TransferOutcome::Success { bytes },
                Err(error) => {
                    debug!(item = %item, attempt, error = %error, "attempt failed");
                    self.transfer.status_policy().classify(&error)
                }
            };

            match outcome {
                TransferOutcome::Success { bytes } => {
                    ctx.stats.record_success(bytes);
                    debug!(item = %item, bytes, attempts, "transfer complete");
                    break outcome;
                }
                TransferOutcome::NotFound => {
                    ctx.stats.record_not_found();
                    info!(item = %item, "remote reports item absent");
                    break outcome;
                }
                TransferOutcome::CredentialExpired => {
                    ctx.stats.record_credential_expired();
                    ctx.credentials.mark_stale();
                    warn!(item = %item, "session expired, item left for a later run");
                    break outcome;
                }
                TransferOutcome::RateLimited { retry_after } => {
                    ctx.stats.record_rate_limited();
                    match ctx.retry.should_pause(attempt, pauses, retry_after) {
                        RetryDecision::Retry { delay, .. } => {
                            pauses += 1;
                            retries += 1;
                            ctx.stats.record_retry();
                            warn!(
                                item = %item,
                                pause_ms = delay.as_millis(),
                                pauses,
                                "rate limited, pausing"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            break self.exhausted(&item, format!("rate limited: {reason}"));
                        }
                    }
                }
                TransferOutcome::ServerBusy | TransferOutcome::TransientError(_) => {
                    let last_error = match &outcome {
                        TransferOutcome::TransientError(cause) => cause.clone(),
                        _ => "server busy".to_string(),
                    };
                    match ctx.retry.should_retry(attempt) {
                        RetryDecision::Retry { delay, attempt: next } => {
                            retries += 1;
                            ctx.stats.record_retry();
                            debug!(
                                item = %item,
                                attempt,
                                delay_ms = delay.as_millis(),
                                reason = %last_error,
                                "backing off"
                            );
                            tokio::time::sleep(delay).await;
                            attempt = next;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            break self.exhausted(&item, format!("{last_error} ({reason})"));
                        }
                    }
                }
                TransferOutcome::RetriesExhausted { .. } => {
                    ctx.stats.record_failure();
                    break outcome;
                }
            }
        };

        let result = WorkResult {
            item,
            outcome,
            attempts,
            retries,
        };
        self.transfer.finished(&result).await;
        result
    }

    fn exhausted(&self, item: &T::Item, last_error: String) -> TransferOutcome {
        self.context.stats.record_failure();
        warn!(item = %item, last_error = %last_error, "giving up on item");
        TransferOutcome::RetriesExhausted { last_error }
    }
}
