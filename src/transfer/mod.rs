//! Transfer engine: admission control, per-attempt HTTP, outcome
//! classification and the retry state machine.
//!
//! # Overview
//!
//! - [`RateLimiter`] - run-wide token bucket
//! - [`HttpClient`] - per-identity clients, atomic GET-to-file, PUT upload
//! - [`StatusPolicy`] / [`TransferOutcome`] - what a remote answer means
//! - [`RetryPolicy`] - backoff and rate-limit pause timing
//! - [`TransferWorker`] - drives one item to a terminal outcome
//! - [`DownloadTransfer`] / [`UploadTransfer`] - the two kinds of work

pub mod constants;
mod client;
mod download;
mod error;
mod outcome;
mod rate_limiter;
mod retry;
mod upload;
mod worker;

pub use client::{ClientSettings, HttpClient};
pub use download::DownloadTransfer;
pub use error::TransferError;
pub use outcome::{StatusPolicy, TransferOutcome};
pub use rate_limiter::RateLimiter;
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_RATE_LIMIT_PAUSES, RetryDecision, RetryPolicy,
    parse_retry_after,
};
pub use upload::{
    ACCESS_KEY_HEADER, CdnLayout, DEFAULT_KEY_PREFIX, DEFAULT_STORAGE_HOST, UploadTransfer,
};
pub use worker::{Transfer, TransferWorker, WorkResult, WorkerContext};
