//! Bulkfetch Core Library
//!
//! Resilient bulk transfer engine: fetches a large, numerically indexed
//! corpus of remote files under rate limiting, and re-uploads derived
//! images to a CDN storage zone, resuming across restarts.
//!
//! # Architecture
//!
//! - [`transfer`] - rate limiter, HTTP client, outcome classification,
//!   retry state machine, download and upload transfers
//! - [`identity`] - rotating pool of egress proxies
//! - [`auth`] - credential bundle, staleness detection, provider hook
//! - [`checkpoint`] - durable completed/failed/not-found sets
//! - [`orchestrator`] - batches, concurrency, checkpointing, cancellation
//! - [`stats`] - counters, throughput and ETA
//! - [`work`] - item naming and destination scans
//! - [`db`] / [`ledger`] - SQLite upload ledger and CDN mapping export
//! - [`config`] - TOML config file and CLI override resolution
//! - [`runner`] - complete download, upload and export runs

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod identity;
pub mod ledger;
pub mod orchestrator;
pub mod runner;
pub mod shutdown;
pub mod stats;
pub mod transfer;
pub mod work;

// Re-export commonly used types
pub use auth::{CredentialBundle, CredentialError, CredentialSource, CredentialStore};
pub use checkpoint::{CheckpointError, CheckpointState, write_failure_report};
pub use config::{ConfigError, DownloadConfig, ExportConfig, FileConfig, UploadConfig};
pub use db::{Database, DbError};
pub use identity::{Identity, IdentityError, IdentityPool};
pub use ledger::{Ledger, LedgerError};
pub use orchestrator::{
    Orchestrator, OrchestratorError, OrchestratorSettings, ProgressReporter, RunSummary,
};
pub use runner::{RunError, export_mapping, run_download, run_upload};
pub use shutdown::{SharedShutdown, ShutdownCoordinator};
pub use stats::{Counters, Statistics, StatsSnapshot};
pub use transfer::{
    HttpClient, RateLimiter, RetryPolicy, TransferError, TransferOutcome, TransferWorker,
};
pub use work::{DatasetLayout, WorkKey};
