//! Durable record of finished work.
//!
//! A checkpoint is one JSON document with three sets of item identifiers
//! and the time it was written:
//!
//! ```json
//! {"completed": [1, 2, 3], "failed": [7], "notFound": [3], "timestamp": "..."}
//! ```
//!
//! `completed` always contains `notFound`, and an item is never both
//! `completed` and `failed` in a saved document. The file is replaced
//! wholesale through a temporary sibling and a rename, so a crash while
//! saving leaves the previous checkpoint intact.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::transfer::TransferOutcome;

/// Errors loading or saving checkpoint artifacts.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("checkpoint IO error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint document is malformed.
    #[error("malformed checkpoint {path}: {source}")]
    Parse {
        /// File involved.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl CheckpointError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Completed, failed and not-found item sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: DeserializeOwned + Ord"))]
pub struct CheckpointState<K: Ord> {
    /// Items that succeeded or are permanently absent.
    #[serde(default)]
    pub completed: BTreeSet<K>,
    /// Items that exhausted their retry budget.
    #[serde(default)]
    pub failed: BTreeSet<K>,
    /// Items the remote reported as absent.
    #[serde(default, rename = "notFound", alias = "not_found")]
    pub not_found: BTreeSet<K>,
    /// RFC 3339 time of the last save.
    #[serde(default)]
    pub timestamp: String,
}

impl<K: Ord> Default for CheckpointState<K> {
    fn default() -> Self {
        Self {
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            not_found: BTreeSet::new(),
            timestamp: String::new(),
        }
    }
}

impl<K> CheckpointState<K>
where
    K: Ord + Clone + Display + Serialize + DeserializeOwned,
{
    /// Loads a checkpoint; a missing file yields an empty state.
    ///
    /// The loaded state is normalized, so hand-edited documents that break
    /// the set invariants are repaired rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] when the file exists but cannot be read
    /// or parsed.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no checkpoint yet");
                return Ok(Self::default());
            }
            Err(e) => return Err(CheckpointError::io(path, e)),
        };
        let mut state: Self =
            serde_json::from_str(&contents).map_err(|source| CheckpointError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        state.normalize();
        info!(
            completed = state.completed.len(),
            failed = state.failed.len(),
            not_found = state.not_found.len(),
            saved_at = %state.timestamp,
            "loaded checkpoint"
        );
        Ok(state)
    }

    /// Stamps and writes the checkpoint atomically.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on any filesystem failure; the previous
    /// checkpoint file is left untouched in that case.
    pub fn save(&mut self, path: &Path) -> Result<(), CheckpointError> {
        self.normalize();
        self.timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let json = serde_json::to_vec_pretty(self).map_err(|source| CheckpointError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, &json)?;
        debug!(
            path = %path.display(),
            completed = self.completed.len(),
            failed = self.failed.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Folds a terminal outcome into the sets.
    ///
    /// Credential-expired items are left untouched so the next run picks
    /// them up again with fresh credentials.
    pub fn record(&mut self, item: &K, outcome: &TransferOutcome) {
        match outcome {
            TransferOutcome::Success { .. } => {
                self.failed.remove(item);
                self.completed.insert(item.clone());
            }
            TransferOutcome::NotFound => {
                self.failed.remove(item);
                self.not_found.insert(item.clone());
                self.completed.insert(item.clone());
            }
            TransferOutcome::RetriesExhausted { .. }
            | TransferOutcome::RateLimited { .. }
            | TransferOutcome::ServerBusy
            | TransferOutcome::TransientError(_) => {
                if !self.completed.contains(item) {
                    self.failed.insert(item.clone());
                }
            }
            TransferOutcome::CredentialExpired => {}
        }
    }

    /// Marks items found at the destination as completed.
    pub fn absorb_existing<I: IntoIterator<Item = K>>(&mut self, existing: I) {
        for item in existing {
            self.failed.remove(&item);
            self.completed.insert(item);
        }
    }

    /// Forgets every not-found verdict so those items are fetched again.
    ///
    /// Returns how many items were released.
    pub fn forget_not_found(&mut self) -> usize {
        let released = std::mem::take(&mut self.not_found);
        for item in &released {
            self.completed.remove(item);
        }
        if !released.is_empty() {
            info!(count = released.len(), "rechecking items previously reported absent");
        }
        released.len()
    }

    /// Restores the set invariants.
    pub fn normalize(&mut self) {
        self.completed.extend(self.not_found.iter().cloned());
        let completed = &self.completed;
        self.failed.retain(|item| !completed.contains(item));
    }
}

/// Writes `failed` to `path`, sorted, one identifier per line.
///
/// An empty set removes a report left over from an earlier run.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] on filesystem failure.
pub fn write_failure_report<K: Display>(
    path: &Path,
    failed: &BTreeSet<K>,
) -> Result<(), CheckpointError> {
    if failed.is_empty() {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale failure report"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CheckpointError::io(path, e)),
        }
        return Ok(());
    }
    let mut body = String::new();
    for item in failed {
        body.push_str(&item.to_string());
        body.push('\n');
    }
    write_atomic(path, body.as_bytes())?;
    warn!(
        path = %path.display(),
        count = failed.len(),
        "failed items written for manual re-run"
    );
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| CheckpointError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CheckpointError::io(dir, e))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| CheckpointError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| CheckpointError::io(path, e.error))?;

    if let Ok(dir) = std::fs::File::open(dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}
