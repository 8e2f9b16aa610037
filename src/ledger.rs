//! Upload ledger: which local images already live on the CDN.
//!
//! Rows with status `success` are the already-done set of upload mode and
//! the source of the `{local_path: cdn_url}` mapping consumed by the
//! database population step.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use sqlx::{FromRow, Row};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::db::Database;

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Query failure.
    #[error("ledger query failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Writing the mapping export failed.
    #[error("failed to write mapping {path}: {source}")]
    Export {
        /// Output file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Status column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Known but not yet uploaded.
    Pending,
    /// On the CDN.
    Success,
    /// Gave up after the retry budget.
    Failed,
}

impl UploadStatus {
    /// Column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Where one image lives locally and on the CDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// `<folder>/<file>` identifier.
    pub item_id: String,
    /// Absolute local path.
    pub local_path: String,
    /// Storage key, e.g. `images/<folder>/<file>`.
    pub cdn_path: String,
    /// Public URL.
    pub cdn_url: String,
}

/// One ledger row.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    /// `<folder>/<file>` identifier.
    pub item_id: String,
    /// Absolute local path.
    pub local_path: String,
    /// Storage key.
    pub cdn_path: String,
    /// Public URL.
    pub cdn_url: String,
    /// SHA-256 of the uploaded bytes.
    pub file_hash: Option<String>,
    /// Size of the uploaded file.
    pub size_bytes: Option<i64>,
    /// `pending`, `success` or `failed`.
    pub status: String,
    /// Attempts made by the last run that touched the row.
    pub attempts: i64,
    /// Last error of a failed upload.
    pub last_error: Option<String>,
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    /// Pending rows.
    pub pending: i64,
    /// Successful rows.
    pub success: i64,
    /// Failed rows.
    pub failed: i64,
}

/// Upload ledger backed by [`Database`].
#[derive(Debug, Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    /// Wraps an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Marks an upload as started. A row already marked successful is left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the upsert fails.
    #[instrument(skip(self, target), fields(item = %target.item_id))]
    pub async fn record_pending(&self, target: &UploadTarget) -> Result<(), LedgerError> {
        sqlx::query(
            r"INSERT INTO uploads (item_id, local_path, cdn_path, cdn_url, status)
              VALUES (?, ?, ?, ?, ?)
              ON CONFLICT(item_id) DO UPDATE SET
                status = excluded.status
              WHERE uploads.status != 'success'",
        )
        .bind(&target.item_id)
        .bind(&target.local_path)
        .bind(&target.cdn_path)
        .bind(&target.cdn_url)
        .bind(UploadStatus::Pending.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Records a completed upload, replacing any earlier failure.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the upsert fails.
    #[instrument(skip(self, target, file_hash), fields(item = %target.item_id))]
    pub async fn record_success(
        &self,
        target: &UploadTarget,
        size_bytes: u64,
        file_hash: Option<&str>,
        attempts: u32,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r"INSERT INTO uploads (
                item_id, local_path, cdn_path, cdn_url, file_hash, size_bytes,
                status, attempts, last_error, uploaded_at
              ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, datetime('now'))
              ON CONFLICT(item_id) DO UPDATE SET
                local_path = excluded.local_path,
                cdn_path = excluded.cdn_path,
                cdn_url = excluded.cdn_url,
                file_hash = excluded.file_hash,
                size_bytes = excluded.size_bytes,
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = NULL,
                uploaded_at = excluded.uploaded_at",
        )
        .bind(&target.item_id)
        .bind(&target.local_path)
        .bind(&target.cdn_path)
        .bind(&target.cdn_url)
        .bind(file_hash)
        .bind(i64::try_from(size_bytes).unwrap_or(i64::MAX))
        .bind(UploadStatus::Success.as_str())
        .bind(i64::from(attempts))
        .execute(self.db.pool())
        .await?;
        debug!("upload recorded");
        Ok(())
    }

    /// Records an upload that gave up. A row already marked successful is
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the upsert fails.
    #[instrument(skip(self, target, last_error), fields(item = %target.item_id))]
    pub async fn record_failure(
        &self,
        target: &UploadTarget,
        last_error: &str,
        attempts: u32,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r"INSERT INTO uploads (
                item_id, local_path, cdn_path, cdn_url, status, attempts, last_error
              ) VALUES (?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(item_id) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error
              WHERE uploads.status != 'success'",
        )
        .bind(&target.item_id)
        .bind(&target.local_path)
        .bind(&target.cdn_path)
        .bind(&target.cdn_url)
        .bind(UploadStatus::Failed.as_str())
        .bind(i64::from(attempts))
        .bind(last_error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Identifiers of every successful upload.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn successful_items(&self) -> Result<BTreeSet<String>, LedgerError> {
        let rows = sqlx::query(r"SELECT item_id FROM uploads WHERE status = ?")
            .bind(UploadStatus::Success.as_str())
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("item_id"))
            .collect())
    }

    /// Looks up one row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn get(&self, item_id: &str) -> Result<Option<UploadRow>, LedgerError> {
        let row = sqlx::query_as::<_, UploadRow>(
            r"SELECT item_id, local_path, cdn_path, cdn_url, file_hash, size_bytes,
                     status, attempts, last_error
              FROM uploads WHERE item_id = ?",
        )
        .bind(item_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Row counts per status.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn counts(&self) -> Result<LedgerCounts, LedgerError> {
        let rows = sqlx::query(r"SELECT status, COUNT(*) AS count FROM uploads GROUP BY status")
            .fetch_all(self.db.pool())
            .await?;
        let mut counts = LedgerCounts::default();
        for row in rows {
            let count: i64 = row.get("count");
            match row.get::<String, _>("status").as_str() {
                "pending" => counts.pending = count,
                "success" => counts.success = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// `{local_path: cdn_url}` for every successful upload.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn mapping(&self) -> Result<BTreeMap<String, String>, LedgerError> {
        let rows = sqlx::query(r"SELECT local_path, cdn_url FROM uploads WHERE status = ?")
            .bind(UploadStatus::Success.as_str())
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("local_path"), row.get("cdn_url")))
            .collect())
    }

    /// Writes [`Ledger::mapping`] to `path` as pretty JSON.
    ///
    /// Returns the number of entries written.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query or the write fails.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn export_mapping(&self, path: &Path) -> Result<usize, LedgerError> {
        let mapping = self.mapping().await?;
        let export_err = |source| LedgerError::Export {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec_pretty(&mapping).map_err(|e| export_err(e.into()))?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(export_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(export_err)?;
        tmp.write_all(&json).map_err(export_err)?;
        tmp.persist(path).map_err(|e| export_err(e.error))?;

        info!(entries = mapping.len(), "exported CDN mapping");
        Ok(mapping.len())
    }
}
