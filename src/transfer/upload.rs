//! CDN re-upload transfer.
//!
//! Each item is an image id `<folder>/<file>` below the source root. It is
//! stored under `<key_prefix>/<folder>/<file>` in the storage zone with an
//! authenticated `PUT`; the access key travels as a credential header so an
//! expired key is detected like any other stale credential. Terminal
//! results are written to the upload ledger.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::TransferError;
use super::client::HttpClient;
use super::outcome::{StatusPolicy, TransferOutcome};
use super::worker::{Transfer, WorkResult};
use crate::identity::Identity;
use crate::ledger::{Ledger, UploadTarget};
use crate::work::image_path;

/// Default storage API host.
pub const DEFAULT_STORAGE_HOST: &str = "storage.bunnycdn.com";
/// Default key prefix inside the storage zone.
pub const DEFAULT_KEY_PREFIX: &str = "images";
/// Header carrying the storage access key.
pub const ACCESS_KEY_HEADER: &str = "AccessKey";

/// Mapping from image id to storage and public URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnLayout {
    /// Storage API host, e.g. `storage.bunnycdn.com`.
    pub storage_host: String,
    /// Storage zone name.
    pub zone: String,
    /// Public pull-zone host, e.g. `zone.b-cdn.net`.
    pub cdn_host: String,
    /// Key prefix, `images` by default.
    pub key_prefix: String,
    /// URL scheme of both hosts; `https` outside of tests.
    pub scheme: String,
}

impl CdnLayout {
    /// Layout with the default storage host, prefix and scheme.
    #[must_use]
    pub fn new(zone: impl Into<String>, cdn_host: impl Into<String>) -> Self {
        Self {
            storage_host: DEFAULT_STORAGE_HOST.to_string(),
            zone: zone.into(),
            cdn_host: cdn_host.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            scheme: "https".to_string(),
        }
    }

    /// Storage key of `id`.
    #[must_use]
    pub fn key(&self, id: &str) -> String {
        let prefix = self.key_prefix.trim_matches('/');
        if prefix.is_empty() {
            id.to_string()
        } else {
            format!("{prefix}/{id}")
        }
    }

    /// `PUT` target of `id`.
    #[must_use]
    pub fn storage_url(&self, id: &str) -> String {
        format!(
            "{}://{}/{}/{}",
            self.scheme,
            self.storage_host,
            self.zone,
            encode_key(&self.key(id))
        )
    }

    /// Public URL of `id`.
    #[must_use]
    pub fn public_url(&self, id: &str) -> String {
        format!(
            "{}://{}/{}",
            self.scheme,
            self.cdn_host,
            encode_key(&self.key(id))
        )
    }
}

/// Percent-encodes each path segment, keeping the separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Uploads image ids from `source_root` to the CDN storage zone.
#[derive(Debug)]
pub struct UploadTransfer {
    client: Arc<HttpClient>,
    layout: CdnLayout,
    source_root: PathBuf,
    ledger: Option<Ledger>,
    policy: StatusPolicy,
}

impl UploadTransfer {
    /// Creates an upload transfer using the storage API's status meanings.
    #[must_use]
    pub fn new(client: Arc<HttpClient>, layout: CdnLayout, source_root: PathBuf) -> Self {
        Self {
            client,
            layout,
            source_root,
            ledger: None,
            policy: StatusPolicy::cdn_storage(),
        }
    }

    /// Records terminal results in `ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// The URL layout.
    #[must_use]
    pub fn layout(&self) -> &CdnLayout {
        &self.layout
    }

    /// Ledger description of `id`.
    #[must_use]
    pub fn target(&self, id: &str) -> UploadTarget {
        UploadTarget {
            item_id: id.to_string(),
            local_path: image_path(&self.source_root, id).display().to_string(),
            cdn_path: self.layout.key(id),
            cdn_url: self.layout.public_url(id),
        }
    }
}

#[async_trait]
impl Transfer for UploadTransfer {
    type Item = String;

    fn status_policy(&self) -> &StatusPolicy {
        &self.policy
    }

    async fn attempt(
        &self,
        item: &String,
        identity: Option<&Identity>,
    ) -> Result<u64, TransferError> {
        let source = image_path(&self.source_root, item);
        let url = self.layout.storage_url(item);
        self.client.put_file(&url, &source, identity).await
    }

    async fn started(&self, item: &String) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        if let Err(error) = ledger.record_pending(&self.target(item)).await {
            warn!(item = %item, error = %error, "failed to mark upload pending");
        }
    }

    async fn finished(&self, result: &WorkResult<String>) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let target = self.target(&result.item);
        let recorded = match &result.outcome {
            TransferOutcome::Success { bytes } => {
                let hash = file_hash(Path::new(&target.local_path)).await;
                ledger
                    .record_success(&target, *bytes, hash.as_deref(), result.attempts)
                    .await
            }
            TransferOutcome::RetriesExhausted { last_error } => {
                ledger
                    .record_failure(&target, last_error, result.attempts)
                    .await
            }
            _ => Ok(()),
        };
        if let Err(error) = recorded {
            warn!(item = %result.item, error = %error, "failed to update upload ledger");
        }
    }
}

async fn file_hash(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(format!("{:x}", Sha256::digest(&bytes))),
        Err(error) => {
            warn!(path = %path.display(), error = %error, "cannot hash uploaded file");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_urls() {
        let layout = CdnLayout::new("epstein-archive", "epstein.b-cdn.net");
        assert_eq!(layout.key("EFTA00000001/page 1.png"), "images/EFTA00000001/page 1.png");
        assert_eq!(
            layout.storage_url("EFTA00000001/page 1.png"),
            "https://storage.bunnycdn.com/epstein-archive/images/EFTA00000001/page%201.png"
        );
        assert_eq!(
            layout.public_url("EFTA00000001/p.png"),
            "https://epstein.b-cdn.net/images/EFTA00000001/p.png"
        );
    }

    #[test]
    fn test_empty_prefix() {
        let mut layout = CdnLayout::new("zone", "cdn.test");
        layout.key_prefix = "/".to_string();
        assert_eq!(layout.key("a/b.png"), "a/b.png");
    }

    #[tokio::test]
    async fn test_file_hash_is_sha256_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.png");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_hash(&path).await.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(file_hash(&dir.path().join("missing.png")).await, None);
    }
}
