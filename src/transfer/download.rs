//! Numbered-document download transfer.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::TransferError;
use super::client::HttpClient;
use super::outcome::StatusPolicy;
use super::worker::Transfer;
use crate::identity::Identity;
use crate::work::DatasetLayout;

/// Fetches `layout.url(n)` into `output_dir/layout.file_name(n)`.
#[derive(Debug)]
pub struct DownloadTransfer {
    client: Arc<HttpClient>,
    layout: DatasetLayout,
    output_dir: PathBuf,
    policy: StatusPolicy,
}

impl DownloadTransfer {
    /// Creates a download transfer using the document host's status meanings.
    #[must_use]
    pub fn new(client: Arc<HttpClient>, layout: DatasetLayout, output_dir: PathBuf) -> Self {
        Self {
            client,
            layout,
            output_dir,
            policy: StatusPolicy::document_host(),
        }
    }

    /// Overrides the status meanings.
    #[must_use]
    pub fn with_status_policy(mut self, policy: StatusPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The naming layout.
    #[must_use]
    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Destination directory.
    #[must_use]
    pub fn output_dir(&self) -> &std::path::Path {
        &self.output_dir
    }
}

#[async_trait]
impl Transfer for DownloadTransfer {
    type Item = u64;

    fn status_policy(&self) -> &StatusPolicy {
        &self.policy
    }

    async fn attempt(&self, item: &u64, identity: Option<&Identity>) -> Result<u64, TransferError> {
        let url = self.layout.url(*item);
        let dest = self.output_dir.join(self.layout.file_name(*item));
        self.client.get_to_file(&url, &dest, identity).await
    }
}
