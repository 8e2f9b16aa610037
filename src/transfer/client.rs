//! HTTP plumbing shared by the download and upload transfers.
//!
//! One `reqwest::Client` is built per egress identity and cached, so every
//! proxy keeps its own connection pool. Redirects are never followed: the
//! document host signals a lapsed session with a redirect, and that answer
//! has to reach the classifier as-is.
//!
//! Downloads stream into a hidden temporary file next to the destination and
//! are renamed onto the final name only after the body completed and was
//! synced. Dropping the future (task abort on shutdown) deletes the
//! temporary file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, COOKIE, RETRY_AFTER};
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy, RequestBuilder, Response};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, trace};
use url::Url;

use super::TransferError;
use super::constants::{
    BROWSER_USER_AGENT, CONNECT_TIMEOUT_SECS, PARTIAL_SUFFIX, REQUEST_TIMEOUT_SECS,
};
use crate::auth::CredentialStore;
use crate::identity::Identity;

/// Timeouts and headers applied to every client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Per-attempt timeout covering the whole request including the body.
    pub request_timeout: Duration,
    /// User-Agent header.
    pub user_agent: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            user_agent: BROWSER_USER_AGENT.to_string(),
        }
    }
}

/// Credential-aware HTTP client with one pooled connection set per identity.
#[derive(Debug)]
pub struct HttpClient {
    settings: ClientSettings,
    credentials: Arc<CredentialStore>,
    clients: DashMap<Option<Identity>, Client>,
}

impl HttpClient {
    /// Creates a client factory. Clients are built lazily per identity.
    #[must_use]
    pub fn new(settings: ClientSettings, credentials: Arc<CredentialStore>) -> Self {
        Self {
            settings,
            credentials,
            clients: DashMap::new(),
        }
    }

    /// The credential store whose bundle is attached to every request.
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    fn client_for(&self, identity: Option<&Identity>) -> Result<Client, TransferError> {
        let key = identity.cloned();
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .timeout(self.settings.request_timeout)
            .redirect(Policy::none())
            .gzip(true)
            .user_agent(self.settings.user_agent.clone());
        if let Some(identity) = identity {
            let proxy = Proxy::all(identity.as_str()).map_err(|source| {
                TransferError::InvalidIdentity {
                    identity: identity.redacted(),
                    source,
                }
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|source| TransferError::InvalidIdentity {
                identity: identity.map_or_else(|| "direct".to_string(), Identity::redacted),
                source,
            })?;
        debug!(
            identity = identity.map_or_else(|| "direct".to_string(), Identity::redacted),
            "built HTTP client"
        );
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    fn authorize(&self, mut request: RequestBuilder) -> RequestBuilder {
        let bundle = self.credentials.current();
        if let Some(cookie) = bundle.cookie_header() {
            request = request.header(COOKIE, cookie);
        }
        for (name, value) in &bundle.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<Response, TransferError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| TransferError::network(url, e))?;
        ensure_success(url, response)
    }

    /// Streams `url` into `dest`, returning the payload size.
    ///
    /// Nothing is visible under `dest` unless the whole body arrived.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] for non-2xx statuses, network failures,
    /// timeouts, and local write failures.
    #[instrument(skip(self, identity), fields(identity = identity.map(tracing::field::display)))]
    pub async fn get_to_file(
        &self,
        url: &str,
        dest: &Path,
        identity: Option<&Identity>,
    ) -> Result<u64, TransferError> {
        let target = parse_url(url)?;
        let client = self.client_for(identity)?;
        let response = self.send(url, client.get(target)).await?;

        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file_name = dest
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(dir)
            .map_err(|e| TransferError::io(dir, e))?;
        let (file, temp_path) = temp.into_parts();
        let file = tokio::fs::File::from_std(file);

        let bytes = stream_body(url, &temp_path, response, file).await?;

        temp_path
            .persist(dest)
            .map_err(|e| TransferError::io(dest, e.error))?;
        trace!(path = %dest.display(), bytes, "payload committed");
        Ok(bytes)
    }

    /// Uploads the file at `source` to `url` with `PUT`, returning its size.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the file cannot be read, for non-2xx
    /// statuses, network failures, and timeouts.
    #[instrument(skip(self, identity), fields(identity = identity.map(tracing::field::display)))]
    pub async fn put_file(
        &self,
        url: &str,
        source: &Path,
        identity: Option<&Identity>,
    ) -> Result<u64, TransferError> {
        let target = parse_url(url)?;
        let body = tokio::fs::read(source)
            .await
            .map_err(|e| TransferError::io(source, e))?;
        let size = body.len() as u64;
        let client = self.client_for(identity)?;
        let request = client
            .put(target)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.send(url, request).await?;
        Ok(size)
    }
}

fn parse_url(raw: &str) -> Result<Url, TransferError> {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(url),
        _ => Err(TransferError::invalid_url(raw)),
    }
}

fn ensure_success(url: &str, response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    Err(TransferError::http_status_with_retry_after(
        url,
        status.as_u16(),
        retry_after,
    ))
}

async fn stream_body(
    url: &str,
    path: &Path,
    response: Response,
    file: tokio::fs::File,
) -> Result<u64, TransferError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| TransferError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| TransferError::io(path, e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(bytes_written)
}
