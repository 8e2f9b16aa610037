//! Assembling the initial credential bundle of a run.
//!
//! Sources are merged in order, later ones winning: the cached credentials
//! file (or a fresh bundle from the external acquisition command), the
//! `BULKFETCH_COOKIES` environment variable, per-cookie environment
//! variables, then explicit CLI pairs. Seed cookies fill in names no source
//! supplied.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::credentials::{CredentialBundle, parse_cookie_pairs};

/// Environment variable holding `a=b; c=d` cookie pairs.
pub const COOKIES_ENV: &str = "BULKFETCH_COOKIES";

/// Errors assembling the credential bundle. All are fatal at startup.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The credentials file exists but could not be read.
    #[error("failed to read credentials file {path}: {source}")]
    Read {
        /// Path of the credentials file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The credentials file or provider output is not a bundle document.
    #[error("invalid credential bundle from {origin}: {source}")]
    Parse {
        /// Where the document came from.
        origin: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The acquisition command could not be started.
    #[error("failed to run credential command `{command}`: {source}")]
    Spawn {
        /// The configured command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The acquisition command exited unsuccessfully.
    #[error("credential command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        /// The configured command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Trimmed stderr of the command.
        stderr: String,
    },

    /// The fresh bundle could not be cached.
    #[error("failed to write credentials file {path}: {source}")]
    Write {
        /// Path of the credentials file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Mandatory cookies or headers are absent.
    #[error("missing required credentials: {}", names.join(", "))]
    Missing {
        /// Names that were not supplied.
        names: Vec<String>,
    },

    /// A `--cookie`/`--header` argument is not `name=value`.
    #[error("invalid credential pair '{0}': expected name=value")]
    InvalidPair(String),
}

/// Where credentials come from and what a usable bundle must contain.
///
/// `Debug` prints cookie and header names only.
#[derive(Clone, Default)]
pub struct CredentialSource {
    /// Cached bundle JSON (`{"cookies": {..}, "headers": {..}}`).
    pub file: Option<PathBuf>,
    /// External acquisition command, run through the shell.
    pub command: Option<String>,
    /// Run `command` even when a cached bundle exists.
    pub refresh: bool,
    /// Ignore every source and run without credentials.
    pub skip: bool,
    /// Cookies used only when no other source names them.
    pub seed_cookies: Vec<(String, String)>,
    /// Value of the cookie environment variable, if set.
    pub env_cookies: Option<String>,
    /// Cookies read from per-cookie environment variables.
    pub named_env_cookies: Vec<(String, String)>,
    /// Explicit cookie pairs.
    pub cookies: Vec<(String, String)>,
    /// Explicit header pairs.
    pub headers: Vec<(String, String)>,
    /// Cookie or header names that must be present.
    pub required: Vec<String>,
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |pairs: &[(String, String)]| {
            pairs.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>()
        };
        f.debug_struct("CredentialSource")
            .field("file", &self.file)
            .field("command", &self.command)
            .field("refresh", &self.refresh)
            .field("skip", &self.skip)
            .field("seed_cookies", &names(&self.seed_cookies))
            .field("env_cookies", &self.env_cookies.is_some())
            .field("named_env_cookies", &names(&self.named_env_cookies))
            .field("cookies", &names(&self.cookies))
            .field("headers", &names(&self.headers))
            .field("required", &self.required)
            .finish()
    }
}

impl CredentialSource {
    /// Resolves the bundle for this run.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when a source is unreadable, the provider
    /// command fails, or a required name is missing.
    #[instrument(skip(self), fields(skip = self.skip, refresh = self.refresh))]
    pub async fn resolve(&self) -> Result<CredentialBundle, CredentialError> {
        if self.skip {
            info!("running without credentials");
            return Ok(CredentialBundle::new());
        }

        let cached = match self.file.as_deref() {
            Some(path) => load_bundle_file(path)?,
            None => None,
        };

        let mut bundle = match (self.command.as_deref(), cached) {
            (Some(command), Some(_)) if self.refresh => self.acquire(command).await?,
            (Some(command), None) => self.acquire(command).await?,
            (_, Some(cached)) => cached,
            (None, None) => CredentialBundle::new(),
        };

        for (name, value) in &self.seed_cookies {
            bundle
                .cookies
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        if let Some(raw) = self.env_cookies.as_deref() {
            let cookies = parse_cookie_pairs(raw);
            debug!(count = cookies.len(), "cookies from environment");
            bundle.cookies.extend(cookies);
        }
        bundle.cookies.extend(self.named_env_cookies.iter().cloned());
        bundle.cookies.extend(self.cookies.iter().cloned());
        bundle.headers.extend(self.headers.iter().cloned());

        let missing = bundle.missing(&self.required);
        if !missing.is_empty() {
            return Err(CredentialError::Missing { names: missing });
        }
        if bundle.is_empty() {
            warn!("no credentials supplied; requests go out without session cookies");
        } else {
            info!(
                cookies = bundle.cookies.len(),
                headers = bundle.headers.len(),
                "credential bundle ready"
            );
        }
        Ok(bundle)
    }
}

impl CredentialSource {
    async fn acquire(&self, command: &str) -> Result<CredentialBundle, CredentialError> {
        let fresh = run_provider_command(command).await?;
        if let Some(path) = self.file.as_deref() {
            save_bundle_file(path, &fresh)?;
        }
        Ok(fresh)
    }
}

/// Splits a `name=value` argument.
///
/// # Errors
///
/// Returns [`CredentialError::InvalidPair`] when there is no `=` or the name
/// is empty.
pub fn parse_pair(raw: &str) -> Result<(String, String), CredentialError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(CredentialError::InvalidPair(raw.to_string())),
    }
}

/// Loads a bundle file. A missing file is `Ok(None)`.
///
/// # Errors
///
/// Returns [`CredentialError::Read`] or [`CredentialError::Parse`].
pub fn load_bundle_file(path: &Path) -> Result<Option<CredentialBundle>, CredentialError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CredentialError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let bundle = serde_json::from_str(&contents).map_err(|source| CredentialError::Parse {
        origin: path.display().to_string(),
        source,
    })?;
    debug!(path = %path.display(), "loaded cached credentials");
    Ok(Some(bundle))
}

/// Writes a bundle file atomically, owner-readable only on Unix.
///
/// # Errors
///
/// Returns [`CredentialError::Write`].
pub fn save_bundle_file(path: &Path, bundle: &CredentialBundle) -> Result<(), CredentialError> {
    let write_err = |source| CredentialError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let json = serde_json::to_vec_pretty(bundle).map_err(|e| write_err(e.into()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(&json).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }

    tmp.persist(path).map_err(|e| write_err(e.error))?;
    info!(path = %path.display(), "cached credential bundle");
    Ok(())
}

/// Runs the acquisition command and parses its stdout as a bundle.
async fn run_provider_command(command: &str) -> Result<CredentialBundle, CredentialError> {
    info!(command, "acquiring credentials");
    let output = shell(command)
        .output()
        .await
        .map_err(|source| CredentialError::Spawn {
            command: command.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(CredentialError::CommandFailed {
            command: command.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(|source| CredentialError::Parse {
        origin: format!("command `{command}`"),
        source,
    })
}

#[cfg(unix)]
fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
