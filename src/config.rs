//! Run configuration.
//!
//! Values are layered: built-in defaults, then the optional TOML file, then
//! command-line overrides. Every layer is optional per field; validation
//! happens once on the merged result and yields [`ConfigError`], which the
//! binary treats as fatal.
//!
//! ```toml
//! [engine]
//! concurrency = 20
//! rate = 20.0
//! proxies = "proxies.txt"
//!
//! [download]
//! start = 1
//! end = 2731783
//! dataset = "files/DataSet%201/"
//!
//! [upload]
//! storage_zone = "archive"
//! cdn_host = "archive.b-cdn.net"
//!
//! [auth]
//! credentials_file = "credentials.json"
//! required_cookies = ["session"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::{COOKIES_ENV, CredentialSource};
use crate::identity::DEFAULT_CHUNK_SIZE;
use crate::orchestrator::{
    DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY, MAX_CONCURRENCY, MIN_CONCURRENCY,
    OrchestratorSettings,
};
use crate::transfer::constants::{BROWSER_USER_AGENT, CONNECT_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS};
use crate::transfer::{
    ACCESS_KEY_HEADER, CdnLayout, ClientSettings, DEFAULT_KEY_PREFIX, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_RATE_LIMIT_PAUSES, DEFAULT_STORAGE_HOST, RetryPolicy,
};
use crate::work::{
    DEFAULT_BASE_URL, DEFAULT_DATASET, DEFAULT_EXTENSION, DEFAULT_PREFIX, DEFAULT_WIDTH,
    DatasetLayout,
};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "bulkfetch.toml";
/// Default request rate (requests per second).
pub const DEFAULT_RATE: f64 = 20.0;
/// First ordinal of the default range.
pub const DEFAULT_START: u64 = 1;
/// Last ordinal of the default range.
pub const DEFAULT_END: u64 = 2_731_783;

const DEFAULT_OUTPUT_DIR: &str = "downloads";
const DEFAULT_CHECKPOINT: &str = "checkpoint.json";
const DEFAULT_FAILED_REPORT: &str = "failed_downloads.txt";

const DEFAULT_UPLOAD_SOURCE: &str = "extracted_images";
const DEFAULT_LEDGER: &str = "data/upload_tracking.db";
const DEFAULT_UPLOAD_CHECKPOINT: &str = "data/upload_checkpoint.json";
const DEFAULT_UPLOAD_FAILED_REPORT: &str = "failed_uploads.txt";
const DEFAULT_MAPPING: &str = "data/cdn_mapping.json";
const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_UPLOAD_BACKOFF_SECS: f64 = 2.0;

/// Session cookies the document host requires before it serves files.
pub const DOWNLOAD_REQUIRED_COOKIES: [&str; 2] =
    ["ak_bmsc", "QueueITAccepted-SDFrts345E-V3_usdojfiles"];
/// Age-gate cookie sent unless another source sets it.
pub const AGE_VERIFIED_COOKIE: (&str, &str) = ("justiceGovAgeVerified", "true");
/// Environment variables holding single download cookies.
pub const DOWNLOAD_COOKIE_ENV: [(&str, &str); 3] = [
    ("DOJ_COOKIE_AK_BMSC", "ak_bmsc"),
    ("DOJ_COOKIE_AGE_VERIFIED", "justiceGovAgeVerified"),
    ("DOJ_COOKIE_QUEUE_IT", "QueueITAccepted-SDFrts345E-V3_usdojfiles"),
];

const DEFAULT_BACKOFF_SECS: f64 = 1.0;
const DEFAULT_MAX_BACKOFF_SECS: f64 = 60.0;
const DEFAULT_BACKOFF_JITTER_SECS: f64 = 2.0;
const DEFAULT_RATE_LIMIT_PAUSE_SECS: f64 = 30.0;
const DEFAULT_RATE_LIMIT_JITTER_SECS: f64 = 5.0;

/// Configuration problems. Fatal: the run does not start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file unreadable.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// The file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has unknown keys.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// The file.
        path: PathBuf,
        /// The underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("invalid value for `{field}`: {value}. Expected {expected}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Human-readable constraint.
        expected: &'static str,
    },

    /// A mandatory value was not provided anywhere.
    #[error("missing `{field}`: {hint}")]
    Missing {
        /// Setting name.
        field: &'static str,
        /// Where it can be provided.
        hint: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Parsed `bulkfetch.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Shared engine settings.
    pub engine: EngineSection,
    /// Download mode.
    pub download: DownloadSection,
    /// Upload mode.
    pub upload: UploadSection,
    /// Credential sources.
    pub auth: AuthSection,
}

/// `[engine]`: knobs shared by both modes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct EngineSection {
    pub concurrency: Option<usize>,
    pub rate: Option<f64>,
    pub batch_size: Option<usize>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_secs: Option<f64>,
    pub max_backoff_secs: Option<f64>,
    pub backoff_jitter_secs: Option<f64>,
    pub rate_limit_pause_secs: Option<f64>,
    pub rate_limit_jitter_secs: Option<f64>,
    pub max_rate_limit_pauses: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub proxies: Option<PathBuf>,
    pub chunk_size: Option<usize>,
    pub recheck_not_found: Option<bool>,
}

/// `[download]`: the range to fetch and where files land.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct DownloadSection {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub base_url: Option<String>,
    pub dataset: Option<String>,
    pub prefix: Option<String>,
    pub width: Option<usize>,
    pub extension: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub failed_report: Option<PathBuf>,
}

/// `[upload]`: CDN target and upload-specific engine overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct UploadSection {
    pub source_dir: Option<PathBuf>,
    pub ledger: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub failed_report: Option<PathBuf>,
    pub mapping: Option<PathBuf>,
    pub storage_zone: Option<String>,
    pub storage_host: Option<String>,
    pub cdn_host: Option<String>,
    pub key_prefix: Option<String>,
    pub access_key: Option<String>,
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_secs: Option<f64>,
    pub request_timeout_secs: Option<u64>,
}

/// `[auth]`: where the credential bundle comes from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    /// Cached bundle JSON.
    pub credentials_file: Option<PathBuf>,
    /// External acquisition command.
    pub command: Option<String>,
    /// Cookie names that must be present. Download mode defaults to the
    /// document host's session cookies; `[]` disables the check.
    pub required_cookies: Option<Vec<String>>,
    /// Header names that must be present.
    pub required_headers: Vec<String>,
}

impl FileConfig {
    /// Parses a config document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or unknown keys.
    pub fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and parses `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&raw, path)?;
        info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Loads `explicit` when given, else [`DEFAULT_CONFIG_FILE`] when it
    /// exists in the working directory, else the empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the chosen file is unreadable or invalid.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default = Path::new(DEFAULT_CONFIG_FILE);
        if default.is_file() {
            Self::load(default)
        } else {
            debug!("no config file, using defaults");
            Ok(Self::default())
        }
    }
}

/// Engine knobs given on the command line.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct EngineOverrides {
    pub concurrency: Option<usize>,
    pub rate: Option<f64>,
    pub batch_size: Option<usize>,
    pub max_attempts: Option<u32>,
    pub proxies: Option<PathBuf>,
    pub chunk_size: Option<usize>,
    pub checkpoint: Option<PathBuf>,
    pub failed_report: Option<PathBuf>,
    pub recheck_not_found: bool,
}

/// Credential flags given on the command line.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct AuthOverrides {
    pub credentials_file: Option<PathBuf>,
    pub cookies: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub skip: bool,
    pub refresh: bool,
}

/// Download flags given on the command line.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct DownloadOverrides {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub dataset: Option<String>,
    pub base_url: Option<String>,
    pub output_dir: Option<PathBuf>,
}

/// Upload flags given on the command line.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct UploadOverrides {
    pub source_dir: Option<PathBuf>,
    pub ledger: Option<PathBuf>,
    pub storage_zone: Option<String>,
    pub storage_host: Option<String>,
    pub cdn_host: Option<String>,
    pub access_key: Option<String>,
}

/// Resolved engine settings shared by both modes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Requests per second across the run.
    pub rate: f64,
    /// Backoff and pause timing.
    pub retry: RetryPolicy,
    /// HTTP timeouts and User-Agent.
    pub client: ClientSettings,
    /// Identity file, if any.
    pub proxies: Option<PathBuf>,
    /// Identities per chunk.
    pub chunk_size: usize,
    /// Forget earlier not-found verdicts.
    pub recheck_not_found: bool,
    /// Batching and persistence.
    pub orchestrator: OrchestratorSettings,
}

/// Fully resolved download run.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// First ordinal, inclusive.
    pub start: u64,
    /// Last ordinal, inclusive.
    pub end: u64,
    /// Naming of remote and local files.
    pub layout: DatasetLayout,
    /// Destination directory.
    pub output_dir: PathBuf,
    /// Engine settings.
    pub engine: EngineConfig,
    /// Where the credential bundle comes from.
    pub credentials: CredentialSource,
}

/// Fully resolved upload run.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root holding `<folder>/<image>` files.
    pub source_dir: PathBuf,
    /// SQLite upload ledger.
    pub ledger: PathBuf,
    /// Storage and public URL layout.
    pub layout: CdnLayout,
    /// Engine settings.
    pub engine: EngineConfig,
    /// Credential sources; the access key is a required header.
    pub credentials: CredentialSource,
}

/// Fully resolved mapping export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
    /// SQLite upload ledger.
    pub ledger: PathBuf,
    /// Output JSON file.
    pub output: PathBuf,
}

/// Mode-specific engine defaults.
struct EngineDefaults {
    concurrency: Option<usize>,
    max_attempts: u32,
    initial_backoff_secs: f64,
    request_timeout_secs: Option<u64>,
    checkpoint: PathBuf,
    failed_report: PathBuf,
}

impl FileConfig {
    /// Merges the download section with `cli` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for out-of-range values.
    pub fn resolve_download(
        &self,
        engine: &EngineOverrides,
        download: &DownloadOverrides,
        auth: &AuthOverrides,
    ) -> Result<DownloadConfig, ConfigError> {
        let section = &self.download;
        let start = download.start.or(section.start).unwrap_or(DEFAULT_START);
        let end = download.end.or(section.end).unwrap_or(DEFAULT_END);
        if start == 0 || start > end {
            return Err(ConfigError::invalid(
                "start/end",
                format!("{start}..={end}"),
                "1 <= start <= end",
            ));
        }

        let base_url = download
            .base_url
            .clone()
            .or_else(|| section.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if let Err(e) = url::Url::parse(&base_url) {
            return Err(ConfigError::invalid(
                "base_url",
                format!("{base_url} ({e})"),
                "an absolute http(s) URL",
            ));
        }
        let width = section.width.unwrap_or(DEFAULT_WIDTH);
        if !(1..=20).contains(&width) {
            return Err(ConfigError::invalid("width", width, "range 1..=20"));
        }
        let layout = DatasetLayout {
            base_url,
            dataset: download
                .dataset
                .clone()
                .or_else(|| section.dataset.clone())
                .unwrap_or_else(|| DEFAULT_DATASET.to_string()),
            prefix: section
                .prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            width,
            extension: section
                .extension
                .clone()
                .unwrap_or_else(|| DEFAULT_EXTENSION.to_string()),
        };

        let defaults = EngineDefaults {
            concurrency: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_secs: DEFAULT_BACKOFF_SECS,
            request_timeout_secs: None,
            checkpoint: section
                .checkpoint
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT)),
            failed_report: section
                .failed_report
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FAILED_REPORT)),
        };

        Ok(DownloadConfig {
            start,
            end,
            layout,
            output_dir: download
                .output_dir
                .clone()
                .or_else(|| section.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            engine: self.resolve_engine(engine, &defaults)?,
            credentials: self.download_credentials(auth),
        })
    }

    /// Merges the upload section with `cli` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the storage zone, CDN host or
    /// access key is not configured, and [`ConfigError::Invalid`] for
    /// out-of-range values.
    pub fn resolve_upload(
        &self,
        engine: &EngineOverrides,
        upload: &UploadOverrides,
        auth: &AuthOverrides,
    ) -> Result<UploadConfig, ConfigError> {
        let section = &self.upload;
        let zone = upload
            .storage_zone
            .clone()
            .or_else(|| section.storage_zone.clone())
            .filter(|zone| !zone.is_empty())
            .ok_or(ConfigError::Missing {
                field: "storage_zone",
                hint: "set [upload].storage_zone, --storage-zone or BUNNY_STORAGE_ZONE",
            })?;
        let cdn_host = upload
            .cdn_host
            .clone()
            .or_else(|| section.cdn_host.clone())
            .filter(|host| !host.is_empty())
            .ok_or(ConfigError::Missing {
                field: "cdn_host",
                hint: "set [upload].cdn_host, --cdn-host or BUNNY_CDN_HOSTNAME",
            })?;
        let access_key = upload
            .access_key
            .clone()
            .or_else(|| section.access_key.clone())
            .filter(|key| !key.is_empty());

        let mut layout = CdnLayout::new(zone, cdn_host);
        layout.storage_host = upload
            .storage_host
            .clone()
            .or_else(|| section.storage_host.clone())
            .unwrap_or_else(|| DEFAULT_STORAGE_HOST.to_string());
        layout.key_prefix = section
            .key_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

        let defaults = EngineDefaults {
            concurrency: section.concurrency,
            max_attempts: section.max_attempts.unwrap_or(DEFAULT_UPLOAD_MAX_ATTEMPTS),
            initial_backoff_secs: section
                .initial_backoff_secs
                .unwrap_or(DEFAULT_UPLOAD_BACKOFF_SECS),
            request_timeout_secs: section.request_timeout_secs,
            checkpoint: section
                .checkpoint
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_CHECKPOINT)),
            failed_report: section
                .failed_report
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_FAILED_REPORT)),
        };

        let mut required = self.auth.required_cookies.clone().unwrap_or_default();
        required.push(ACCESS_KEY_HEADER.to_string());
        let mut credentials = self.credential_source(auth, required);
        if let Some(key) = access_key {
            credentials
                .headers
                .push((ACCESS_KEY_HEADER.to_string(), key));
        } else if !auth.skip {
            return Err(ConfigError::Missing {
                field: "access_key",
                hint: "set [upload].access_key, --access-key or BUNNY_API_KEY",
            });
        }

        Ok(UploadConfig {
            source_dir: upload
                .source_dir
                .clone()
                .or_else(|| section.source_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_SOURCE)),
            ledger: self.ledger_path(upload.ledger.clone()),
            layout,
            engine: self.resolve_engine(engine, &defaults)?,
            credentials,
        })
    }

    /// Ledger and output paths of `export-mapping`.
    #[must_use]
    pub fn resolve_export(&self, ledger: Option<PathBuf>, output: Option<PathBuf>) -> ExportConfig {
        ExportConfig {
            ledger: self.ledger_path(ledger),
            output: output
                .or_else(|| self.upload.mapping.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MAPPING)),
        }
    }

    fn ledger_path(&self, cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| self.upload.ledger.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER))
    }

    fn download_credentials(&self, auth: &AuthOverrides) -> CredentialSource {
        let required = self.auth.required_cookies.clone().unwrap_or_else(|| {
            DOWNLOAD_REQUIRED_COOKIES
                .iter()
                .map(ToString::to_string)
                .collect()
        });
        let mut source = self.credential_source(auth, required);
        source.seed_cookies = vec![(
            AGE_VERIFIED_COOKIE.0.to_string(),
            AGE_VERIFIED_COOKIE.1.to_string(),
        )];
        source.named_env_cookies = DOWNLOAD_COOKIE_ENV
            .iter()
            .filter_map(|(var, cookie)| {
                std::env::var(var)
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| ((*cookie).to_string(), v.trim().to_string()))
            })
            .collect();
        source
    }

    fn credential_source(
        &self,
        auth: &AuthOverrides,
        mut required: Vec<String>,
    ) -> CredentialSource {
        required.extend(self.auth.required_headers.iter().cloned());
        CredentialSource {
            file: auth
                .credentials_file
                .clone()
                .or_else(|| self.auth.credentials_file.clone()),
            command: self.auth.command.clone(),
            refresh: auth.refresh,
            skip: auth.skip,
            seed_cookies: Vec::new(),
            env_cookies: std::env::var(COOKIES_ENV).ok().filter(|v| !v.trim().is_empty()),
            named_env_cookies: Vec::new(),
            cookies: auth.cookies.clone(),
            headers: auth.headers.clone(),
            required,
        }
    }

    fn resolve_engine(
        &self,
        cli: &EngineOverrides,
        defaults: &EngineDefaults,
    ) -> Result<EngineConfig, ConfigError> {
        let section = &self.engine;

        let concurrency = cli
            .concurrency
            .or(defaults.concurrency)
            .or(section.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(ConfigError::invalid("concurrency", concurrency, "range 1..=1000"));
        }

        let rate = cli.rate.or(section.rate).unwrap_or(DEFAULT_RATE);
        if !(rate.is_finite() && rate > 0.0) {
            return Err(ConfigError::invalid(
                "rate",
                rate,
                "a positive number of requests per second",
            ));
        }

        let batch_size = cli
            .batch_size
            .or(section.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", batch_size, "at least 1"));
        }

        let chunk_size = cli
            .chunk_size
            .or(section.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size", chunk_size, "at least 1"));
        }

        let max_attempts = cli
            .max_attempts
            .or(section.max_attempts)
            .unwrap_or(defaults.max_attempts);
        if !(1..=100).contains(&max_attempts) {
            return Err(ConfigError::invalid("max_attempts", max_attempts, "range 1..=100"));
        }

        let base = seconds(
            "initial_backoff_secs",
            section.initial_backoff_secs.unwrap_or(defaults.initial_backoff_secs),
        )?;
        let max_backoff = seconds(
            "max_backoff_secs",
            section.max_backoff_secs.unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
        )?;
        let jitter = seconds(
            "backoff_jitter_secs",
            section.backoff_jitter_secs.unwrap_or(DEFAULT_BACKOFF_JITTER_SECS),
        )?;
        let pause = seconds(
            "rate_limit_pause_secs",
            section.rate_limit_pause_secs.unwrap_or(DEFAULT_RATE_LIMIT_PAUSE_SECS),
        )?;
        let pause_jitter = seconds(
            "rate_limit_jitter_secs",
            section.rate_limit_jitter_secs.unwrap_or(DEFAULT_RATE_LIMIT_JITTER_SECS),
        )?;
        let retry = RetryPolicy::new(max_attempts, base, max_backoff.max(base), 2.0)
            .jitter(jitter)
            .rate_limit_pause(
                pause,
                pause_jitter,
                section
                    .max_rate_limit_pauses
                    .unwrap_or(DEFAULT_MAX_RATE_LIMIT_PAUSES),
            );

        let request_timeout = timeout(
            "request_timeout_secs",
            defaults
                .request_timeout_secs
                .or(section.request_timeout_secs)
                .unwrap_or(REQUEST_TIMEOUT_SECS),
        )?;
        let connect_timeout = timeout(
            "connect_timeout_secs",
            section.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
        )?;
        let client = ClientSettings {
            connect_timeout,
            request_timeout,
            user_agent: section
                .user_agent
                .clone()
                .unwrap_or_else(|| BROWSER_USER_AGENT.to_string()),
        };

        let mut orchestrator = OrchestratorSettings::new(
            cli.checkpoint.clone().unwrap_or_else(|| defaults.checkpoint.clone()),
            cli.failed_report
                .clone()
                .unwrap_or_else(|| defaults.failed_report.clone()),
        );
        orchestrator.concurrency = concurrency;
        orchestrator.batch_size = batch_size;

        Ok(EngineConfig {
            rate,
            retry,
            client,
            proxies: cli.proxies.clone().or_else(|| section.proxies.clone()),
            chunk_size,
            recheck_not_found: cli.recheck_not_found || section.recheck_not_found.unwrap_or(false),
            orchestrator,
        })
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::invalid(field, value, "a non-negative number of seconds"))
}

fn timeout(field: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if !(1..=3600).contains(&secs) {
        return Err(ConfigError::invalid(field, secs, "range 1..=3600"));
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> FileConfig {
        FileConfig::parse(raw, Path::new("test.toml")).unwrap()
    }

    #[test]
    fn test_defaults_match_original_run() {
        let config = FileConfig::default()
            .resolve_download(
                &EngineOverrides::default(),
                &DownloadOverrides::default(),
                &AuthOverrides::default(),
            )
            .unwrap();

        assert_eq!((config.start, config.end), (1, 2_731_783));
        assert_eq!(
            config.layout.url(1),
            "https://www.justice.gov/epstein/files/DataSet%201/EFTA00000001.pdf"
        );
        assert_eq!(config.output_dir, PathBuf::from("downloads"));
        assert_eq!(config.engine.orchestrator.concurrency, 20);
        assert_eq!(config.engine.orchestrator.batch_size, 5000);
        assert_eq!(
            config.engine.orchestrator.checkpoint_path,
            PathBuf::from("checkpoint.json")
        );
        assert!((config.engine.rate - 20.0).abs() < f64::EPSILON);
        assert_eq!(config.engine.retry.max_attempts(), 5);
        assert_eq!(config.engine.chunk_size, 10);
        assert_eq!(config.engine.client.request_timeout, Duration::from_secs(60));
        assert!(!config.engine.recheck_not_found);
    }

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        let file = parse(
            r#"
            [engine]
            concurrency = 8
            rate = 5.0
            recheck_not_found = true

            [download]
            start = 10
            end = 20
            output_dir = "pdfs"
            "#,
        );
        let engine = EngineOverrides {
            concurrency: Some(3),
            ..EngineOverrides::default()
        };
        let download = DownloadOverrides {
            end: Some(15),
            ..DownloadOverrides::default()
        };
        let config = file
            .resolve_download(&engine, &download, &AuthOverrides::default())
            .unwrap();

        assert_eq!(config.engine.orchestrator.concurrency, 3);
        assert!((config.engine.rate - 5.0).abs() < f64::EPSILON);
        assert_eq!((config.start, config.end), (10, 15));
        assert_eq!(config.output_dir, PathBuf::from("pdfs"));
        assert!(config.engine.recheck_not_found);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let result = FileConfig::parse("[engine]\nconcurency = 3\n", Path::new("x.toml"));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_invalid_ranges_are_rejected() {
        let file = FileConfig::default();
        let auth = AuthOverrides::default();

        let reversed = DownloadOverrides {
            start: Some(9),
            end: Some(3),
            ..DownloadOverrides::default()
        };
        assert!(matches!(
            file.resolve_download(&EngineOverrides::default(), &reversed, &auth),
            Err(ConfigError::Invalid { field: "start/end", .. })
        ));

        for engine in [
            EngineOverrides {
                concurrency: Some(0),
                ..EngineOverrides::default()
            },
            EngineOverrides {
                concurrency: Some(1001),
                ..EngineOverrides::default()
            },
            EngineOverrides {
                rate: Some(0.0),
                ..EngineOverrides::default()
            },
            EngineOverrides {
                batch_size: Some(0),
                ..EngineOverrides::default()
            },
            EngineOverrides {
                chunk_size: Some(0),
                ..EngineOverrides::default()
            },
        ] {
            assert!(
                file.resolve_download(&engine, &DownloadOverrides::default(), &auth).is_err(),
                "{engine:?} should be rejected"
            );
        }

        let bad_url = DownloadOverrides {
            base_url: Some("not a url".to_string()),
            ..DownloadOverrides::default()
        };
        assert!(matches!(
            file.resolve_download(&EngineOverrides::default(), &bad_url, &auth),
            Err(ConfigError::Invalid { field: "base_url", .. })
        ));
    }

    #[test]
    fn test_negative_backoff_is_rejected() {
        let file = parse("[engine]\ninitial_backoff_secs = -1.0\n");
        let result = file.resolve_download(
            &EngineOverrides::default(),
            &DownloadOverrides::default(),
            &AuthOverrides::default(),
        );
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "initial_backoff_secs", .. })
        ));
    }

    #[test]
    fn test_upload_requires_zone_host_and_key() {
        let file = FileConfig::default();
        let engine = EngineOverrides::default();
        let auth = AuthOverrides::default();

        let result = file.resolve_upload(&engine, &UploadOverrides::default(), &auth);
        assert!(matches!(
            result,
            Err(ConfigError::Missing {
                field: "storage_zone",
                ..
            })
        ));

        let partial = UploadOverrides {
            storage_zone: Some("zone".to_string()),
            cdn_host: Some("zone.b-cdn.net".to_string()),
            ..UploadOverrides::default()
        };
        let result = file.resolve_upload(&engine, &partial, &auth);
        assert!(matches!(
            result,
            Err(ConfigError::Missing {
                field: "access_key",
                ..
            })
        ));
    }

    #[test]
    fn test_upload_defaults_and_access_key_header() {
        let file = parse(
            r#"
            [upload]
            storage_zone = "archive"
            cdn_host = "archive.b-cdn.net"
            access_key = "secret"
            "#,
        );
        let config = file
            .resolve_upload(
                &EngineOverrides::default(),
                &UploadOverrides::default(),
                &AuthOverrides::default(),
            )
            .unwrap();

        assert_eq!(config.source_dir, PathBuf::from("extracted_images"));
        assert_eq!(config.ledger, PathBuf::from("data/upload_tracking.db"));
        assert_eq!(config.engine.retry.max_attempts(), 3);
        assert_eq!(config.engine.retry.backoff_base(1), Duration::from_secs(2));
        assert_eq!(
            config.layout.storage_url("a/b.png"),
            "https://storage.bunnycdn.com/archive/images/a/b.png"
        );
        assert!(
            config
                .credentials
                .headers
                .contains(&("AccessKey".to_string(), "secret".to_string()))
        );
        assert_eq!(config.credentials.required, vec!["AccessKey".to_string()]);
        assert!(config.credentials.seed_cookies.is_empty());
    }

    #[test]
    fn test_export_paths() {
        let file = parse("[upload]\nledger = \"l.db\"\n");
        let export = file.resolve_export(None, Some(PathBuf::from("out.json")));
        assert_eq!(export.ledger, PathBuf::from("l.db"));
        assert_eq!(export.output, PathBuf::from("out.json"));
        assert_eq!(
            FileConfig::default().resolve_export(None, None).output,
            PathBuf::from("data/cdn_mapping.json")
        );
    }

    #[test]
    fn test_auth_section_feeds_credential_source() {
        let file = parse(
            r#"
            [auth]
            credentials_file = "creds.json"
            command = "acquire-session"
            required_cookies = ["session"]
            "#,
        );
        let auth = AuthOverrides {
            cookies: vec![("a".to_string(), "b".to_string())],
            refresh: true,
            ..AuthOverrides::default()
        };
        let config = file
            .resolve_download(
                &EngineOverrides::default(),
                &DownloadOverrides::default(),
                &auth,
            )
            .unwrap();
        let source = config.credentials;
        assert_eq!(source.file, Some(PathBuf::from("creds.json")));
        assert_eq!(source.command.as_deref(), Some("acquire-session"));
        assert_eq!(source.required, vec!["session".to_string()]);
        assert!(source.refresh);
        assert_eq!(source.cookies.len(), 1);
    }

    #[test]
    fn test_download_requires_session_cookies_by_default() {
        let config = FileConfig::default()
            .resolve_download(
                &EngineOverrides::default(),
                &DownloadOverrides::default(),
                &AuthOverrides::default(),
            )
            .unwrap();
        let source = config.credentials;
        assert_eq!(
            source.required,
            vec![
                "ak_bmsc".to_string(),
                "QueueITAccepted-SDFrts345E-V3_usdojfiles".to_string()
            ]
        );
        assert_eq!(
            source.seed_cookies,
            vec![("justiceGovAgeVerified".to_string(), "true".to_string())]
        );
    }

    #[test]
    fn test_empty_required_cookies_disables_check() {
        let file = parse("[auth]\nrequired_cookies = []\n");
        let config = file
            .resolve_download(
                &EngineOverrides::default(),
                &DownloadOverrides::default(),
                &AuthOverrides::default(),
            )
            .unwrap();
        assert!(config.credentials.required.is_empty());
    }
}
