//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use bulkfetch_core::auth::parse_pair;
use bulkfetch_core::config::{
    AuthOverrides, DownloadOverrides, EngineOverrides, UploadOverrides,
};
use clap::{Args, Parser, Subcommand};

/// Resilient bulk download of numbered document corpora and CDN re-upload.
///
/// Runs resume from the checkpoint and from what already exists at the
/// destination; interrupted runs can simply be started again.
#[derive(Parser, Debug)]
#[command(name = "bulkfetch")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ./bulkfetch.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a range of numbered files
    Download(DownloadArgs),

    /// Upload extracted images to the CDN storage zone
    Upload(UploadArgs),

    /// Write the ledger's local-path to CDN-URL mapping as JSON
    ExportMapping(ExportArgs),
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// First file number
    #[arg(short = 's', long)]
    pub start: Option<u64>,

    /// Last file number (inclusive)
    #[arg(short = 'e', long)]
    pub end: Option<u64>,

    /// Dataset folder below the base URL
    #[arg(short = 'd', long)]
    pub dataset: Option<String>,

    /// Remote root URL
    #[arg(long)]
    pub base_url: Option<String>,

    /// Destination directory
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub auth: AuthArgs,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Directory of `<folder>/<image>` files
    #[arg(long = "source", value_name = "DIR")]
    pub source_dir: Option<PathBuf>,

    /// Upload ledger database
    #[arg(long, value_name = "FILE")]
    pub ledger: Option<PathBuf>,

    /// Storage zone name
    #[arg(long, env = "BUNNY_STORAGE_ZONE")]
    pub storage_zone: Option<String>,

    /// Storage API host
    #[arg(long, env = "BUNNY_STORAGE_HOSTNAME")]
    pub storage_host: Option<String>,

    /// Public CDN host, e.g. zone.b-cdn.net
    #[arg(long, env = "BUNNY_CDN_HOSTNAME")]
    pub cdn_host: Option<String>,

    /// Storage access key
    #[arg(long, env = "BUNNY_API_KEY", hide_env_values = true)]
    pub access_key: Option<String>,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub auth: AuthArgs,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Upload ledger database
    #[arg(long, value_name = "FILE")]
    pub ledger: Option<PathBuf>,

    /// Output JSON file
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Engine knobs shared by download and upload.
#[derive(Args, Debug)]
pub struct EngineArgs {
    /// Maximum concurrent transfers (1-1000)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=1000))]
    pub concurrency: Option<u16>,

    /// Requests per second across all transfers
    #[arg(long)]
    pub rate: Option<f64>,

    /// Items per batch (checkpoint and identity rotation boundary)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: Option<u32>,

    /// Attempts per item before giving up (1-100)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_attempts: Option<u32>,

    /// Proxy list, one endpoint per line
    #[arg(long, value_name = "FILE")]
    pub proxies: Option<PathBuf>,

    /// Proxies per rotation chunk
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub chunk_size: Option<u32>,

    /// Checkpoint file
    #[arg(long, value_name = "FILE")]
    pub checkpoint: Option<PathBuf>,

    /// Report of failed items written at the end of the run
    #[arg(long, value_name = "FILE")]
    pub failed_report: Option<PathBuf>,

    /// Fetch items previously reported absent again
    #[arg(long)]
    pub recheck_not_found: bool,
}

/// Credential sources.
#[derive(Args, Debug)]
pub struct AuthArgs {
    /// Credential bundle JSON ({"cookies": {..}, "headers": {..}})
    #[arg(long, value_name = "FILE")]
    pub credentials: Option<PathBuf>,

    /// Extra cookie, repeatable
    #[arg(long = "cookie", value_name = "NAME=VALUE", value_parser = parse_pair)]
    pub cookies: Vec<(String, String)>,

    /// Extra request header, repeatable
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_pair)]
    pub headers: Vec<(String, String)>,

    /// Run without credentials
    #[arg(long, conflicts_with = "refresh_credentials")]
    pub skip_credentials: bool,

    /// Run the acquisition command even when cached credentials exist
    #[arg(long)]
    pub refresh_credentials: bool,
}

impl EngineArgs {
    pub fn overrides(&self) -> EngineOverrides {
        EngineOverrides {
            concurrency: self.concurrency.map(usize::from),
            rate: self.rate,
            batch_size: self.batch_size.map(|n| n as usize),
            max_attempts: self.max_attempts,
            proxies: self.proxies.clone(),
            chunk_size: self.chunk_size.map(|n| n as usize),
            checkpoint: self.checkpoint.clone(),
            failed_report: self.failed_report.clone(),
            recheck_not_found: self.recheck_not_found,
        }
    }
}

impl AuthArgs {
    pub fn overrides(&self) -> AuthOverrides {
        AuthOverrides {
            credentials_file: self.credentials.clone(),
            cookies: self.cookies.clone(),
            headers: self.headers.clone(),
            skip: self.skip_credentials,
            refresh: self.refresh_credentials,
        }
    }
}

impl DownloadArgs {
    pub fn overrides(&self) -> DownloadOverrides {
        DownloadOverrides {
            start: self.start,
            end: self.end,
            dataset: self.dataset.clone(),
            base_url: self.base_url.clone(),
            output_dir: self.output_dir.clone(),
        }
    }
}

impl UploadArgs {
    pub fn overrides(&self) -> UploadOverrides {
        UploadOverrides {
            source_dir: self.source_dir.clone(),
            ledger: self.ledger.clone(),
            storage_zone: self.storage_zone.clone(),
            storage_host: self.storage_host.clone(),
            cdn_host: self.cdn_host.clone(),
            access_key: self.access_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download(args: &[&str]) -> DownloadArgs {
        let mut argv = vec!["bulkfetch", "download"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Download(args) => args,
            other => panic!("expected download, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_download_defaults_leave_everything_to_config() {
        let args = download(&[]);
        assert!(args.start.is_none());
        assert!(args.end.is_none());
        assert!(args.engine.concurrency.is_none());
        assert!(!args.engine.recheck_not_found);
        assert!(!args.auth.skip_credentials);
    }

    #[test]
    fn test_cli_download_range_and_engine_flags() {
        let args = download(&[
            "-s", "100", "-e", "200", "-d", "files/DataSet%202/", "-o", "out", "-c", "50",
            "--rate", "7.5", "--batch-size", "10", "--chunk-size", "3", "--recheck-not-found",
        ]);
        let engine = args.engine.overrides();
        let download = args.overrides();
        assert_eq!(download.start, Some(100));
        assert_eq!(download.end, Some(200));
        assert_eq!(download.dataset.as_deref(), Some("files/DataSet%202/"));
        assert_eq!(download.output_dir, Some(PathBuf::from("out")));
        assert_eq!(engine.concurrency, Some(50));
        assert_eq!(engine.rate, Some(7.5));
        assert_eq!(engine.batch_size, Some(10));
        assert_eq!(engine.chunk_size, Some(3));
        assert!(engine.recheck_not_found);
    }

    #[test]
    fn test_cli_concurrency_out_of_range_rejected() {
        for value in ["0", "1001"] {
            let err = Cli::try_parse_from(["bulkfetch", "download", "-c", value]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn test_cli_repeated_cookies_and_headers() {
        let args = download(&["--cookie", "a=1", "--cookie", "b=2", "--header", "X-Test=yes"]);
        let auth = args.auth.overrides();
        assert_eq!(
            auth.cookies,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
        assert_eq!(auth.headers, vec![("X-Test".to_string(), "yes".to_string())]);
    }

    #[test]
    fn test_cli_malformed_cookie_rejected() {
        let err =
            Cli::try_parse_from(["bulkfetch", "download", "--cookie", "novalue"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_skip_and_refresh_conflict() {
        let err = Cli::try_parse_from([
            "bulkfetch",
            "download",
            "--skip-credentials",
            "--refresh-credentials",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["bulkfetch", "export-mapping", "-vv", "--config", "x.toml"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Command::ExportMapping(_)));
    }

    #[test]
    fn test_cli_upload_flags() {
        let cli = Cli::try_parse_from([
            "bulkfetch",
            "upload",
            "--source",
            "imgs",
            "--storage-zone",
            "zone",
            "--cdn-host",
            "zone.b-cdn.net",
            "--access-key",
            "k",
        ])
        .unwrap();
        let Command::Upload(args) = cli.command else {
            panic!("expected upload");
        };
        let upload = args.overrides();
        assert_eq!(upload.source_dir, Some(PathBuf::from("imgs")));
        assert_eq!(upload.storage_zone.as_deref(), Some("zone"));
        assert_eq!(upload.access_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_cli_missing_subcommand_is_error() {
        assert!(Cli::try_parse_from(["bulkfetch"]).is_err());
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Cli::try_parse_from(["bulkfetch", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
