//! CLI entry point for bulkfetch.

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use bulkfetch_core::orchestrator::ProgressReporter;
use bulkfetch_core::stats::{StatsSnapshot, format_duration};
use bulkfetch_core::{
    FileConfig, RunSummary, ShutdownCoordinator, TransferOutcome, export_mapping, run_download,
    run_upload,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(verbose = cli.verbose, quiet = cli.quiet, config = ?cli.config, "CLI arguments parsed");

    let file_config = FileConfig::discover(cli.config.as_deref())?;
    let shutdown = ShutdownCoordinator::shared();
    let use_progress = !cli.quiet && std::io::stderr().is_terminal();

    match &cli.command {
        Command::Download(args) => {
            let config = file_config.resolve_download(
                &args.engine.overrides(),
                &args.overrides(),
                &args.auth.overrides(),
            )?;
            info!(
                start = config.start,
                end = config.end,
                dataset = %config.layout.dataset,
                output = %config.output_dir.display(),
                "bulkfetch download starting"
            );
            let _listener = shutdown.listen_for_ctrl_c();
            let reporter = progress_reporter(use_progress);
            let summary = run_download(&config, Arc::clone(&shutdown), as_dyn(reporter.as_ref()))
                .await
                .context("download run failed")?;
            finish(reporter.as_deref(), &summary);
        }
        Command::Upload(args) => {
            let config = file_config.resolve_upload(
                &args.engine.overrides(),
                &args.overrides(),
                &args.auth.overrides(),
            )?;
            info!(
                source = %config.source_dir.display(),
                zone = %config.layout.zone,
                "bulkfetch upload starting"
            );
            let _listener = shutdown.listen_for_ctrl_c();
            let reporter = progress_reporter(use_progress);
            let summary = run_upload(&config, Arc::clone(&shutdown), as_dyn(reporter.as_ref()))
                .await
                .context("upload run failed")?;
            finish(reporter.as_deref(), &summary);
        }
        Command::ExportMapping(args) => {
            let config = file_config.resolve_export(args.ledger.clone(), args.output.clone());
            let count = export_mapping(&config)
                .await
                .context("mapping export failed")?;
            info!(count, output = %config.output.display(), "exported CDN mapping");
        }
    }

    Ok(())
}

/// Final summary lines. Item failures are reported, never turned into a
/// non-zero exit code.
fn finish(reporter: Option<&BarReporter>, summary: &RunSummary) {
    if let Some(reporter) = reporter {
        reporter.bar.finish_and_clear();
    }
    let counters = summary.counters;
    info!(
        success = counters.success,
        not_found = counters.not_found,
        failed = summary.failed,
        retries = counters.retries,
        rate_limited = counters.rate_limited,
        "summary"
    );
    if summary.needs_new_credentials() {
        error!(
            items = summary.credential_expired,
            "session expired: acquire fresh credentials (--refresh-credentials) and run again"
        );
    }
    if summary.interrupted {
        warn!("Interrupted. Run again to resume.");
    }
}

fn progress_reporter(enabled: bool) -> Option<Arc<BarReporter>> {
    if !enabled {
        return None;
    }
    let bar = ProgressBar::hidden();
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {per_sec} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    Some(Arc::new(BarReporter { bar }))
}

fn as_dyn(reporter: Option<&Arc<BarReporter>>) -> Option<Arc<dyn ProgressReporter>> {
    reporter.map(|r| Arc::clone(r) as Arc<dyn ProgressReporter>)
}

/// Draws a progress bar on stderr.
struct BarReporter {
    bar: ProgressBar,
}

impl ProgressReporter for BarReporter {
    fn run_started(&self, total: u64) {
        self.bar.set_length(total);
        self.bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar
            .enable_steady_tick(std::time::Duration::from_millis(120));
    }

    fn item_finished(&self, outcome: &TransferOutcome) {
        if matches!(outcome, TransferOutcome::RetriesExhausted { .. }) {
            self.bar.set_message("(failures logged)");
        }
        self.bar.inc(1);
    }

    fn batch_finished(&self, batch: usize, batches: usize, snapshot: &StatsSnapshot) {
        let eta = snapshot
            .eta
            .map_or_else(|| "?".to_string(), format_duration);
        self.bar
            .set_message(format!("batch {batch}/{batches} eta {eta}"));
    }
}
