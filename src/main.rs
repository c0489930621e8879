//! CLI entry point for the harvester tool.

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::exit::{ProcessExit, determine_exit_outcome};
use harvester_core::fallback::MirrorResolver;
use harvester_core::fetch::{Fetcher, RetryPolicy};
use harvester_core::ledger::{Ledger, LedgerStore};
use harvester_core::scheduler::Scheduler;
use harvester_core::task::load_work_list;
use tracing::{debug, error, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::RunSettings;
use cli::Args;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();

    debug!(?args, "CLI arguments parsed");

    match run(args).await {
        Ok(outcome) => outcome.into(),
        Err(err) => {
            error!(error = %format!("{err:#}"), "harvester aborted");
            ProcessExit::Failure.into()
        }
    }
}

async fn run(args: Args) -> Result<ProcessExit> {
    let file_config = app_config::load_file_config_for(args.config.as_deref())?;
    let settings = RunSettings::resolve(&args, file_config.as_ref())?;

    let work_list = load_work_list(&settings.work_list)
        .with_context(|| format!("Failed to load work list '{}'", settings.work_list.display()))?;
    if work_list.duplicates > 0 {
        warn!(duplicates = work_list.duplicates, "ignored duplicate ids in work list");
    }
    info!(
        tasks = work_list.len(),
        output = %settings.output_dir.display(),
        "Harvester starting"
    );

    tokio::fs::create_dir_all(&settings.output_dir)
        .await
        .with_context(|| {
            format!(
                "Output directory '{}' is not writable",
                settings.output_dir.display()
            )
        })?;
    let ledger = Arc::new(
        Ledger::open(&settings.state_file)
            .await
            .with_context(|| format!("Failed to open state file '{}'", settings.state_file.display()))?,
    );

    let fetcher = Fetcher::new(
        &settings.fetcher,
        RetryPolicy::with_max_attempts(settings.max_attempts),
    )
    .context("Failed to build HTTP client")?;
    let store: Arc<dyn LedgerStore> = Arc::clone(&ledger) as Arc<dyn LedgerStore>;
    let scheduler = Scheduler::prepare(
        settings.scheduler,
        fetcher,
        MirrorResolver::new(settings.mirrors),
        store,
        &settings.output_dir,
    )
    .await?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight tasks");
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    let use_spinner = progress::should_use_spinner(
        std::io::stderr().is_terminal(),
        args.quiet,
        progress::is_dumb_terminal(),
    );
    let (progress_handle, stop_progress) =
        progress::spawn_progress_ui(use_spinner, scheduler.stats(), work_list.len());

    let result = scheduler.run(work_list.tasks, Arc::clone(&interrupted)).await;

    stop_progress.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }
    drop(scheduler);
    if let Ok(ledger) = Arc::try_unwrap(ledger) {
        ledger.close().await;
    }

    let summary = result?;
    Ok(determine_exit_outcome(&summary))
}
