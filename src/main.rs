//! tumblr-update main entry point
//!
//! This is the command-line interface for the incremental blog media mirror.

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tumblr_update::config::{
    compute_config_hash, load_config, load_source_list, retain_valid_sources, Config, SourceEntry,
};
use tumblr_update::output::{load_run_history, print_run_history};
use tumblr_update::storage::open_storage;
use tumblr_update::{Coordinator, GlobalStats, Shutdown, StatsSnapshot, UpdateError};

/// How long an interrupted pass gets to unwind before the run is marked directly
const INTERRUPT_GRACE: Duration = Duration::from_secs(10);

/// Exit status after Ctrl-C
const EXIT_INTERRUPTED: i32 = 130;

/// tumblr-update: an incremental media mirror for tumblr blogs
///
/// Crawls each blog newest first, stops at the last post confirmed by a
/// previous run, and downloads new photos and videos. Identical files found
/// through several blogs are stored once and hard-linked.
#[derive(Parser, Debug)]
#[command(name = "tumblr-update")]
#[command(version)]
#[command(about = "Incremental media mirror for tumblr blogs", long_about = None)]
struct Cli {
    /// Blogs to crawl, in addition to the config and sources file
    #[arg(value_name = "SOURCES")]
    sources: Vec<String>,

    /// Path to TOML configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Source list file, one `name [tag]` per line
    #[arg(short = 'f', long = "sources-file", default_value = "download.txt")]
    sources_file: PathBuf,

    /// Ignore stored watermarks and rescan every source
    #[arg(long)]
    force: bool,

    /// Keep running passes, sleeping `sleep-time` seconds in between
    #[arg(long)]
    server: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Show run history from the database and exit
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let config = build_config(&cli)?;

    if cli.stats {
        return handle_stats(&config);
    }

    handle_update(config, cli.force).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("tumblr_update=info,warn"),
            1 => EnvFilter::new("tumblr_update=debug,info"),
            2 => EnvFilter::new("tumblr_update=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Loads the config file, merges every source list, and applies CLI overrides
fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        let config = load_config(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?;
        let hash = compute_config_hash(&cli.config)
            .with_context(|| format!("Failed to hash {}", cli.config.display()))?;
        tracing::info!(
            "Configuration loaded from {} (hash: {})",
            cli.config.display(),
            hash
        );
        config
    } else {
        tracing::info!(
            "No configuration at {}; using defaults",
            cli.config.display()
        );
        Config::default()
    };

    if cli.sources_file.exists() {
        let listed = load_source_list(&cli.sources_file)
            .with_context(|| format!("Failed to read {}", cli.sources_file.display()))?;
        tracing::debug!(
            "{} sources listed in {}",
            listed.len(),
            cli.sources_file.display()
        );
        config.sources.extend(listed);
    }

    config.sources.extend(
        cli.sources
            .iter()
            .map(|name| SourceEntry::new(name.as_str(), None)),
    );
    retain_valid_sources(&mut config.sources);

    if cli.server {
        config.downloader.server_mode = true;
    }

    Ok(config)
}

/// Handles the --stats mode: shows run history from the database
fn handle_stats(config: &Config) -> Result<()> {
    let path = &config.output.database_path;
    println!("Database: {}\n", path.display());

    let storage = open_storage(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    let runs = load_run_history(&storage, 10)?;
    print_run_history(&runs);

    Ok(())
}

/// Handles the main update operation
async fn handle_update(config: Config, force: bool) -> Result<()> {
    if config.sources.is_empty() {
        tracing::warn!("No sources configured; nothing to do");
        return Ok(());
    }

    tracing::info!(
        "Updating {} sources into {} ({} downloaders, {} requests/s)",
        config.sources.len(),
        config.downloader.directory.display(),
        config.downloader.num_downloaders,
        config.downloader.rate
    );

    let database = config.output.database_path.clone();
    let shutdown = Arc::new(Shutdown::new());
    let coordinator = Coordinator::new(config, Arc::clone(&shutdown))
        .with_context(|| format!("Failed to open database {}", database.display()))?;
    let stats = coordinator.stats();

    spawn_status_printer(Arc::clone(&stats));

    let run = coordinator.run(force);
    tokio::pin!(run);

    let finished = tokio::select! {
        result = &mut run => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(result) = finished else {
        tracing::warn!("Interrupted; stopping");
        shutdown.cancel();
        interrupt(&coordinator, run, &stats).await
    };

    match result {
        Ok(_) => {
            stats.print_status();
            Ok(())
        }
        Err(UpdateError::Cancelled) => {
            stats.print_status();
            std::process::exit(EXIT_INTERRUPTED);
        }
        Err(e) => {
            stats.print_status();
            Err(e).context("Update failed")
        }
    }
}

/// Lets the pass unwind, records the run as interrupted, and exits
async fn interrupt<F>(coordinator: &Coordinator, run: Pin<&mut F>, stats: &GlobalStats) -> !
where
    F: Future<Output = Result<StatsSnapshot, UpdateError>>,
{
    match tokio::time::timeout(INTERRUPT_GRACE, run).await {
        Ok(Err(e)) if !matches!(e, UpdateError::Cancelled) => {
            tracing::error!("Pass failed while stopping: {}", e);
        }
        Ok(_) => {}
        Err(_) => {
            tracing::warn!("Tasks did not stop within {:?}", INTERRUPT_GRACE);
            if let Err(e) = coordinator.mark_interrupted() {
                tracing::error!("Failed to mark run as interrupted: {}", e);
            }
        }
    }

    stats.print_status();
    std::process::exit(EXIT_INTERRUPTED);
}

/// Prints the live status on SIGQUIT without stopping
#[cfg(unix)]
fn spawn_status_printer(stats: Arc<GlobalStats>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut quit = match signal(SignalKind::quit()) {
        Ok(quit) => quit,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGQUIT: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while quit.recv().await.is_some() {
            stats.print_status();
        }
    });
}

#[cfg(not(unix))]
fn spawn_status_printer(_stats: Arc<GlobalStats>) {}
