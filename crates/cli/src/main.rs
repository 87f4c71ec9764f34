//! fswatch CLI - print changes inside a set of directories

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{after, bounded, select};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use watcher::{Watcher, WatcherConfig};

mod printer;

use printer::EventPrinter;

/// Watch directories and print every created, deleted or modified entry
#[derive(Parser)]
#[command(name = "fswatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directories to watch
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll timeout in milliseconds (overrides the config file)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Exit after this many seconds instead of waiting for Enter
    #[arg(long)]
    duration: Option<u64>,

    /// Also print events that carry none of the watched flags
    #[arg(long)]
    show_unknown: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let default = if verbose { "fswatch=debug" } else { "fswatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or_else(|| "fswatch.log".as_ref());
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
            None
        }
    }
}

fn load_config(cli: &Cli) -> Result<WatcherConfig> {
    let mut config = match &cli.config {
        Some(path) => WatcherConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WatcherConfig::default(),
    };
    if let Some(ms) = cli.timeout_ms {
        config.poll_timeout_ms = ms;
    }
    Ok(config)
}

/// Block until Enter is pressed or the optional duration elapses
fn wait_for_exit(duration: Option<u64>) {
    let (tx, rx) = bounded::<()>(1);
    thread::spawn(move || {
        let mut line = String::new();
        // EOF drops the sender without a signal
        if matches!(io::stdin().read_line(&mut line), Ok(n) if n > 0) {
            let _ = tx.send(());
        }
    });

    match duration {
        Some(secs) => {
            let timeout = after(Duration::from_secs(secs));
            select! {
                recv(rx) -> _ => {},
                recv(timeout) -> _ => {},
            }
        }
        None => {
            let _ = rx.recv();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_file.as_deref());

    let config = load_config(&cli)?;
    let watcher = Watcher::with_config(config).context("Failed to initialize watcher")?;

    let color = io::stdout().is_terminal();
    watcher.add_subscriber(Arc::new(EventPrinter::new(io::stdout(), color, cli.show_unknown)));

    for path in &cli.paths {
        watcher
            .add_node(path)
            .with_context(|| format!("Failed to watch {}", path.display()))?;
    }

    watcher.start().context("Failed to start watch loop")?;
    match cli.duration {
        Some(secs) => info!("Watching {} paths for {}s", cli.paths.len(), secs),
        None => info!("Watching {} paths; press Enter to stop", cli.paths.len()),
    }

    wait_for_exit(cli.duration);
    watcher.stop();

    let stats = watcher.stats();
    info!(
        "Stopped after {} events in {} batches ({} read failures, {} overflows)",
        stats.events, stats.batches, stats.read_failures, stats.overflows
    );
    Ok(())
}
