//! ChatPulse Monitor - conversation state watcher.
//!
//! # Commands
//!
//! - `chatpulse-monitor snapshot`: Parse every conversation once and print states as JSON
//! - `chatpulse-monitor run`: Watch the log tree and log state changes until interrupted
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatpulse_monitor::config::Config;
use chatpulse_monitor::ingest::{snapshot, MonitorHandle};
use chatpulse_monitor::types::StateChangeEvent;

/// ChatPulse Monitor - conversation state watcher.
///
/// Reconstructs conversations from append-only JSONL logs and infers what
/// each one is doing right now.
#[derive(Parser, Debug)]
#[command(name = "chatpulse-monitor")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    CHATPULSE_WATCH_DIR              Log root (default: ~/.claude/projects)
    CHATPULSE_DEBOUNCE_MS            Settle interval (default: 500)
    CHATPULSE_TYPING_THRESHOLD_SECS  Quiet time before user_typing (default: 30)
    CHATPULSE_RECENT_MINUTES         recently_active boundary (default: 5)
    CHATPULSE_IDLE_MINUTES           idle boundary (default: 60)
    CHATPULSE_INACTIVE_MINUTES       inactive boundary (default: 1440)

EXAMPLES:
    # Print the current state of every conversation
    chatpulse-monitor snapshot --pretty

    # Watch a custom directory
    chatpulse-monitor run --dir /data/claude/projects
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Parse all conversations once and print their states as JSON.
    Snapshot {
        /// Root directory (overrides CHATPULSE_WATCH_DIR).
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Pretty-print the JSON output.
        #[arg(short, long)]
        pretty: bool,
    },

    /// Watch for changes and log every state transition.
    Run {
        /// Root directory (overrides CHATPULSE_WATCH_DIR).
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    match cli.command {
        Command::Snapshot { dir, pretty } => runtime.block_on(run_snapshot(dir, pretty)),
        Command::Run { dir } => runtime.block_on(run_monitor(dir)),
    }
}

fn load_config(dir: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(dir) = dir {
        config.watch_dir = dir;
    }
    Ok(config)
}

async fn run_snapshot(dir: Option<PathBuf>, pretty: bool) -> Result<()> {
    let config = load_config(dir)?;

    let reader = snapshot(&config).await.with_context(|| {
        format!(
            "Failed to scan conversations in {}",
            config.watch_dir.display()
        )
    })?;

    let listing = reader.list();
    let json = if pretty {
        serde_json::to_string_pretty(&listing)
    } else {
        serde_json::to_string(&listing)
    }
    .context("Failed to serialize snapshot")?;

    println!("{json}");
    Ok(())
}

async fn run_monitor(dir: Option<PathBuf>) -> Result<()> {
    info!("Starting ChatPulse Monitor");

    let config = load_config(dir)?;
    info!(
        watch_dir = %config.watch_dir.display(),
        debounce_ms = config.debounce.as_millis(),
        "Configuration loaded"
    );

    let sink = |event: &StateChangeEvent| {
        info!(
            conversation_id = %event.conversation_id,
            project = %event.context.project_path,
            previous = ?event.previous_state,
            state = %event.new_state,
            trigger = ?event.context.trigger,
            "State change"
        );
    };

    let monitor = MonitorHandle::start(&config, Arc::new(sink))
        .await
        .with_context(|| format!("Failed to watch {}", config.watch_dir.display()))?;

    wait_for_shutdown().await;
    info!("Shutdown signal received");

    if let Err(e) = monitor.shutdown().await {
        warn!(error = %e, "Monitor did not shut down cleanly");
    }

    info!("ChatPulse Monitor stopped");
    Ok(())
}

/// Logs go to stderr so `snapshot` output stays machine-readable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
