//! ChatPulse Server - Main entry point.
//!
//! This binary starts the conversation monitor and the HTTP/WebSocket hub with:
//! - Structured JSON logging
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`chatpulse_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! CHATPULSE_WATCH_DIR=/data/claude/projects PORT=3333 cargo run --bin chatpulse-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use chatpulse_monitor::ingest::MonitorHandle;
use chatpulse_server::config::Config;
use chatpulse_server::hub::ConnectionHub;
use chatpulse_server::notifications::NotificationManager;
use chatpulse_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                  - HTTP server port (default: 3333)");
            eprintln!("  CHATPULSE_WATCH_DIR   - Conversation log root (default: ~/.claude/projects)");
            eprintln!("  CHATPULSE_DEBOUNCE_MS - Debounce interval in ms (default: 500)");
            eprintln!("  RUST_LOG              - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    match serve(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = format!("{err:#}"), "Server exited with error");
            ExitCode::from(1)
        }
    }
}

/// Runs the monitor and the HTTP/WebSocket server until a shutdown signal.
async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        port = config.port,
        watch_dir = %config.monitor.watch_dir.display(),
        debounce_ms = config.monitor.debounce.as_millis(),
        "ChatPulse server starting"
    );

    let notifications = Arc::new(NotificationManager::new(ConnectionHub::new()));

    let monitor = MonitorHandle::start(&config.monitor, notifications.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to start conversation monitor on {}",
                config.monitor.watch_dir.display()
            )
        })?;

    let port = config.port;
    let state = AppState::new(config, notifications, monitor.reader());
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))
    {
        Ok(listener) => listener,
        Err(err) => {
            shutdown_monitor(monitor).await;
            return Err(err);
        }
    };
    info!(port, address = %bind_addr, "Server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");
    let result = server.await.context("Server error");

    info!("Server shutting down gracefully");
    shutdown_monitor(monitor).await;
    result
}

async fn shutdown_monitor(monitor: MonitorHandle) {
    if let Err(err) = monitor.shutdown().await {
        warn!(error = %err, "Monitor did not shut down cleanly");
    }
}

/// Initialize structured JSON logging with tracing.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
