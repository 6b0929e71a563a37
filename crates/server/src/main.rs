use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use server::api::build_router;
use server::config::{AppConfig, LogFormat, LogOutput};
use server::db::Database;
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: basic tracing so config loading can log.
    // Uses set_default (thread-local) so it can be replaced by phase 2's
    // global subscriber.
    let basic_tracing = init_tracing_basic();

    info!("Starting AutoCause API v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    // Phase 2: re-initialize tracing with config (format, level)
    drop(basic_tracing);
    init_tracing_from_config(&config);

    info!("Configuration loaded successfully");
    info!("Server will bind to: {}", config.server.bind_address);

    let db = Database::open(&config.database.path).context("Failed to open database")?;
    info!("Database ready at {}", config.database.path);

    let drain = Duration::from_secs(config.workers.drain_secs);
    let state = AppState::new(config.clone(), db);
    info!(
        "Worker pools started (parse={}, analysis={})",
        config.workers.parse_pool, config.workers.rca_pool
    );

    let app = build_router(state.clone());

    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("✓ AutoCause API is ready!");
    info!("Listening on: http://{}", addr);
    info!("  - Health check: http://{}/health", addr);
    info!("  - Upload: POST http://{}/logs/upload", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop the worker pools: drain in-flight jobs, then fail whatever is
    // still live so no job is left dangling in 'running'
    state.scheduler.shutdown_and_drain(drain).await;

    info!("Server shut down gracefully");
    Ok(())
}

/// Phase 1: basic tracing init so we can log during config loading.
fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,server=debug"));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_default(subscriber)
}

/// Phase 2: re-initialize tracing with configuration values.
fn init_tracing_from_config(config: &AppConfig) {
    use std::sync::Arc;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match (&config.logging.format, &config.logging.output) {
        (LogFormat::Json, LogOutput::Stdout) => {
            let layer = fmt::layer().json().with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Json, LogOutput::File { path }) => {
            let file = open_log_file(path);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Pretty, LogOutput::Stdout) => {
            let layer = fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Pretty, LogOutput::File { path }) => {
            let file = open_log_file(path);
            let layer = fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

fn open_log_file(path: &str) -> std::fs::File {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap_or_else(|e| panic!("Failed to open log file '{}': {}", path, e))
}

/// Graceful shutdown on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
