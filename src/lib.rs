pub mod adapters;
pub mod baseline;
pub mod config;
pub mod db;
pub mod detector;
pub mod errors;
pub mod ingest;
pub mod lifecycle;
pub mod locks;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod report;
pub mod scheduler;
pub mod store;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// JSON logs to a daily-rolling file under `log_dir`. `RUST_LOG` overrides
/// the default `info` filter.
pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "funnel-monitor.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
