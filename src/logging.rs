use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes the logging system with both console and file output.
///
/// The returned guard flushes the file writer when dropped, so the caller
/// keeps it alive for the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> WorkerGuard {
    // Ensure logs directory exists
    let _ = fs::create_dir_all(&config.directory);

    // Create a non-blocking file appender for daily log rotation
    let file_appender = tracing_appender::rolling::daily(&config.directory, &config.file_name);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    // JSON lines for the file, human-readable output on stderr so stdout stays clean
    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    // Respect RUST_LOG if set; otherwise default to info for our crate
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lab_scraper=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}
