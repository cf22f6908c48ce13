//! Logging setup
//!
//! Ledger events (`simple_bank::*`) log at the configured level; dependencies
//! such as sqlx and the connection pool stay at `warn` unless `RUST_LOG` asks
//! for more.

use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter directives for a configured `log_level`
///
/// A bare level (`debug`) applies to this crate only. A value that already
/// carries directives (`info,sqlx=debug`) is used as written.
pub fn filter_directives(log_level: &str) -> String {
    if log_level.contains('=') || log_level.contains(',') {
        return log_level.to_string();
    }
    format!("warn,simple_bank={}", log_level)
}

/// `minutely`, `hourly` or `daily`; anything else keeps a single file
pub fn rotation(name: &str) -> Rotation {
    match name.to_ascii_lowercase().as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Install the global subscriber; keep the guard alive until exit so the
/// file writer flushes
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender =
        RollingFileAppender::new(rotation(&config.rotation), &config.log_dir, &config.log_file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // Machine-readable file only; transfer fields land as JSON keys
        let file_layer = fmt::layer()
            .json()
            .with_current_span(false)
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        // CLI results go to stdout as JSON, so logs stay on stderr
        let stderr_layer = fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);
        registry.with(file_layer).with(stderr_layer).init();
    }

    guard
}
