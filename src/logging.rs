//! Structured logging wired from [`LoggingSettings`].
//!
//! [`init`] installs the production subscriber: a daily-rotating JSON
//! file layer under the configured directory plus a human-readable
//! stderr layer. [`init_console`] is the console-only setup for tools
//! and ad-hoc debugging.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;

/// File name prefix for the rotating log; the appender suffixes the
/// date, yielding `straylight.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "straylight.log";

/// Keeps the non-blocking file writer alive.
///
/// Hold this for the life of the process; dropping it flushes pending
/// entries and closes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Install the production subscriber from config.
///
/// The filter honors `RUST_LOG` when set and falls back to the
/// configured level. The log directory is created if missing.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a
/// subscriber is already installed.
pub fn init(settings: &LoggingSettings) -> anyhow::Result<LoggingGuard> {
    let dir = Path::new(&settings.dir);
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("failed to create log directory {}: {e}", dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Install a console-only subscriber.
///
/// Stderr output controlled by `RUST_LOG` (default `info`). No files.
pub fn init_console() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
