//! Logging setup for top-level entry points.
//!
//! Library code only emits `tracing` events; an application (or a test
//! harness) calls [`init_logging`] once to decide where they go.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;
use crate::error::{ClientError, Result};

/// File name prefix for rotated log files.
const LOG_FILE_PREFIX: &str = "skein";

// Dropping the guard would stop the non-blocking writer.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber described by `config`.
///
/// Logs go to stderr, or to daily-rotated files when `log_dir` is set.
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    match &config.log_dir {
        Some(dir) => init_file_logging(dir, config.verbose),
        None => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter(config.verbose))
            .try_init()
            .map_err(|e| ClientError::Config(format!("Failed to install logger: {}", e))),
    }
}

fn init_file_logging(dir: &Path, verbose: bool) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(filter(verbose))
        .try_init()
        .map_err(|e| ClientError::Config(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_filter() {
        assert_eq!(filter(true).to_string(), "debug");
    }

    #[test]
    fn test_file_logging_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = LoggingConfig {
            verbose: true,
            log_dir: Some(log_dir.clone()),
        };

        // Another test may already own the global subscriber; the directory
        // is created either way.
        let _ = init_logging(&config);
        assert!(log_dir.is_dir());

        tracing::info!("written to file");
        assert!(init_logging(&config).is_err());
    }
}
