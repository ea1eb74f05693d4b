//! # Hub Logging
//!
//! Installs the global `tracing` subscriber:
//! - an `EnvFilter` built from `RUST_LOG`, falling back to the configured level
//! - a console layer with targets and ANSI colours
//! - when a log directory is configured, a JSON layer writing to a daily
//!   rotating file through a non-blocking appender
//!
//! The appender's [`WorkerGuard`] is handed back to the caller, who must keep
//! it alive until exit so buffered lines get flushed.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("couldn't create log directory {path:?}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid log filter {filter:?}: {source}")]
    Filter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Builds the filter: `RUST_LOG` wins, `log_level` otherwise.
pub fn build_filter(log_level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(log_level).map_err(|source| LoggerError::Filter {
            filter: log_level.to_string(),
            source,
        })
    })
}

/// Installs the global subscriber. Returns the file appender guard when a
/// `log_dir` is given.
pub fn setup_logging(
    log_level: &str,
    log_dir: Option<&Path>,
    app_name: &str,
) -> Result<Option<WorkerGuard>, LoggerError> {
    let env_filter = build_filter(log_level)?;
    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggerError::LogDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let file_appender = rolling::daily(dir, app_name);
            let (writer, guard) = non_blocking(file_appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match log_dir {
        Some(dir) => info!("Logging initialized with level {} into {}", log_level, dir.display()),
        None => info!("Logging initialized with level {}", log_level),
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_filters() {
        // Only meaningful when RUST_LOG is not set for the test run.
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(
                build_filter("happening=loudest"),
                Err(LoggerError::Filter { .. })
            ));
        }
    }

    #[test]
    fn accepts_plain_levels() {
        assert!(build_filter("debug").is_ok());
    }
}
