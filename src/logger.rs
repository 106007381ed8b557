//! Structured Logging for E621 Downloader
//!
//! This module provides functionality for:
//! 1. Filtering by `RUST_LOG` first and the configured level second
//! 2. Logging to the terminal
//! 3. Writing a daily rolling `e621dl.log` through a non-blocking writer

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config_loader::LoggingConfig;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type LoggerResult<T> = Result<T, LoggerError>;

pub const LOG_FILE_NAME: &str = "e621dl.log";

/// Installs the global subscriber. The returned guard flushes the log file and
/// must be held until the process exits. A subscriber that is already
/// installed is left in place.
pub fn init_logger(config: &LoggingConfig, log_dir: &Path) -> LoggerResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let (file_layer, guard) = if config.log_to_file {
        std::fs::create_dir_all(log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let console_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        Ok(()) => info!(
            log_level = %config.log_level,
            log_to_file = config.log_to_file,
            "Logger initialized"
        ),
        Err(e) => debug!("Keeping existing subscriber: {}", e),
    }

    Ok(guard)
}
