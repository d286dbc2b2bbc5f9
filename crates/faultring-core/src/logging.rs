//! Structured logging for faultring
//!
//! This module provides the logging infrastructure, using `tracing` with
//! configurable output formats and destinations.
//!
//! # Features
//!
//! - **Pretty format**: Human-friendly output for interactive use
//! - **JSON format**: Machine-parseable JSON lines for CI and ops
//! - **File output**: Optional append-only log file
//! - **Capture**: Optionally route the host's own error events into the ring
//!
//! # Usage
//!
//! ```ignore
//! use faultring_core::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default())?;
//! ```
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `region`: Path of the shared region file
//! - `origin_id`: Origin identifier of the capturing process
//! - `slot`: Slot index written or read
//! - `capacity`: Ring capacity
//! - `created`: Whether this process created the region

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::filter::{Filtered, LevelFilter};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::capture::CaptureLayer;
use crate::record::Severity;
use crate::ring::ErrorRing;

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    /// Can be overridden by RUST_LOG environment variable
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to log file
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn ensure_parent_dir(path: &std::path::Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let existed = parent.exists();
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            if !existed {
                let permissions = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(parent, permissions)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &std::path::Path, mode: u32) -> io::Result<()> {
    let permissions = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, permissions)
}

/// Filter for one output layer: `RUST_LOG` if set, else the configured level.
fn output_filter(config: &LogConfig) -> Result<EnvFilter, LogError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|_| LogError::InvalidLevel(config.level.clone())),
    }
}

fn open_log_file(config: &LogConfig) -> Result<Option<std::fs::File>, LogError> {
    let Some(path) = &config.file else {
        return Ok(None);
    };
    ensure_parent_dir(path)?;
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if !existed {
        set_file_permissions(path, 0o600)?;
    }
    Ok(Some(file))
}

/// Capture layer behind its own level filter, independent of `RUST_LOG`.
fn filtered_capture<S>(layer: CaptureLayer) -> Filtered<CaptureLayer, LevelFilter, S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let filter = layer.level_filter();
    layer.with_filter(filter)
}

/// Initialize the global logging subscriber
///
/// Subsequent calls return `Err(LogError::AlreadyInitialized)`.
///
/// The `RUST_LOG` environment variable overrides the configured level, e.g.
/// `RUST_LOG=faultring_core=debug`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    install(config, None)
}

/// Initialize logging and route events at or above `threshold` into `ring`.
///
/// Capture is filtered on its own, so a quiet console level does not hide
/// errors from the ring.
pub fn init_logging_with_capture(
    config: &LogConfig,
    ring: Arc<ErrorRing>,
    threshold: Severity,
) -> Result<(), LogError> {
    install(config, Some(CaptureLayer::new(ring, threshold)))
}

fn install(config: &LogConfig, capture: Option<CaptureLayer>) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let file_writer = open_log_file(config)?;

    match config.format {
        LogFormat::Pretty => {
            let stderr_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .with_filter(output_filter(config)?);
            let file_layer = match file_writer {
                Some(file) => Some(
                    fmt::layer()
                        .with_writer(file)
                        .with_target(true)
                        .with_ansi(false)
                        .with_filter(output_filter(config)?),
                ),
                None => None,
            };
            let subscriber = tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .with(capture.map(filtered_capture));
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let stderr_layer = fmt::layer()
                .json()
                .with_timer(SystemTime)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true)
                .with_filter(output_filter(config)?);
            let file_layer = match file_writer {
                Some(file) => Some(
                    fmt::layer()
                        .json()
                        .with_writer(file)
                        .with_timer(SystemTime)
                        .with_target(true)
                        .with_current_span(true)
                        .flatten_event(true)
                        .with_filter(output_filter(config)?),
                ),
                None => None,
            };
            let subscriber = tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .with(capture.map(filtered_capture));
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    let _ = LOGGING_INITIALIZED.set(true);

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(())
}

/// Log levels that can be used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Level for a `-v` count given on the command line.
    #[must_use]
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}
