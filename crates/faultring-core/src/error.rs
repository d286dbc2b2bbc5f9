//! Error types for faultring-core

use std::fmt::Write;
use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands as (label, command) pairs
    pub commands: Vec<(String, String)>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for (label, command) in &self.commands {
                let _ = writeln!(output, "    - {label}: {command}");
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for faultring-core
#[derive(Error, Debug)]
pub enum Error {
    /// The shared region has not been attached in this process
    #[error("error ring shared region not initialized")]
    NotInitialized,

    /// An existing region was built with a different layout
    #[error("region layout mismatch: expected {expected}, found {found}")]
    LayoutMismatch { expected: String, found: String },

    /// Region contents failed validation
    #[error("region corrupt: {0}")]
    Corrupt(String),

    /// Conflicting reservation during the sizing phase
    #[error("region plan error: {0}")]
    Plan(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors on the region or lock files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Return remediation guidance.
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotInitialized => Remediation::new(
                "Attach to the shared region before querying it (the host creates it at startup).",
            )
            .command("Create or attach", "fring init")
            .alternative("Check that --region-dir and --name match the running host."),
            Self::LayoutMismatch { .. } => Remediation::new(
                "The existing region was created with a different capacity or record layout.",
            )
            .command("Inspect", "fring stats")
            .command("Recreate (drops captured errors)", "fring destroy && fring init")
            .alternative("Use the capacity the region was created with."),
            Self::Corrupt(_) => Remediation::new(
                "The region file does not hold a valid error ring. Recreate it.",
            )
            .command("Recreate (drops captured errors)", "fring destroy && fring init"),
            Self::Plan(_) => Remediation::new(
                "Two reservations for the same registrant disagree. Request each segment once.",
            ),
            Self::Config(_) => Remediation::new("Fix the configuration file and retry.")
                .alternative("Remove unknown or invalid keys from faultring.toml."),
            Self::Io(_) => Remediation::new(
                "Check that the region directory exists and is writable by every worker.",
            )
            .command("Check directory", "ls -la /dev/shm")
            .alternative("Point --region-dir at a shared tmpfs directory."),
        }
    }

    /// Whether this error means "nothing attached yet".
    #[must_use]
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, Self::NotInitialized)
    }
}
