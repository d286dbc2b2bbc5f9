//! Configuration for faultring (faultring.toml).
//!
//! Every section is optional; missing keys fall back to their defaults.
//!
//! ```toml
//! [ring]
//! region_dir = "/dev/shm"
//! region_name = "faultring"
//! capacity = 100
//! capture_threshold = "error"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;
use crate::record::Severity;
use crate::ring_store::{DEFAULT_CAPACITY, MAX_CAPACITY};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FAULTRING_CONFIG";

/// File name looked up under the user config directory.
pub const CONFIG_FILE_NAME: &str = "faultring.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

// =============================================================================
// LogFormat
// =============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

// =============================================================================
// RingConfig
// =============================================================================

/// Where the shared region lives and how big it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Directory holding the region and lock files. Should be memory-backed.
    pub region_dir: PathBuf,
    /// Stable region name shared by every worker.
    pub region_name: String,
    /// Name of the reader/writer lock guarding the ring.
    pub lock_name: String,
    /// Number of slots (fixed at region creation).
    pub capacity: usize,
    /// Events below this severity are not captured.
    pub capture_threshold: Severity,
    /// Origin identifier for this process; defaults to the process id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<i32>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            region_dir: default_region_dir(),
            region_name: "faultring".to_string(),
            lock_name: "faultring".to_string(),
            capacity: DEFAULT_CAPACITY,
            capture_threshold: Severity::Error,
            origin_id: None,
        }
    }
}

impl RingConfig {
    /// Check the values are usable before touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "ring.capacity must be between 1 and {MAX_CAPACITY}, got {}",
                self.capacity
            )));
        }
        validate_name("ring.region_name", &self.region_name)?;
        validate_name("ring.lock_name", &self.lock_name)?;
        if self.lock_name.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "ring.lock_name must not contain '.', got {:?}",
                self.lock_name
            )));
        }
        Ok(())
    }

    /// Origin to stamp on captures from this process.
    #[must_use]
    pub fn effective_origin(&self) -> i32 {
        self.origin_id
            .unwrap_or_else(|| i32::try_from(std::process::id()).unwrap_or(i32::MAX))
    }
}

fn validate_name(key: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Invalid(format!("{key} must not be empty")));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ConfigError::Invalid(format!(
            "{key} must be a plain file name, got {name:?}"
        )));
    }
    Ok(())
}

/// Default region directory: `/dev/shm` when present, else the temp dir.
#[must_use]
pub fn default_region_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ring: RingConfig,
    pub logging: LogConfig,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.ring.validate()?;
        Ok(config)
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load the first config found: `explicit`, then `$FAULTRING_CONFIG`,
    /// then the user config dir. Falls back to defaults if none exists.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match resolve_config_path(explicit) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

/// Locate the config file to load, if any.
///
/// An explicit path or `$FAULTRING_CONFIG` is returned even if it does not
/// exist, so loading it reports the problem. The user config dir is only
/// used when the file is present.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join("faultring").join(CONFIG_FILE_NAME))
        .filter(|path| path.is_file())
}
