//! Configuration loading traits and types.
//!
//! Segments and channels are described by small TOML documents so that the
//! writer and reader processes of a pipeline agree on keys and geometry.
//!
//! # Usage
//!
//! ```rust,no_run
//! use daq_common::config::{ConfigLoader, ConfigError, TransportConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = TransportConfig::load(Path::new("transport.toml"))?;
//!     config.validate()?;
//!     println!("data segment key: {:#x}", config.data.key);
//!     Ok(())
//! }
//! ```

use crate::consts::DEFAULT_STALE_TIMEOUT_US;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

fn default_stale_timeout_us() -> u64 {
    DEFAULT_STALE_TIMEOUT_US
}

fn default_destructive_read() -> bool {
    true
}

/// Geometry and behaviour of one shared-memory segment.
///
/// # TOML Example
///
/// ```toml
/// key = 0xBEE70000
/// slot_count = 10
/// slot_size = 1048576
/// stale_timeout_us = 5000000
/// destructive_read = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Segment key.
    pub key: u32,

    /// Number of slots. Zero means "attach only, never create".
    #[serde(default)]
    pub slot_count: usize,

    /// Slot size in bytes. Ignored when attaching to an existing segment.
    #[serde(default)]
    pub slot_size: usize,

    /// Slot stale timeout in microseconds; zero disables time-based reclamation.
    #[serde(default = "default_stale_timeout_us")]
    pub stale_timeout_us: u64,

    /// `true`: consuming a slot empties it. `false`: every reader sees every slot.
    #[serde(default = "default_destructive_read")]
    pub destructive_read: bool,

    /// Rank published by the creating process.
    #[serde(default)]
    pub rank: i32,
}

impl SegmentConfig {
    /// Configuration for a segment the caller may create.
    pub fn new(key: u32, slot_count: usize, slot_size: usize) -> Self {
        Self {
            key,
            slot_count,
            slot_size,
            stale_timeout_us: DEFAULT_STALE_TIMEOUT_US,
            destructive_read: true,
            rank: 0,
        }
    }

    /// Configuration that only attaches to an existing segment.
    pub fn attach_only(key: u32) -> Self {
        Self::new(key, 0, 0)
    }

    /// Set the stale timeout.
    pub fn with_stale_timeout_us(mut self, stale_timeout_us: u64) -> Self {
        self.stale_timeout_us = stale_timeout_us;
        self
    }

    /// Select destructive (`true`) or broadcast (`false`) reads.
    pub fn with_destructive_read(mut self, destructive_read: bool) -> Self {
        self.destructive_read = destructive_read;
        self
    }

    /// Set the rank.
    pub fn with_rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    /// Whether this configuration allows creating the segment.
    pub fn may_create(&self) -> bool {
        self.slot_count > 0
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a creating configuration has
    /// a zero slot size or the segment size overflows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_count > 0 && self.slot_size == 0 {
            return Err(ConfigError::ValidationError(format!(
                "segment {:#x}: slot_size must be non-zero when slot_count is {}",
                self.key, self.slot_count
            )));
        }
        if self.slot_count.checked_mul(self.slot_size).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "segment {:#x}: {} slots of {} bytes overflow",
                self.key, self.slot_count, self.slot_size
            )));
        }
        Ok(())
    }
}

/// Configuration of a process's transport endpoints.
///
/// # TOML Example
///
/// ```toml
/// log_level = "debug"
///
/// [data]
/// key = 0xBEE70000
/// slot_count = 10
/// slot_size = 1048576
///
/// [broadcast]
/// key = 0xBEE80000
/// slot_count = 4
/// slot_size = 65536
/// destructive_read = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Primary data segment.
    pub data: SegmentConfig,

    /// Optional broadcast segment.
    #[serde(default)]
    pub broadcast: Option<SegmentConfig>,
}

impl TransportConfig {
    /// Validate every segment and check the broadcast segment is distinct.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.data.validate()?;
        if let Some(broadcast) = &self.broadcast {
            broadcast.validate()?;
            if broadcast.key == self.data.key {
                return Err(ConfigError::ValidationError(format!(
                    "broadcast segment reuses data key {:#x}",
                    self.data.key
                )));
            }
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `serde::de::DeserializeOwned` type.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
