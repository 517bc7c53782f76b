//! Error types for shared memory operations

use daq::config::ConfigError;
use thiserror::Error;

/// Errors that can occur during shared memory operations.
///
/// The first six variants are protocol violations: the manager that hit one
/// has already detached from the segment when the error is returned.
#[derive(Error, Debug)]
pub enum ShmError {
    /// Slot index outside the segment
    #[error("Slot index {slot} out of range (segment has {slot_count} slots)")]
    ArgumentOutOfRange {
        /// Requested slot
        slot: usize,
        /// Slots in the segment
        slot_count: usize,
    },

    /// Slot is not in the state the operation requires
    #[error("Slot {slot} is {actual}, expected {expected}")]
    StateAccessViolation {
        /// Slot index
        slot: usize,
        /// Required state
        expected: &'static str,
        /// Observed state
        actual: &'static str,
    },

    /// Slot is owned by another manager
    #[error("Slot {slot} is owned by manager {owner}, not manager {manager}")]
    OwnerAccessViolation {
        /// Slot index
        slot: usize,
        /// Observed owner
        owner: i32,
        /// Calling manager
        manager: i32,
    },

    /// Write would run past the end of the slot
    #[error("Write of {len} bytes at offset {offset} overruns slot {slot} ({capacity} bytes)")]
    SharedMemoryWrite {
        /// Slot index
        slot: usize,
        /// Write offset
        offset: usize,
        /// Requested length
        len: usize,
        /// Slot size
        capacity: usize,
    },

    /// Read would run past the written data
    #[error("Read of {len} bytes at offset {offset} overruns slot {slot} ({available} bytes left)")]
    SharedMemoryRead {
        /// Slot index
        slot: usize,
        /// Read offset
        offset: usize,
        /// Requested length
        len: usize,
        /// Unread bytes
        available: usize,
    },

    /// Call that makes no sense in the current context
    #[error("Logic error: {0}")]
    LogicError(String),

    /// Manager is not attached to a segment
    #[error("Not attached to a shared memory segment")]
    NotAttached,

    /// Segment did not become ready in time
    #[error("Timed out attaching to segment {key:#010x}")]
    AttachTimeout {
        /// Segment key
        key: u32,
    },

    /// Segment was created with a different layout
    #[error("Segment {key:#010x} has layout version {found}, expected {expected}")]
    IncompatibleVersion {
        /// Segment key
        key: u32,
        /// Version in the segment
        found: u32,
        /// Version this build understands
        expected: u32,
    },

    /// Configuration rejected
    #[error("Invalid configuration: {source}")]
    InvalidConfig {
        /// Source config error
        #[from]
        source: ConfigError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl ShmError {
    /// Short name of the error category, used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ArgumentOutOfRange { .. } => "ArgumentOutOfRange",
            Self::StateAccessViolation { .. } => "StateAccessViolation",
            Self::OwnerAccessViolation { .. } => "OwnerAccessViolation",
            Self::SharedMemoryWrite { .. } => "SharedMemoryWrite",
            Self::SharedMemoryRead { .. } => "SharedMemoryRead",
            Self::LogicError(_) => "LogicError",
            Self::NotAttached => "NotAttached",
            Self::AttachTimeout { .. } => "AttachTimeout",
            Self::IncompatibleVersion { .. } => "IncompatibleVersion",
            Self::InvalidConfig { .. } => "InvalidConfig",
            Self::Io { .. } => "Io",
            Self::Nix { .. } => "Nix",
            Self::Json { .. } => "Json",
        }
    }

    /// Whether the error is a slot protocol violation (and the manager detached).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ArgumentOutOfRange { .. }
                | Self::StateAccessViolation { .. }
                | Self::OwnerAccessViolation { .. }
                | Self::SharedMemoryWrite { .. }
                | Self::SharedMemoryRead { .. }
                | Self::LogicError(_)
        )
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
