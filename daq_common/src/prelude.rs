//! Prelude module for common re-exports.
//!
//! `use daq_common::prelude::*;` brings in the types most transport users
//! touch without listing individual paths.

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, SegmentConfig, TransportConfig};

// ─── Records ────────────────────────────────────────────────────────
pub use crate::event::{EVENT_HEADER_SIZE, EventHeader};
pub use crate::fragment::{
    FRAGMENT_HEADER_SIZE, Fragment, FragmentError, FragmentHeader, FragmentType,
    SystemFragmentType, TypeFilter,
};

// ─── Queue ──────────────────────────────────────────────────────────
pub use crate::queue::{ConcurrentQueue, FailIfFull, KeepNewest, QueueFull, RejectNewest};

// ─── Statistics ─────────────────────────────────────────────────────
pub use crate::statistics::{MonitoredQuantity, MonitoredQuantityStats, StatisticsCollector};

// ─── Time ───────────────────────────────────────────────────────────
pub use crate::time::{ManualClock, MonotonicClock, TimeProvider};
