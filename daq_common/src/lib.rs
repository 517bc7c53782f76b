//! DAQ Common Library
//!
//! Shared building blocks for the DAQ shared-memory transport: segment
//! configuration, record formats, the monotonic clock, a bounded in-process
//! queue and sliding-window statistics.
//!
//! # Module Structure
//!
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Segment layout constants and polling back-off
//! - [`fragment`] - Fragment header, type codes and wire form
//! - [`event`] - Event header wire form
//! - [`queue`] - Bounded thread-safe FIFO with overflow policies
//! - [`statistics`] - Monitored quantities and their collector
//! - [`time`] - Monotonic microsecond clock
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! daq = { package = "daq_common", path = "../daq_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use daq_common::consts::*;
//! use daq_common::config::{ConfigLoader, SegmentConfig};
//! ```

pub mod config;
pub mod consts;
pub mod event;
pub mod fragment;
pub mod prelude;
pub mod queue;
pub mod statistics;
pub mod time;
