//! # DAQ Shared Memory Transport
//!
//! Slot-based shared memory for multi-process data acquisition pipelines.
//! Independent reader and writer processes exchange fixed-size binary
//! buffers through a segment divided into slots, coordinated by a per-slot
//! state machine in the segment itself instead of a kernel-mediated queue.
//!
//! ## Features
//!
//! - **CAS slot claims**: the slot semaphore and owner share one atomic word
//! - **Destructive or broadcast reads**: a slot is consumed by one reader, or
//!   seen by every attached reader before it is recycled
//! - **Addressed delivery**: a full slot may be reserved for one reader id
//! - **Crash recovery**: slots held past the stale timeout return to circulation
//! - **Claim-scoped leases**: commit/release consume the claim
//! - **Fragment and event framing**: single-fragment and multi-fragment channels
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────────────┐    ┌─────────────────┐
//! │   Writer        │    │  Shared Memory Segment   │    │   Reader 1      │
//! │                 │    │                          │    │                 │
//! │ FragmentChannel ├───►│ [Control|Slot meta|Data] ├───►│ FragmentChannel │
//! │ EventEmitter    │    │  Empty→Writing→Full→     │    │ EventChannel    │
//! └─────────────────┘    │  Reading→Empty           │    └─────────────────┘
//!                        └──────────────────────────┘    ┌─────────────────┐
//!                                      │                 │   Reader N      │
//!                                      └────────────────►│ SegmentManager  │
//!                                                        └─────────────────┘
//! ```
//!
//! ## Usage Patterns
//!
//! ### Slot Round Trip
//!
//! ```rust,no_run
//! use daq::config::SegmentConfig;
//! use daq_shared_memory::{Destination, SegmentManager};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let writer = SegmentManager::attach(SegmentConfig::new(0xBEE7_0000, 10, 0x1000))?;
//! let reader = SegmentManager::attach(SegmentConfig::attach_only(0xBEE7_0000))?;
//!
//! if let Some(mut lease) = writer.claim_for_writing(false)? {
//!     lease.write(b"temperature: 25.5")?;
//!     lease.commit(Destination::Any)?;
//! }
//!
//! if let Some(lease) = reader.claim_for_reading()? {
//!     println!("{:?}", &lease.view()?[..]);
//!     lease.release()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Fragments
//!
//! ```rust,no_run
//! use daq::config::SegmentConfig;
//! use daq::fragment::{Fragment, FragmentType};
//! use daq_shared_memory::FragmentChannel;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut channel = FragmentChannel::attach(SegmentConfig::new(0xBEE7_0001, 4, 0x10000))?;
//! let fragment = Fragment::new(1, 0, FragmentType::DATA, b"adc samples")?;
//! channel.write_fragment(&fragment, false, Duration::from_millis(100))?;
//! assert_eq!(channel.read_fragment()?, Some(fragment));
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Segment operations return `Result<T, ShmError>`. Protocol violations
//! (out-of-range slot, wrong state, wrong owner, overrun, zero increment)
//! detach the manager before returning; call
//! [`SegmentManager::reattach`] to continue:
//!
//! ```rust,no_run
//! use daq::config::SegmentConfig;
//! use daq_shared_memory::{SegmentManager, ShmError};
//!
//! # fn main() -> Result<(), ShmError> {
//! let manager = SegmentManager::attach(SegmentConfig::attach_only(0xBEE7_0000))?;
//! match manager.write(99, b"x") {
//!     Err(e) if e.is_protocol_violation() => manager.reattach()?,
//!     Err(e) => return Err(e),
//!     Ok(()) => {}
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - **SegmentManager**: thread-safe; scans are serialized by a search lock,
//!   positional I/O by per-slot locks
//! - **FragmentChannel / EventChannel**: single-threaded (`&mut self`)
//! - **EventEmitter**: thread-safe
//!
//! ## Platform Support
//!
//! Linux: segments are files under `/dev/shm`, mapped shared.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event_channel;
pub mod fragment_channel;
pub mod layout;
pub mod lease;
pub mod platform;
pub mod segment;

pub use error::{ShmError, ShmResult};
pub use event_channel::{EventChannel, EventEmitter, EventError, EventResult};
pub use fragment_channel::{ChannelError, ChannelResult, FragmentChannel};
pub use layout::SlotState;
pub use lease::{ReadLease, SlotView, WriteLease};
pub use segment::{Destination, SegmentManager, SegmentSnapshot, SlotSnapshot};

use daq::config::LogLevel;

/// Initialize tracing from `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize tracing at `level`, unless `RUST_LOG` overrides it
pub fn init_tracing_with_level(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Segment key unique to this test process.
    pub(crate) fn unique_key() -> u32 {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let pid = crate::platform::get_current_pid();
        0x5000_0000 | ((pid & 0xFFFF) << 8) | (NEXT.fetch_add(1, Ordering::Relaxed) & 0xFF)
    }
}
