//! Transport constants.
//!
//! These constants define the fundamental parameters of the shared-memory
//! transport. They are the single source of truth - all other crates import
//! from here.

/// Marker written last by the creating process once the segment is usable.
pub const SEGMENT_READY_MAGIC: u32 = 0xCAFE_1111;

/// Version of the on-segment binary layout.
///
/// Bumped whenever the control block or slot metadata layout changes, so an
/// attacher built against another layout fails instead of misreading bytes.
pub const SEGMENT_LAYOUT_VERSION: u32 = 1;

/// Prefix of the shared-memory object backing a segment key.
pub const SEGMENT_NAME_PREFIX: &str = "daq_shm_";

/// Directory holding POSIX shared-memory objects.
pub const SHM_DIR: &str = "/dev/shm";

/// Owner id meaning "unowned / open to any reader".
pub const NO_OWNER: i32 = -1;

/// Manager id of the process that created the segment.
pub const CREATOR_MANAGER_ID: i32 = 0;

/// Default slot stale timeout: 100 seconds.
pub const DEFAULT_STALE_TIMEOUT_US: u64 = 100_000_000;

/// Overall budget for attaching to a segment created by another process.
pub const ATTACH_TIMEOUT_US: u64 = 1_000_000;

/// Sleep between attach attempts.
pub const ATTACH_RETRY_INTERVAL_US: u64 = 10_000;

/// Number of rescans a reader performs when it loses a claim race.
pub const CLAIM_RETRIES: usize = 5;

/// Smallest sleep of a polling loop.
pub const MIN_POLL_SLEEP_US: u64 = 10;

/// Largest sleep of a polling loop.
pub const MAX_POLL_SLEEP_US: u64 = 5_000_000;

/// CPU cache line size in bytes.
///
/// Used for memory alignment to prevent false sharing between processes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of one payload word in bytes.
pub const WORD_SIZE: usize = core::mem::size_of::<u64>();

/// Default interval between statistics flushes.
pub const DEFAULT_STATISTICS_INTERVAL_SECS: f64 = 1.0;

/// Compute the next sleep of a poll loop from the time already waited.
///
/// The sleep grows with the elapsed wait (one tenth of it), bounded below by
/// [`MIN_POLL_SLEEP_US`], above by [`MAX_POLL_SLEEP_US`], and never runs past
/// `remaining_us`.
pub fn poll_backoff_us(elapsed_us: u64, remaining_us: u64) -> u64 {
    (elapsed_us / 10)
        .clamp(MIN_POLL_SLEEP_US, MAX_POLL_SLEEP_US)
        .min(remaining_us)
}
