//! On-segment binary layout.
//!
//! ```text
//! ┌──────────────────────┬────────────────────────────┬──────────────────────────────┐
//! │ ControlBlock (128 B) │ SlotMetadata (64 B) × n    │ data: n × slot_size bytes    │
//! └──────────────────────┴────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Every shared field is an atomic so that all attached processes can read
//! and update it through a plain `&` reference into the mapping. A freshly
//! sized file is all zeros, which is a valid bit pattern for every field.

use daq::consts::{CACHE_LINE_SIZE, NO_OWNER};
use serde::Serialize;
use static_assertions::const_assert_eq;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};

/// Segment-wide shared state.
#[repr(C, align(64))]
pub struct ControlBlock {
    /// Set to `SEGMENT_READY_MAGIC` once the creator finished initialization.
    pub ready_magic: AtomicU32,
    /// `SEGMENT_LAYOUT_VERSION` of the creator.
    pub layout_version: AtomicU32,
    /// Number of slots.
    pub slot_count: AtomicU64,
    /// Bytes per slot.
    pub slot_size: AtomicU64,
    /// Stale timeout in microseconds; zero disables reclamation.
    pub stale_timeout_us: AtomicU64,
    /// Where the next reader scan starts.
    pub reader_cursor: AtomicU64,
    /// Where the next writer scan starts.
    pub writer_cursor: AtomicU64,
    /// Last sequence id handed out by `mark_buffer_full`.
    pub next_sequence_id: AtomicU64,
    /// Sequence id of the newest slot claimed by a reader.
    pub lowest_seq_id_read: AtomicU64,
    /// Non-zero for destructive reads.
    pub destructive_read: AtomicU32,
    /// Rank published by the owning process.
    pub owner_rank: AtomicI32,
    /// Next manager id to hand out (the creator is 0).
    pub next_manager_id: AtomicI32,
    /// Managers currently attached.
    pub attached_count: AtomicI32,
    /// Attached managers that have claimed a slot for writing.
    pub writer_count: AtomicI32,
    /// Non-zero once the creator has gone away.
    pub end_of_data: AtomicU32,
}

/// Per-slot shared state.
#[repr(C, align(64))]
pub struct SlotMetadata {
    /// Packed `(state, owner)`; see [`pack`].
    pub state_owner: AtomicU64,
    /// Bytes written so far.
    pub write_pos: AtomicU64,
    /// Bytes consumed by the current reader.
    pub read_pos: AtomicU64,
    /// Last time any participant touched the slot, in microseconds.
    pub last_touch_us: AtomicU64,
    /// Sequence id stamped when the slot became `Full`.
    pub sequence_id: AtomicU64,
    /// Non-destructive readers that released the current contents.
    pub release_count: AtomicU64,
}

/// Size of [`ControlBlock`] in bytes.
pub const CONTROL_BLOCK_SIZE: usize = core::mem::size_of::<ControlBlock>();

/// Size of [`SlotMetadata`] in bytes.
pub const SLOT_METADATA_SIZE: usize = core::mem::size_of::<SlotMetadata>();

const_assert_eq!(CONTROL_BLOCK_SIZE, 2 * CACHE_LINE_SIZE);
const_assert_eq!(SLOT_METADATA_SIZE, CACHE_LINE_SIZE);
const_assert_eq!(core::mem::align_of::<ControlBlock>(), CACHE_LINE_SIZE);

/// Offset of slot `slot`'s metadata record.
pub const fn metadata_offset(slot: usize) -> usize {
    CONTROL_BLOCK_SIZE + slot * SLOT_METADATA_SIZE
}

/// Offset of the first data byte of slot `slot`.
pub const fn data_offset(slot_count: usize, slot_size: usize, slot: usize) -> usize {
    metadata_offset(slot_count) + slot * slot_size
}

/// Total mapping size for a segment, or `None` on overflow.
pub fn segment_size(slot_count: usize, slot_size: usize) -> Option<usize> {
    slot_count
        .checked_mul(SLOT_METADATA_SIZE)?
        .checked_add(CONTROL_BLOCK_SIZE)?
        .checked_add(slot_count.checked_mul(slot_size)?)
}

/// Slot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum SlotState {
    /// Free for a writer.
    Empty = 0,
    /// Claimed by a writer.
    Writing = 1,
    /// Holds a complete record.
    Full = 2,
    /// Claimed by a reader.
    Reading = 3,
}

impl SlotState {
    /// Decode a raw semaphore value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Writing),
            2 => Some(Self::Full),
            3 => Some(Self::Reading),
            _ => None,
        }
    }

    /// State name for messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Writing => "Writing",
            Self::Full => "Full",
            Self::Reading => "Reading",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pack a state and owner id into one CAS-able word.
pub const fn pack(state: SlotState, owner: i32) -> u64 {
    ((state as u64) << 32) | (owner as u32 as u64)
}

/// Split a packed word back into state and owner.
///
/// Unknown semaphore values read as `Writing`, so that only staleness
/// reclamation or an overwriting writer will touch the slot.
pub const fn unpack(word: u64) -> (SlotState, i32) {
    let state = match SlotState::from_raw((word >> 32) as u32) {
        Some(state) => state,
        None => SlotState::Writing,
    };
    (state, word as u32 as i32)
}

/// Packed word of a slot nobody holds.
pub const EMPTY_UNOWNED: u64 = pack(SlotState::Empty, NO_OWNER);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_keeps_negative_owner() {
        let word = pack(SlotState::Full, NO_OWNER);
        assert_eq!(unpack(word), (SlotState::Full, -1));
        assert_eq!(unpack(pack(SlotState::Reading, 7)), (SlotState::Reading, 7));
        assert_eq!(unpack(EMPTY_UNOWNED), (SlotState::Empty, NO_OWNER));
    }

    #[test]
    fn unknown_state_reads_as_writing() {
        let word = (9u64 << 32) | 3;
        assert_eq!(unpack(word), (SlotState::Writing, 3));
    }

    #[test]
    fn offsets_follow_layout() {
        assert_eq!(metadata_offset(0), 128);
        assert_eq!(metadata_offset(2), 256);
        assert_eq!(data_offset(10, 4096, 0), 128 + 640);
        assert_eq!(data_offset(10, 4096, 3), 128 + 640 + 3 * 4096);
        assert_eq!(segment_size(10, 4096), Some(128 + 640 + 40960));
        assert_eq!(segment_size(usize::MAX, 2), None);
    }
}
