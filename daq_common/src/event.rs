//! Event record header.
//!
//! An event occupies one slot: this header followed by zero or more packed
//! fragment records (see [`crate::fragment`]).

use crate::consts::WORD_SIZE;
use crate::fragment::FragmentError;
use static_assertions::const_assert_eq;

/// Serialized event header size in bytes.
pub const EVENT_HEADER_SIZE: usize = 32;

const_assert_eq!(EVENT_HEADER_SIZE % WORD_SIZE, 0);

/// Header at the start of every event slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    /// Run number.
    pub run_id: u32,
    /// Subrun number.
    pub subrun_id: u32,
    /// Event number within the subrun.
    pub event_id: u32,
    /// Whether every expected fragment arrived.
    pub is_complete: bool,
    /// Sequence id shared by the event's fragments.
    pub sequence_id: u64,
    /// Event timestamp.
    pub timestamp: u64,
}

impl EventHeader {
    /// Create a complete event header.
    pub fn new(run_id: u32, subrun_id: u32, event_id: u32, sequence_id: u64) -> Self {
        Self {
            run_id,
            subrun_id,
            event_id,
            is_complete: true,
            sequence_id,
            timestamp: 0,
        }
    }

    /// Serialize to the native-endian wire form.
    pub fn to_bytes(&self) -> [u8; EVENT_HEADER_SIZE] {
        let mut out = [0u8; EVENT_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.run_id.to_ne_bytes());
        out[4..8].copy_from_slice(&self.subrun_id.to_ne_bytes());
        out[8..12].copy_from_slice(&self.event_id.to_ne_bytes());
        out[12..16].copy_from_slice(&u32::from(self.is_complete).to_ne_bytes());
        out[16..24].copy_from_slice(&self.sequence_id.to_ne_bytes());
        out[24..32].copy_from_slice(&self.timestamp.to_ne_bytes());
        out
    }

    /// Decode from the first [`EVENT_HEADER_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < EVENT_HEADER_SIZE {
            return Err(FragmentError::TruncatedHeader {
                expected: EVENT_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let u32_at = |at: usize| {
            u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_ne_bytes(word)
        };

        Ok(Self {
            run_id: u32_at(0),
            subrun_id: u32_at(4),
            event_id: u32_at(8),
            is_complete: u32_at(12) != 0,
            sequence_id: u64_at(16),
            timestamp: u64_at(24),
        })
    }
}
