//! Claim-scoped slot access.
//!
//! A lease owns one slot claim. Committing or releasing consumes it, and a
//! lease dropped without either resets its slot, so a claim cannot leak or be
//! used after it ended.

use crate::error::ShmResult;
use crate::layout::SlotState;
use crate::segment::{Destination, SegmentManager, SlotBytes};
use std::marker::PhantomData;
use std::ops::Deref;

/// A slot claimed for writing.
#[derive(Debug)]
pub struct WriteLease<'a> {
    manager: &'a SegmentManager,
    slot: usize,
    finished: bool,
}

impl WriteLease<'_> {
    /// Slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Append bytes.
    pub fn write(&mut self, data: &[u8]) -> ShmResult<()> {
        self.manager.write(self.slot, data)
    }

    /// Reserve `len` bytes without copying.
    pub fn skip(&mut self, len: usize) -> ShmResult<()> {
        self.manager.increment_write_pos(self.slot, len)
    }

    /// Discard everything written so far.
    pub fn rewind(&mut self) -> ShmResult<()> {
        self.manager.reset_write_pos(self.slot)
    }

    /// Bytes written so far.
    pub fn written(&self) -> ShmResult<usize> {
        self.manager.buffer_data_size(self.slot)
    }

    /// Room left in the slot.
    pub fn remaining(&self) -> ShmResult<usize> {
        Ok(self.manager.slot_size().saturating_sub(self.written()?))
    }

    /// Publish the slot for `destination`; returns whether it took effect.
    pub fn commit(mut self, destination: Destination) -> ShmResult<bool> {
        self.finished = true;
        self.manager.mark_buffer_full(self.slot, destination)
    }

    /// Give the slot back empty.
    pub fn abandon(mut self) -> ShmResult<bool> {
        self.finished = true;
        self.manager.reset_buffer(self.slot)
    }
}

impl Drop for WriteLease<'_> {
    fn drop(&mut self) {
        if !self.finished && self.manager.is_valid() {
            if let Err(e) = self.manager.reset_buffer(self.slot) {
                tracing::warn!("Dropping write lease on slot {}: {e}", self.slot);
            }
        }
    }
}

/// A slot claimed for reading.
#[derive(Debug)]
pub struct ReadLease<'a> {
    manager: &'a SegmentManager,
    slot: usize,
    finished: bool,
}

impl ReadLease<'_> {
    /// Slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Fill `buf`; returns whether data remains.
    pub fn read(&mut self, buf: &mut [u8]) -> ShmResult<bool> {
        self.manager.read(self.slot, buf)
    }

    /// Skip `len` bytes; returns whether data remains.
    pub fn skip(&mut self, len: usize) -> ShmResult<bool> {
        self.manager.increment_read_pos(self.slot, len)
    }

    /// Start reading from the beginning again.
    pub fn rewind(&mut self) -> ShmResult<()> {
        self.manager.reset_read_pos(self.slot)
    }

    /// Total bytes in the slot.
    pub fn len(&self) -> ShmResult<usize> {
        self.manager.buffer_data_size(self.slot)
    }

    /// Whether the slot holds no bytes.
    pub fn is_empty(&self) -> ShmResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Whether unread bytes remain.
    pub fn has_more(&self) -> ShmResult<bool> {
        self.manager.more_data_in_buffer(self.slot)
    }

    /// Whether the claim still holds (it may be lost to stale reclamation).
    pub fn is_held(&self) -> ShmResult<bool> {
        self.manager.check_buffer(self.slot, SlotState::Reading)
    }

    /// Borrow the slot's written bytes for as long as the lease lives.
    ///
    /// The read offset is not moved.
    pub fn view(&self) -> ShmResult<SlotView<'_>> {
        Ok(SlotView {
            bytes: self.manager.slot_bytes(self.slot)?,
            _lease: PhantomData,
        })
    }

    /// Finish reading and hand the slot back.
    pub fn release(mut self) -> ShmResult<()> {
        self.finished = true;
        self.manager.mark_buffer_empty(self.slot, false)
    }
}

impl Drop for ReadLease<'_> {
    fn drop(&mut self) {
        if !self.finished && self.manager.is_valid() {
            if let Err(e) = self.manager.reset_buffer(self.slot) {
                tracing::warn!("Dropping read lease on slot {}: {e}", self.slot);
            }
        }
    }
}

/// Slot contents borrowed from a [`ReadLease`].
#[derive(Debug)]
pub struct SlotView<'a> {
    bytes: SlotBytes,
    _lease: PhantomData<&'a ()>,
}

impl Deref for SlotView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

impl SegmentManager {
    /// Claim a slot for writing as a lease.
    pub fn claim_for_writing(&self, overwrite: bool) -> ShmResult<Option<WriteLease<'_>>> {
        Ok(self
            .get_buffer_for_writing(overwrite)?
            .map(|slot| WriteLease {
                manager: self,
                slot,
                finished: false,
            }))
    }

    /// Claim a slot for reading as a lease.
    pub fn claim_for_reading(&self) -> ShmResult<Option<ReadLease<'_>>> {
        Ok(self.get_buffer_for_reading()?.map(|slot| ReadLease {
            manager: self,
            slot,
            finished: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_key;
    use daq::config::SegmentConfig;

    #[test]
    fn committed_lease_is_readable() {
        let manager = SegmentManager::attach(SegmentConfig::new(unique_key(), 2, 64)).unwrap();
        let mut lease = manager.claim_for_writing(false).unwrap().unwrap();
        lease.write(b"hello ").unwrap();
        lease.write(b"world").unwrap();
        assert_eq!(lease.written().unwrap(), 11);
        assert_eq!(lease.remaining().unwrap(), 53);
        assert!(lease.commit(Destination::Any).unwrap());

        let mut lease = manager.claim_for_reading().unwrap().unwrap();
        {
            let view = lease.view().unwrap();
            assert_eq!(&view[..], b"hello world");
        }
        let mut buf = [0u8; 5];
        assert!(lease.read(&mut buf).unwrap());
        assert_eq!(&buf, b"hello");
        assert!(lease.is_held().unwrap());
        lease.release().unwrap();
        assert_eq!(manager.write_ready_count(false), 2);
    }

    #[test]
    fn dropped_write_lease_empties_slot() {
        let manager = SegmentManager::attach(SegmentConfig::new(unique_key(), 1, 64)).unwrap();
        {
            let mut lease = manager.claim_for_writing(false).unwrap().unwrap();
            lease.write(b"partial").unwrap();
        }
        assert_eq!(manager.buffer_state(0).unwrap(), SlotState::Empty);
        assert_eq!(manager.buffer_data_size(0).unwrap(), 0);
    }

    #[test]
    fn dropped_read_lease_returns_slot_to_full() {
        let manager = SegmentManager::attach(SegmentConfig::new(unique_key(), 1, 64)).unwrap();
        let mut lease = manager.claim_for_writing(false).unwrap().unwrap();
        lease.write(b"keep").unwrap();
        lease.commit(Destination::Any).unwrap();

        drop(manager.claim_for_reading().unwrap().unwrap());
        assert_eq!(manager.buffer_state(0).unwrap(), SlotState::Full);
        assert!(manager.ready_for_read());
    }

    #[test]
    fn abandon_resets_without_publishing() {
        let manager = SegmentManager::attach(SegmentConfig::new(unique_key(), 1, 64)).unwrap();
        let mut lease = manager.claim_for_writing(false).unwrap().unwrap();
        lease.skip(8).unwrap();
        assert!(lease.abandon().unwrap());
        assert!(!manager.ready_for_read());
        assert!(manager.ready_for_write(false));
    }
}
