//! Slot-based shared memory segment manager.
//!
//! A segment is a control block, one metadata record per slot and a data
//! region of equal-size slots (see [`crate::layout`]). Every slot moves
//! through a four-state cycle:
//!
//! ```text
//!          claim (writer)        mark full           claim (reader)
//!  Empty ────────────────► Writing ─────────► Full ────────────────► Reading
//!    ▲                        │                 ▲                      │
//!    │       stale reset      │                 │  stale reset /       │
//!    └────────────────────────┘                 │  broadcast release   │
//!    ▲                                          └──────────────────────┤
//!    └─────────────────────────── mark empty ──────────────────────────┘
//! ```
//!
//! The semaphore and the owning manager id share one 64-bit word, so every
//! claim is a single compare-and-swap. Positional I/O within a claimed slot
//! is serialized locally by a per-slot mutex.
//!
//! Any protocol violation (bad index, wrong state or owner, overrun, zero
//! increment) detaches the manager before the error is returned. The caller
//! is expected to [`SegmentManager::reattach`].

use crate::error::{ShmError, ShmResult};
use crate::layout::{
    ControlBlock, EMPTY_UNOWNED, SlotMetadata, SlotState, data_offset, metadata_offset, pack,
    segment_size, unpack,
};
use crate::platform;
use daq::config::SegmentConfig;
use daq::consts::{
    ATTACH_RETRY_INTERVAL_US, ATTACH_TIMEOUT_US, CLAIM_RETRIES, CREATOR_MANAGER_ID, NO_OWNER,
    SEGMENT_LAYOUT_VERSION, SEGMENT_READY_MAGIC,
};
use daq::time::{TimeProvider, default_clock};
use memmap2::MmapMut;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Who may read a slot marked full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// Any reader.
    #[default]
    Any,
    /// Only the manager with this id.
    Manager(i32),
}

impl Destination {
    /// Owner id stored in the slot.
    pub const fn owner_id(self) -> i32 {
        match self {
            Self::Any => NO_OWNER,
            Self::Manager(id) => id,
        }
    }
}

/// State of one slot at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    /// Slot index.
    pub index: usize,
    /// Semaphore.
    pub state: SlotState,
    /// Owning manager id, -1 if none.
    pub owner: i32,
    /// Write offset.
    pub write_pos: u64,
    /// Read offset.
    pub read_pos: u64,
    /// Sequence id of the current contents.
    pub sequence_id: u64,
    /// Broadcast releases of the current contents.
    pub release_count: u64,
    /// Last touch in microseconds.
    pub last_touch_us: u64,
}

/// Point-in-time view of a whole segment, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentSnapshot {
    /// Segment key.
    pub key: u32,
    /// Id of the manager that took the snapshot.
    pub manager_id: i32,
    /// Number of slots.
    pub slot_count: usize,
    /// Bytes per slot.
    pub slot_size: usize,
    /// Destructive-read mode.
    pub destructive_read: bool,
    /// Attached managers.
    pub attached_count: i32,
    /// Registered writers.
    pub writer_count: i32,
    /// Last sequence id handed out.
    pub last_sequence_id: u64,
    /// Newest sequence id claimed by a reader.
    pub lowest_seq_id_read: u64,
    /// Creator has gone away.
    pub end_of_data: bool,
    /// Per-slot state.
    pub slots: Vec<SlotSnapshot>,
}

/// One live mapping of a segment.
struct Attachment {
    _map: MmapMut,
    base: NonNull<u8>,
    manager_id: i32,
    slot_count: usize,
    slot_size: usize,
    stale_timeout_us: u64,
    destructive: bool,
    slot_locks: Box<[Mutex<()>]>,
}

// SAFETY: `base` points into `_map`, which lives as long as the attachment.
// Shared fields are only accessed through atomics; slot data is accessed
// under the per-slot locks by the manager owning the slot.
unsafe impl Send for Attachment {}
unsafe impl Sync for Attachment {}

impl Attachment {
    fn new(mut map: MmapMut, manager_id: i32) -> ShmResult<Self> {
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| ShmError::LogicError("segment mapped at null".to_string()))?;
        // SAFETY: callers only pass mappings holding at least a control block.
        let control = unsafe { &*(base.as_ptr() as *const ControlBlock) };
        let slot_count = control.slot_count.load(Ordering::Acquire) as usize;
        let slot_size = control.slot_size.load(Ordering::Acquire) as usize;
        let stale_timeout_us = control.stale_timeout_us.load(Ordering::Acquire);
        let destructive = control.destructive_read.load(Ordering::Acquire) != 0;

        Ok(Self {
            _map: map,
            base,
            manager_id,
            slot_count,
            slot_size,
            stale_timeout_us,
            destructive,
            slot_locks: (0..slot_count).map(|_| Mutex::new(())).collect(),
        })
    }

    fn control(&self) -> &ControlBlock {
        // SAFETY: every mapping is at least CONTROL_BLOCK_SIZE bytes and
        // page-aligned; all fields are atomics valid for any bit pattern.
        unsafe { &*(self.base.as_ptr() as *const ControlBlock) }
    }

    fn meta(&self, slot: usize) -> &SlotMetadata {
        debug_assert!(slot < self.slot_count);
        // SAFETY: the mapping covers segment_size(slot_count, slot_size),
        // checked at attach time, and slot < slot_count.
        unsafe { &*(self.base.as_ptr().add(metadata_offset(slot)) as *const SlotMetadata) }
    }

    fn data_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.slot_count);
        // SAFETY: in bounds for the same reason as `meta`.
        unsafe {
            self.base
                .as_ptr()
                .add(data_offset(self.slot_count, self.slot_size, slot))
        }
    }

    fn check_index(&self, slot: usize) -> ShmResult<()> {
        if slot >= self.slot_count {
            return Err(ShmError::ArgumentOutOfRange {
                slot,
                slot_count: self.slot_count,
            });
        }
        Ok(())
    }

    fn lock_slot(&self, slot: usize) -> MutexGuard<'_, ()> {
        self.slot_locks[slot].lock()
    }

    /// Require `slot` to be in `expected` and owned by this manager.
    fn expect_claim(&self, slot: usize, expected: SlotState) -> ShmResult<&SlotMetadata> {
        let meta = self.meta(slot);
        let (state, owner) = unpack(meta.state_owner.load(Ordering::Acquire));
        if state != expected {
            return Err(ShmError::StateAccessViolation {
                slot,
                expected: expected.name(),
                actual: state.name(),
            });
        }
        if owner != self.manager_id {
            return Err(ShmError::OwnerAccessViolation {
                slot,
                owner,
                manager: self.manager_id,
            });
        }
        Ok(meta)
    }

    fn readers(&self) -> u64 {
        let control = self.control();
        let attached = control.attached_count.load(Ordering::Acquire);
        let writers = control.writer_count.load(Ordering::Acquire);
        (attached - writers).max(1) as u64
    }
}

/// Written bytes of one slot; keeps the mapping alive while held.
pub(crate) struct SlotBytes {
    _attachment: Arc<Attachment>,
    ptr: *const u8,
    len: usize,
}

impl SlotBytes {
    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len lies in the slot's data region (len is a
        // write offset, at most slot_size) of the mapping held by `_attachment`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl std::fmt::Debug for SlotBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotBytes").field("len", &self.len).finish()
    }
}

/// Handle on one shared memory segment.
///
/// Thread-safe: scans are serialized by a search lock and positional I/O by
/// per-slot locks.
pub struct SegmentManager {
    config: SegmentConfig,
    clock: Arc<dyn TimeProvider>,
    attachment: RwLock<Option<Arc<Attachment>>>,
    search_lock: Mutex<()>,
    created: AtomicBool,
    registered_writer: AtomicBool,
    last_seen_sequence: AtomicU64,
}

impl SegmentManager {
    /// Attach to the segment described by `config`, creating it if allowed.
    pub fn attach(config: SegmentConfig) -> ShmResult<Self> {
        Self::attach_with_clock(config, default_clock())
    }

    /// Attach using `clock` for slot timestamps.
    pub fn attach_with_clock(
        config: SegmentConfig,
        clock: Arc<dyn TimeProvider>,
    ) -> ShmResult<Self> {
        let manager = Self {
            config,
            clock,
            attachment: RwLock::new(None),
            search_lock: Mutex::new(()),
            created: AtomicBool::new(false),
            registered_writer: AtomicBool::new(false),
            last_seen_sequence: AtomicU64::new(0),
        };
        manager.connect()?;
        Ok(manager)
    }

    /// Detach (if attached) and attach again.
    ///
    /// A failed reattach leaves the manager invalid.
    pub fn reattach(&self) -> ShmResult<()> {
        self.shutdown(false);
        self.last_seen_sequence.store(0, Ordering::Release);
        self.connect()
    }

    fn connect(&self) -> ShmResult<()> {
        self.config.validate()?;
        let key = self.config.key;
        let path = platform::segment_path(key);
        let deadline = Instant::now() + Duration::from_micros(ATTACH_TIMEOUT_US);

        loop {
            if let Some(map) = platform::attach_segment_mmap(&path)? {
                if let Some(attachment) = self.join(map)? {
                    *self.attachment.write() = Some(Arc::new(attachment));
                    return Ok(());
                }
            } else if self.config.may_create() {
                let size = segment_size(self.config.slot_count, self.config.slot_size)
                    .ok_or_else(|| ShmError::LogicError("segment size overflows".to_string()))?;
                if let Some(map) = platform::create_segment_mmap(&path, size)? {
                    let attachment = self.initialize(map)?;
                    self.created.store(true, Ordering::Release);
                    *self.attachment.write() = Some(Arc::new(attachment));
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!("Segment {key:#010x} not ready after {ATTACH_TIMEOUT_US} us");
                return Err(ShmError::AttachTimeout { key });
            }
            std::thread::sleep(Duration::from_micros(ATTACH_RETRY_INTERVAL_US));
        }
    }

    /// Lay out a freshly created segment and publish it.
    fn initialize(&self, map: MmapMut) -> ShmResult<Attachment> {
        let config = &self.config;
        let now = self.clock.now_us();

        // SAFETY: the fresh mapping is zero-filled and sized for the layout.
        let control = unsafe { &*(map.as_ptr() as *const ControlBlock) };
        control
            .slot_count
            .store(config.slot_count as u64, Ordering::Relaxed);
        control
            .slot_size
            .store(config.slot_size as u64, Ordering::Relaxed);
        control
            .stale_timeout_us
            .store(config.stale_timeout_us, Ordering::Relaxed);
        control
            .destructive_read
            .store(u32::from(config.destructive_read), Ordering::Relaxed);
        control.owner_rank.store(config.rank, Ordering::Relaxed);
        control
            .next_manager_id
            .store(CREATOR_MANAGER_ID + 1, Ordering::Relaxed);
        control.attached_count.store(1, Ordering::Relaxed);

        let attachment = Attachment::new(map, CREATOR_MANAGER_ID)?;
        for slot in 0..attachment.slot_count {
            let meta = attachment.meta(slot);
            meta.state_owner.store(EMPTY_UNOWNED, Ordering::Relaxed);
            meta.last_touch_us.store(now, Ordering::Relaxed);
        }

        let control = attachment.control();
        control
            .layout_version
            .store(SEGMENT_LAYOUT_VERSION, Ordering::Relaxed);
        control
            .ready_magic
            .store(SEGMENT_READY_MAGIC, Ordering::Release);

        tracing::info!(
            "Created segment {:#010x}: {} slots x {} bytes ({})",
            config.key,
            config.slot_count,
            config.slot_size,
            if config.destructive_read {
                "destructive"
            } else {
                "broadcast"
            }
        );
        Ok(attachment)
    }

    /// Join an existing segment; `Ok(None)` while it is not ready yet.
    fn join(&self, map: MmapMut) -> ShmResult<Option<Attachment>> {
        let key = self.config.key;
        // SAFETY: the platform layer only returns mappings of at least
        // CONTROL_BLOCK_SIZE bytes.
        let control = unsafe { &*(map.as_ptr() as *const ControlBlock) };
        if control.ready_magic.load(Ordering::Acquire) != SEGMENT_READY_MAGIC {
            return Ok(None);
        }

        let found = control.layout_version.load(Ordering::Acquire);
        if found != SEGMENT_LAYOUT_VERSION {
            return Err(ShmError::IncompatibleVersion {
                key,
                found,
                expected: SEGMENT_LAYOUT_VERSION,
            });
        }

        let slot_count = control.slot_count.load(Ordering::Acquire) as usize;
        let slot_size = control.slot_size.load(Ordering::Acquire) as usize;
        match segment_size(slot_count, slot_size) {
            Some(size) if size <= map.len() => {}
            _ => return Ok(None),
        }

        if self.config.may_create()
            && (self.config.slot_count != slot_count || self.config.slot_size != slot_size)
        {
            tracing::warn!(
                "Segment {key:#010x} has {slot_count} x {slot_size} bytes, requested {} x {}",
                self.config.slot_count,
                self.config.slot_size
            );
        }

        let manager_id = control.next_manager_id.fetch_add(1, Ordering::AcqRel);
        control.attached_count.fetch_add(1, Ordering::AcqRel);
        let attachment = Attachment::new(map, manager_id)?;
        tracing::debug!("Attached to segment {key:#010x} as manager {manager_id}");
        Ok(Some(attachment))
    }

    fn current(&self) -> ShmResult<Arc<Attachment>> {
        self.attachment
            .read()
            .as_ref()
            .cloned()
            .ok_or(ShmError::NotAttached)
    }

    /// Run `op` against the live attachment; protocol violations detach.
    fn guarded<T>(&self, op: impl FnOnce(&Attachment) -> ShmResult<T>) -> ShmResult<T> {
        let attachment = self.current()?;
        let result = op(attachment.as_ref());
        if let Err(e) = &result {
            if e.is_protocol_violation() {
                tracing::error!(
                    "Segment {:#010x} manager {}: {} ({}), detaching",
                    self.config.key,
                    attachment.manager_id,
                    e,
                    e.category()
                );
                drop(attachment);
                self.shutdown(false);
            }
        }
        result
    }

    fn touch(&self, meta: &SlotMetadata) {
        meta.last_touch_us
            .store(self.clock.now_us(), Ordering::Release);
    }

    fn is_stale(&self, attachment: &Attachment, meta: &SlotMetadata) -> bool {
        let timeout = attachment.stale_timeout_us;
        if timeout == 0 {
            return false;
        }
        let touched = meta.last_touch_us.load(Ordering::Acquire);
        self.clock.now_us().saturating_sub(touched) > timeout
    }

    /// Return a held slot to circulation.
    ///
    /// Slots owned by another manager are only reset once stale, and only
    /// stale slots are reset at all unless `owner_may_reset` is set.
    fn reclaim(&self, attachment: &Attachment, slot: usize, owner_may_reset: bool) -> bool {
        let meta = attachment.meta(slot);
        let word = meta.state_owner.load(Ordering::Acquire);
        let (state, owner) = unpack(word);
        let stale = self.is_stale(attachment, meta);
        let own = owner_may_reset && owner == attachment.manager_id;
        if !own && !stale {
            return false;
        }

        let target = match state {
            SlotState::Reading => pack(SlotState::Full, NO_OWNER),
            SlotState::Writing => EMPTY_UNOWNED,
            SlotState::Full if stale && !attachment.destructive => EMPTY_UNOWNED,
            _ => return false,
        };
        if meta
            .state_owner
            .compare_exchange(word, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match state {
            SlotState::Reading => meta.read_pos.store(0, Ordering::Release),
            _ => {
                meta.write_pos.store(0, Ordering::Release);
                meta.read_pos.store(0, Ordering::Release);
                meta.release_count.store(0, Ordering::Release);
            }
        }
        self.touch(meta);

        if stale && !own {
            tracing::warn!(
                "Segment {:#010x}: reclaimed stale slot {slot} ({state} held by manager {owner})",
                self.config.key
            );
        }
        true
    }

    /// Claim a slot for writing.
    ///
    /// Takes the first `Empty` slot from the writer cursor on, or with
    /// `overwrite` the first slot not currently being written.
    pub fn get_buffer_for_writing(&self, overwrite: bool) -> ShmResult<Option<usize>> {
        self.guarded(|att| {
            let _search = self.search_lock.lock();
            let control = att.control();
            let n = att.slot_count;
            if n == 0 {
                return Ok(None);
            }
            let start = control.writer_cursor.load(Ordering::Acquire) as usize % n;
            let claimed = pack(SlotState::Writing, att.manager_id);

            for offset in 0..n {
                let slot = (start + offset) % n;
                self.reclaim(att, slot, false);

                let meta = att.meta(slot);
                let word = meta.state_owner.load(Ordering::Acquire);
                let (state, _) = unpack(word);
                let eligible =
                    state == SlotState::Empty || (overwrite && state != SlotState::Writing);
                if !eligible {
                    continue;
                }
                if meta
                    .state_owner
                    .compare_exchange(word, claimed, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }

                meta.write_pos.store(0, Ordering::Release);
                meta.read_pos.store(0, Ordering::Release);
                meta.release_count.store(0, Ordering::Release);
                self.touch(meta);
                control
                    .writer_cursor
                    .store(((slot + 1) % n) as u64, Ordering::Release);
                if !self.registered_writer.swap(true, Ordering::AcqRel) {
                    control.writer_count.fetch_add(1, Ordering::AcqRel);
                }
                if state != SlotState::Empty {
                    tracing::debug!("Overwriting slot {slot} ({state})");
                }
                return Ok(Some(slot));
            }
            Ok(None)
        })
    }

    /// Claim the readable slot with the lowest sequence id.
    pub fn get_buffer_for_reading(&self) -> ShmResult<Option<usize>> {
        self.guarded(|att| {
            let _search = self.search_lock.lock();
            let control = att.control();
            let n = att.slot_count;
            if n == 0 {
                return Ok(None);
            }
            let me = att.manager_id;

            for _ in 0..CLAIM_RETRIES {
                let start = control.reader_cursor.load(Ordering::Acquire) as usize % n;
                let mut best: Option<(usize, u64, u64)> = None;
                for offset in 0..n {
                    let slot = (start + offset) % n;
                    self.reclaim(att, slot, false);
                    if let Some((sequence_id, word)) = self.readable(att, slot) {
                        if best.is_none_or(|(_, lowest, _)| sequence_id < lowest) {
                            best = Some((slot, sequence_id, word));
                        }
                    }
                }

                let Some((slot, sequence_id, word)) = best else {
                    return Ok(None);
                };
                let meta = att.meta(slot);
                if meta
                    .state_owner
                    .compare_exchange(
                        word,
                        pack(SlotState::Reading, me),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    continue;
                }

                meta.read_pos.store(0, Ordering::Release);
                self.touch(meta);
                if att.destructive {
                    control
                        .reader_cursor
                        .store(((slot + 1) % n) as u64, Ordering::Release);
                } else {
                    self.last_seen_sequence
                        .fetch_max(sequence_id, Ordering::AcqRel);
                }
                control
                    .lowest_seq_id_read
                    .fetch_max(sequence_id, Ordering::AcqRel);
                return Ok(Some(slot));
            }
            Ok(None)
        })
    }

    /// `(sequence id, packed word)` of a slot this manager may read.
    fn readable(&self, att: &Attachment, slot: usize) -> Option<(u64, u64)> {
        let meta = att.meta(slot);
        let word = meta.state_owner.load(Ordering::Acquire);
        let (state, owner) = unpack(word);
        if state != SlotState::Full || (owner != NO_OWNER && owner != att.manager_id) {
            return None;
        }
        let sequence_id = meta.sequence_id.load(Ordering::Acquire);
        if !att.destructive && sequence_id <= self.last_seen_sequence.load(Ordering::Acquire) {
            return None;
        }
        Some((sequence_id, word))
    }

    fn writable(att: &Attachment, slot: usize, overwrite: bool) -> bool {
        let (state, _) = unpack(att.meta(slot).state_owner.load(Ordering::Acquire));
        state == SlotState::Empty || (overwrite && state != SlotState::Writing)
    }

    /// Reset a held slot: always for the owner, otherwise only once stale.
    ///
    /// `Reading` slots go back to `Full`, `Writing` slots to `Empty`.
    /// Returns whether the slot changed.
    pub fn reset_buffer(&self, slot: usize) -> ShmResult<bool> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let _slot = att.lock_slot(slot);
            Ok(self.reclaim(att, slot, true))
        })
    }

    /// Append `data` at the slot's write offset.
    pub fn write(&self, slot: usize, data: &[u8]) -> ShmResult<()> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let _slot = att.lock_slot(slot);
            let meta = att.expect_claim(slot, SlotState::Writing)?;
            let offset = meta.write_pos.load(Ordering::Acquire) as usize;
            if offset + data.len() > att.slot_size {
                return Err(ShmError::SharedMemoryWrite {
                    slot,
                    offset,
                    len: data.len(),
                    capacity: att.slot_size,
                });
            }
            // SAFETY: offset + len is within the slot, and this manager
            // holds the slot in `Writing` under its local slot lock.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    att.data_ptr(slot).add(offset),
                    data.len(),
                );
            }
            meta.write_pos
                .store((offset + data.len()) as u64, Ordering::Release);
            self.touch(meta);
            Ok(())
        })
    }

    /// Fill `buf` from the slot's read offset; returns whether data remains.
    pub fn read(&self, slot: usize, buf: &mut [u8]) -> ShmResult<bool> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let _slot = att.lock_slot(slot);
            let meta = att.expect_claim(slot, SlotState::Reading)?;
            let offset = meta.read_pos.load(Ordering::Acquire) as usize;
            let end = meta.write_pos.load(Ordering::Acquire) as usize;
            let available = end.saturating_sub(offset);
            if buf.len() > available {
                return Err(ShmError::SharedMemoryRead {
                    slot,
                    offset,
                    len: buf.len(),
                    available,
                });
            }
            // SAFETY: offset + len <= write_pos <= slot_size, and this
            // manager holds the slot in `Reading`.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    att.data_ptr(slot).add(offset),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
            meta.read_pos
                .store((offset + buf.len()) as u64, Ordering::Release);
            self.touch(meta);
            Ok(offset + buf.len() < end)
        })
    }

    /// Map the written bytes of a slot this manager holds for reading.
    pub(crate) fn slot_bytes(&self, slot: usize) -> ShmResult<SlotBytes> {
        let len = self.guarded(|att| {
            att.check_index(slot)?;
            let meta = att.expect_claim(slot, SlotState::Reading)?;
            Ok(meta.write_pos.load(Ordering::Acquire) as usize)
        })?;
        let attachment = self.current()?;
        let ptr = attachment.data_ptr(slot) as *const u8;
        Ok(SlotBytes {
            _attachment: attachment,
            ptr,
            len,
        })
    }

    /// Whether unread bytes remain in the slot.
    pub fn more_data_in_buffer(&self, slot: usize) -> ShmResult<bool> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let meta = att.meta(slot);
            Ok(meta.read_pos.load(Ordering::Acquire) < meta.write_pos.load(Ordering::Acquire))
        })
    }

    /// Skip `len` unread bytes; returns whether data remains.
    pub fn increment_read_pos(&self, slot: usize, len: usize) -> ShmResult<bool> {
        self.guarded(|att| {
            att.check_index(slot)?;
            if len == 0 {
                return Err(ShmError::LogicError(format!(
                    "zero-length read increment on slot {slot}"
                )));
            }
            let _slot = att.lock_slot(slot);
            let meta = att.expect_claim(slot, SlotState::Reading)?;
            let offset = meta.read_pos.load(Ordering::Acquire) as usize;
            let end = meta.write_pos.load(Ordering::Acquire) as usize;
            let available = end.saturating_sub(offset);
            if len > available {
                return Err(ShmError::SharedMemoryRead {
                    slot,
                    offset,
                    len,
                    available,
                });
            }
            meta.read_pos.store((offset + len) as u64, Ordering::Release);
            self.touch(meta);
            Ok(offset + len < end)
        })
    }

    /// Reserve `len` bytes without copying.
    pub fn increment_write_pos(&self, slot: usize, len: usize) -> ShmResult<()> {
        self.guarded(|att| {
            att.check_index(slot)?;
            if len == 0 {
                return Err(ShmError::LogicError(format!(
                    "zero-length write increment on slot {slot}"
                )));
            }
            let _slot = att.lock_slot(slot);
            let meta = att.expect_claim(slot, SlotState::Writing)?;
            let offset = meta.write_pos.load(Ordering::Acquire) as usize;
            if offset + len > att.slot_size {
                return Err(ShmError::SharedMemoryWrite {
                    slot,
                    offset,
                    len,
                    capacity: att.slot_size,
                });
            }
            meta.write_pos.store((offset + len) as u64, Ordering::Release);
            self.touch(meta);
            Ok(())
        })
    }

    /// Rewind the read offset of a slot held for reading.
    pub fn reset_read_pos(&self, slot: usize) -> ShmResult<()> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let _slot = att.lock_slot(slot);
            let meta = att.expect_claim(slot, SlotState::Reading)?;
            meta.read_pos.store(0, Ordering::Release);
            self.touch(meta);
            Ok(())
        })
    }

    /// Rewind the write offset of a slot held for writing.
    pub fn reset_write_pos(&self, slot: usize) -> ShmResult<()> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let _slot = att.lock_slot(slot);
            let meta = att.expect_claim(slot, SlotState::Writing)?;
            meta.write_pos.store(0, Ordering::Release);
            self.touch(meta);
            Ok(())
        })
    }

    /// Whether `slot` is in `state` and held by this manager (or unowned,
    /// for `Full` and `Empty`).
    pub fn check_buffer(&self, slot: usize, state: SlotState) -> ShmResult<bool> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let meta = att.meta(slot);
            let (current, owner) = unpack(meta.state_owner.load(Ordering::Acquire));
            let owned = owner == att.manager_id
                || (owner == NO_OWNER && matches!(current, SlotState::Full | SlotState::Empty));
            let ok = current == state && owned;
            if ok {
                self.touch(meta);
            }
            Ok(ok)
        })
    }

    /// Bytes written into the slot.
    pub fn buffer_data_size(&self, slot: usize) -> ShmResult<usize> {
        self.guarded(|att| {
            att.check_index(slot)?;
            Ok(att.meta(slot).write_pos.load(Ordering::Acquire) as usize)
        })
    }

    /// Current state of the slot.
    pub fn buffer_state(&self, slot: usize) -> ShmResult<SlotState> {
        self.guarded(|att| {
            att.check_index(slot)?;
            Ok(unpack(att.meta(slot).state_owner.load(Ordering::Acquire)).0)
        })
    }

    /// Publish a slot this manager holds as `Full` for `destination`.
    ///
    /// Returns `Ok(false)` without touching the slot if this manager does
    /// not hold it for writing.
    pub fn mark_buffer_full(&self, slot: usize, destination: Destination) -> ShmResult<bool> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let _slot = att.lock_slot(slot);
            let meta = att.meta(slot);
            let word = meta.state_owner.load(Ordering::Acquire);
            if word != pack(SlotState::Writing, att.manager_id) {
                let (state, owner) = unpack(word);
                tracing::debug!(
                    "Manager {} cannot mark slot {slot} full: {state} held by {owner}",
                    att.manager_id
                );
                return Ok(false);
            }

            let sequence_id = att
                .control()
                .next_sequence_id
                .fetch_add(1, Ordering::AcqRel)
                + 1;
            meta.sequence_id.store(sequence_id, Ordering::Release);
            meta.read_pos.store(0, Ordering::Release);
            meta.release_count.store(0, Ordering::Release);
            self.touch(meta);

            let full = pack(SlotState::Full, destination.owner_id());
            if let Err(current) =
                meta.state_owner
                    .compare_exchange(word, full, Ordering::AcqRel, Ordering::Acquire)
            {
                let (state, owner) = unpack(current);
                tracing::warn!(
                    "Manager {} lost slot {slot} before publishing it: now {state} held by {owner}",
                    att.manager_id
                );
                return Ok(false);
            }
            Ok(true)
        })
    }

    /// Finish reading a slot.
    ///
    /// Destructive segments (or `force`) empty the slot. Broadcast segments
    /// count the release and empty the slot once every reader released it.
    /// `force` is reserved to the creator and the slot's owner.
    pub fn mark_buffer_empty(&self, slot: usize, force: bool) -> ShmResult<()> {
        self.guarded(|att| {
            att.check_index(slot)?;
            let _slot = att.lock_slot(slot);
            let meta = att.meta(slot);
            let word = meta.state_owner.load(Ordering::Acquire);
            let (state, owner) = unpack(word);

            if force {
                if att.manager_id != CREATOR_MANAGER_ID && owner != att.manager_id {
                    return Err(ShmError::OwnerAccessViolation {
                        slot,
                        owner,
                        manager: att.manager_id,
                    });
                }
            } else {
                att.expect_claim(slot, SlotState::Reading)?;
            }

            let target = if att.destructive || force {
                EMPTY_UNOWNED
            } else {
                let releases = meta.release_count.fetch_add(1, Ordering::AcqRel) + 1;
                if releases >= att.readers() {
                    EMPTY_UNOWNED
                } else {
                    pack(SlotState::Full, NO_OWNER)
                }
            };

            meta.read_pos.store(0, Ordering::Release);
            if target == EMPTY_UNOWNED {
                meta.write_pos.store(0, Ordering::Release);
                meta.release_count.store(0, Ordering::Release);
            }
            self.touch(meta);

            if meta
                .state_owner
                .compare_exchange(word, target, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                let (actual, _) = unpack(meta.state_owner.load(Ordering::Acquire));
                return Err(ShmError::StateAccessViolation {
                    slot,
                    expected: state.name(),
                    actual: actual.name(),
                });
            }
            Ok(())
        })
    }

    /// Whether a slot is ready for this manager to read.
    pub fn ready_for_read(&self) -> bool {
        self.read_ready_count() > 0
    }

    /// Number of slots ready for this manager to read.
    pub fn read_ready_count(&self) -> usize {
        self.current().map_or(0, |att| {
            (0..att.slot_count)
                .filter(|&slot| self.readable(&att, slot).is_some())
                .count()
        })
    }

    /// Whether a slot could be claimed for writing.
    pub fn ready_for_write(&self, overwrite: bool) -> bool {
        self.write_ready_count(overwrite) > 0
    }

    /// Number of slots that could be claimed for writing.
    pub fn write_ready_count(&self, overwrite: bool) -> usize {
        self.current().map_or(0, |att| {
            (0..att.slot_count)
                .filter(|&slot| Self::writable(&att, slot, overwrite))
                .count()
        })
    }

    /// Slots whose owner is this manager.
    pub fn buffers_owned_by_manager(&self) -> Vec<usize> {
        self.current().map_or_else(
            |_| Vec::new(),
            |att| {
                (0..att.slot_count)
                    .filter(|&slot| {
                        let (_, owner) = unpack(att.meta(slot).state_owner.load(Ordering::Acquire));
                        owner == att.manager_id
                    })
                    .collect()
            },
        )
    }

    /// Managers attached to the segment.
    pub fn attached_count(&self) -> usize {
        self.current().map_or(0, |att| {
            att.control().attached_count.load(Ordering::Acquire).max(0) as usize
        })
    }

    /// This manager's id, or -1 when detached.
    pub fn my_id(&self) -> i32 {
        self.current().map_or(NO_OWNER, |att| att.manager_id)
    }

    /// Rank published in the segment.
    pub fn rank(&self) -> Option<i32> {
        self.current()
            .ok()
            .map(|att| att.control().owner_rank.load(Ordering::Acquire))
    }

    /// Publish a rank in the segment.
    pub fn set_rank(&self, rank: i32) -> ShmResult<()> {
        let att = self.current()?;
        att.control().owner_rank.store(rank, Ordering::Release);
        Ok(())
    }

    /// Segment key.
    pub fn key(&self) -> u32 {
        self.config.key
    }

    /// Number of slots, 0 when detached.
    pub fn slot_count(&self) -> usize {
        self.current().map_or(0, |att| att.slot_count)
    }

    /// Bytes per slot, 0 when detached.
    pub fn slot_size(&self) -> usize {
        self.current().map_or(0, |att| att.slot_size)
    }

    /// Whether the segment uses destructive reads.
    pub fn is_destructive(&self) -> bool {
        self.current().map_or(true, |att| att.destructive)
    }

    /// Whether the manager is attached.
    pub fn is_valid(&self) -> bool {
        self.attachment.read().is_some()
    }

    /// Whether this manager created the segment.
    pub fn is_creator(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    /// Whether the segment's end-of-data flag is set.
    pub fn is_end_of_data(&self) -> bool {
        self.current()
            .is_ok_and(|att| att.control().end_of_data.load(Ordering::Acquire) != 0)
    }

    /// Set the end-of-data flag so readers stop waiting.
    pub fn signal_end_of_data(&self) -> ShmResult<()> {
        let att = self.current()?;
        att.control().end_of_data.store(1, Ordering::Release);
        Ok(())
    }

    /// Copy the shared state of every slot.
    pub fn snapshot(&self) -> ShmResult<SegmentSnapshot> {
        let att = self.current()?;
        let control = att.control();
        let slots = (0..att.slot_count)
            .map(|index| {
                let meta = att.meta(index);
                let (state, owner) = unpack(meta.state_owner.load(Ordering::Acquire));
                SlotSnapshot {
                    index,
                    state,
                    owner,
                    write_pos: meta.write_pos.load(Ordering::Acquire),
                    read_pos: meta.read_pos.load(Ordering::Acquire),
                    sequence_id: meta.sequence_id.load(Ordering::Acquire),
                    release_count: meta.release_count.load(Ordering::Acquire),
                    last_touch_us: meta.last_touch_us.load(Ordering::Acquire),
                }
            })
            .collect();

        Ok(SegmentSnapshot {
            key: self.config.key,
            manager_id: att.manager_id,
            slot_count: att.slot_count,
            slot_size: att.slot_size,
            destructive_read: att.destructive,
            attached_count: control.attached_count.load(Ordering::Acquire),
            writer_count: control.writer_count.load(Ordering::Acquire),
            last_sequence_id: control.next_sequence_id.load(Ordering::Acquire),
            lowest_seq_id_read: control.lowest_seq_id_read.load(Ordering::Acquire),
            end_of_data: control.end_of_data.load(Ordering::Acquire) != 0,
            slots,
        })
    }

    /// Snapshot serialized as JSON.
    pub fn snapshot_json(&self) -> ShmResult<String> {
        Ok(serde_json::to_string(&self.snapshot()?)?)
    }

    /// Release held slots and unmap; with `destroy`, a creator also
    /// flags end-of-data and unlinks the segment.
    fn shutdown(&self, destroy: bool) {
        let Some(att) = self.attachment.write().take() else {
            return;
        };
        let me = att.manager_id;
        let control = att.control();

        for slot in 0..att.slot_count {
            let meta = att.meta(slot);
            let word = meta.state_owner.load(Ordering::Acquire);
            let (state, owner) = unpack(word);
            if owner != me {
                continue;
            }
            let target = match state {
                SlotState::Writing => EMPTY_UNOWNED,
                SlotState::Reading => pack(SlotState::Full, NO_OWNER),
                _ => continue,
            };
            if meta
                .state_owner
                .compare_exchange(word, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                meta.read_pos.store(0, Ordering::Release);
                if state == SlotState::Writing {
                    meta.write_pos.store(0, Ordering::Release);
                }
                tracing::debug!("Released slot {slot} ({state}) on detach");
            }
        }

        control.attached_count.fetch_sub(1, Ordering::AcqRel);
        if self.registered_writer.swap(false, Ordering::AcqRel) {
            control.writer_count.fetch_sub(1, Ordering::AcqRel);
        }

        if destroy && self.created.load(Ordering::Acquire) {
            control.end_of_data.store(1, Ordering::Release);
            let path = platform::segment_path(self.config.key);
            if let Err(e) = platform::remove_segment(&path) {
                tracing::error!("Failed to remove segment {}: {e}", path.display());
            }
            tracing::info!("Destroyed segment {:#010x}", self.config.key);
        } else {
            tracing::debug!("Manager {me} detached from segment {:#010x}", self.config.key);
        }
    }

    /// Detach without destroying the segment.
    pub fn detach(&self) {
        self.shutdown(false);
    }

    /// Backing path of the segment.
    pub fn path(&self) -> PathBuf {
        platform::segment_path(self.config.key)
    }
}

impl Drop for SegmentManager {
    fn drop(&mut self) {
        // A creator that already detached still owns the segment name.
        if self.attachment.read().is_none() && self.created.load(Ordering::Acquire) {
            let _ = platform::remove_segment(&self.path());
            return;
        }
        self.shutdown(true);
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("key", &format_args!("{:#010x}", self.config.key))
            .field("manager_id", &self.my_id())
            .field("slot_count", &self.slot_count())
            .field("slot_size", &self.slot_size())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_key;
    use daq::time::ManualClock;

    #[test]
    fn creator_is_manager_zero() {
        let config = SegmentConfig::new(unique_key(), 4, 256);
        let creator = SegmentManager::attach(config.clone()).unwrap();
        assert_eq!(creator.my_id(), 0);
        assert!(creator.is_creator());

        let peer = SegmentManager::attach(SegmentConfig::attach_only(config.key)).unwrap();
        assert_eq!(peer.my_id(), 1);
        assert_eq!(peer.slot_count(), 4);
        assert_eq!(peer.slot_size(), 256);
        assert_eq!(creator.attached_count(), 2);
        drop(peer);
        assert_eq!(creator.attached_count(), 1);
    }

    #[test]
    fn attach_only_times_out_without_segment() {
        let err = SegmentManager::attach(SegmentConfig::attach_only(unique_key())).unwrap_err();
        assert!(matches!(err, ShmError::AttachTimeout { .. }));
    }

    #[test]
    fn sequence_ids_increase() {
        let manager = SegmentManager::attach(SegmentConfig::new(unique_key(), 3, 64)).unwrap();
        for _ in 0..3 {
            let slot = manager.get_buffer_for_writing(false).unwrap().unwrap();
            manager.write(slot, b"x").unwrap();
            assert!(manager.mark_buffer_full(slot, Destination::Any).unwrap());
        }
        let sequence: Vec<u64> = manager
            .snapshot()
            .unwrap()
            .slots
            .iter()
            .map(|s| s.sequence_id)
            .collect();
        assert_eq!(sequence, vec![1, 2, 3]);
        assert!(manager.get_buffer_for_writing(false).unwrap().is_none());
        assert!(manager.get_buffer_for_writing(true).unwrap().is_some());
    }

    #[test]
    fn reader_takes_lowest_sequence_first() {
        let manager = SegmentManager::attach(SegmentConfig::new(unique_key(), 4, 64)).unwrap();
        let mut written = Vec::new();
        for byte in [1u8, 2, 3] {
            let slot = manager.get_buffer_for_writing(false).unwrap().unwrap();
            manager.write(slot, &[byte]).unwrap();
            manager.mark_buffer_full(slot, Destination::Any).unwrap();
            written.push(slot);
        }
        for byte in [1u8, 2, 3] {
            let slot = manager.get_buffer_for_reading().unwrap().unwrap();
            let mut buf = [0u8; 1];
            assert!(!manager.read(slot, &mut buf).unwrap());
            assert_eq!(buf[0], byte);
            manager.mark_buffer_empty(slot, false).unwrap();
        }
        assert_eq!(manager.write_ready_count(false), 4);
    }

    #[test]
    fn addressed_slot_is_invisible_to_others() {
        let config = SegmentConfig::new(unique_key(), 2, 64);
        let writer = SegmentManager::attach(config.clone()).unwrap();
        let a = SegmentManager::attach(config.clone()).unwrap();
        let b = SegmentManager::attach(config).unwrap();

        let slot = writer.get_buffer_for_writing(false).unwrap().unwrap();
        writer.write(slot, b"for b").unwrap();
        writer
            .mark_buffer_full(slot, Destination::Manager(b.my_id()))
            .unwrap();

        assert!(!a.ready_for_read());
        assert!(a.get_buffer_for_reading().unwrap().is_none());
        assert_eq!(b.get_buffer_for_reading().unwrap(), Some(slot));
    }

    #[test]
    fn non_owner_mark_full_is_a_no_op() {
        let config = SegmentConfig::new(unique_key(), 2, 64);
        let writer = SegmentManager::attach(config.clone()).unwrap();
        let other = SegmentManager::attach(config).unwrap();
        let slot = writer.get_buffer_for_writing(false).unwrap().unwrap();
        assert!(!other.mark_buffer_full(slot, Destination::Any).unwrap());
        assert_eq!(writer.buffer_state(slot).unwrap(), SlotState::Writing);
        assert!(other.is_valid());
    }

    #[test]
    fn zero_increment_is_a_logic_error() {
        let manager = SegmentManager::attach(SegmentConfig::new(unique_key(), 1, 64)).unwrap();
        let slot = manager.get_buffer_for_writing(false).unwrap().unwrap();
        let err = manager.increment_write_pos(slot, 0).unwrap_err();
        assert!(matches!(err, ShmError::LogicError(_)));
        assert!(!manager.is_valid());

        manager.reattach().unwrap();
        assert!(manager.is_valid());
        // the detach released the claim
        assert_eq!(manager.buffer_state(slot).unwrap(), SlotState::Empty);
    }

    #[test]
    fn stale_claims_are_reclaimed_on_scan() {
        let clock = ManualClock::new(1_000);
        let config = SegmentConfig::new(unique_key(), 1, 64).with_stale_timeout_us(500);
        let writer = SegmentManager::attach_with_clock(config.clone(), clock.clone()).unwrap();
        let other = SegmentManager::attach_with_clock(config, clock.clone()).unwrap();

        let slot = writer.get_buffer_for_writing(false).unwrap().unwrap();
        writer.write(slot, b"abandoned").unwrap();
        assert!(other.get_buffer_for_writing(false).unwrap().is_none());

        clock.advance_us(501);
        assert_eq!(other.get_buffer_for_writing(false).unwrap(), Some(slot));
        assert_eq!(other.buffer_data_size(slot).unwrap(), 0);
        let err = writer.write(slot, b"late").unwrap_err();
        assert!(matches!(err, ShmError::OwnerAccessViolation { .. }));
    }

    #[test]
    fn reclaimed_writer_cannot_publish() {
        let clock = ManualClock::new(1_000);
        let config = SegmentConfig::new(unique_key(), 1, 64).with_stale_timeout_us(500);
        let slow = SegmentManager::attach_with_clock(config.clone(), clock.clone()).unwrap();
        let fast = SegmentManager::attach_with_clock(config, clock.clone()).unwrap();

        let slot = slow.get_buffer_for_writing(false).unwrap().unwrap();
        clock.advance_us(501);
        assert_eq!(fast.get_buffer_for_writing(false).unwrap(), Some(slot));

        assert!(!slow.mark_buffer_full(slot, Destination::Any).unwrap());
        assert!(slow.is_valid());
        let meta = &fast.snapshot().unwrap().slots[slot];
        assert_eq!(meta.state, SlotState::Writing);
        assert_eq!(meta.owner, fast.my_id());
        assert_eq!(meta.sequence_id, 0);
        assert!(fast.mark_buffer_full(slot, Destination::Any).unwrap());
        assert_eq!(fast.snapshot().unwrap().slots[slot].sequence_id, 1);
    }

    #[test]
    fn reader_cannot_republish_its_slot() {
        let key = unique_key();
        let writer = SegmentManager::attach(SegmentConfig::new(key, 1, 64)).unwrap();
        let reader = SegmentManager::attach(SegmentConfig::attach_only(key)).unwrap();
        let slot = writer.get_buffer_for_writing(false).unwrap().unwrap();
        assert!(writer.mark_buffer_full(slot, Destination::Any).unwrap());

        assert_eq!(reader.get_buffer_for_reading().unwrap(), Some(slot));
        assert!(!reader.mark_buffer_full(slot, Destination::Any).unwrap());
        assert_eq!(reader.buffer_state(slot).unwrap(), SlotState::Reading);
    }

    #[test]
    fn zero_timeout_disables_reclamation() {
        let clock = ManualClock::new(0);
        let config = SegmentConfig::new(unique_key(), 1, 64).with_stale_timeout_us(0);
        let writer = SegmentManager::attach_with_clock(config.clone(), clock.clone()).unwrap();
        let other = SegmentManager::attach_with_clock(config, clock.clone()).unwrap();
        let slot = writer.get_buffer_for_writing(false).unwrap().unwrap();
        clock.advance_us(u64::MAX / 2);
        assert!(!other.reset_buffer(slot).unwrap());
        assert_eq!(other.buffer_state(slot).unwrap(), SlotState::Writing);
    }

    #[test]
    fn snapshot_serializes() {
        let manager = SegmentManager::attach(SegmentConfig::new(unique_key(), 2, 32)).unwrap();
        let json = manager.snapshot_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["slot_count"], 2);
        assert_eq!(value["slots"][1]["state"], "Empty");
        assert_eq!(value["slots"][0]["owner"], -1);
    }

    #[test]
    fn creator_drop_unlinks_segment() {
        let key = unique_key();
        let creator = SegmentManager::attach(SegmentConfig::new(key, 1, 32)).unwrap();
        let peer = SegmentManager::attach(SegmentConfig::attach_only(key)).unwrap();
        assert!(platform::segment_exists(key));
        drop(creator);
        assert!(!platform::segment_exists(key));
        assert!(peer.is_end_of_data());
        assert!(peer.is_valid());
    }
}
