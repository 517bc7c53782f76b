//! Multi-fragment events over a data segment and a broadcast segment.
//!
//! An event slot holds an [`EventHeader`] followed by packed fragment
//! records. Only each record's word count is interpreted while walking the
//! slot; bodies that are not wanted are skipped without copying.
//!
//! Broadcast slots (non-destructive, seen by every reader) are polled before
//! data slots. An `Init` broadcast is delivered once per channel.

use crate::error::ShmError;
use crate::layout::SlotState;
use crate::lease::WriteLease;
use crate::segment::{Destination, SegmentManager};
use daq::config::TransportConfig;
use daq::consts::{WORD_SIZE, poll_backoff_us};
use daq::event::{EVENT_HEADER_SIZE, EventHeader};
use daq::fragment::{
    FRAGMENT_HEADER_SIZE, Fragment, FragmentError, FragmentHeader, FragmentType, TypeFilter,
};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors of event channel operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// No event slot is held
    #[error("No event buffer is held")]
    NoBuffer,

    /// The held slot was reclaimed by another participant
    #[error("Event buffer {slot} was lost to reclamation")]
    BufferLost {
        /// Slot that was lost
        slot: usize,
    },

    /// The slot contents are not a valid event
    #[error("Malformed event: {source}")]
    Framing {
        /// Source framing error
        #[from]
        source: FragmentError,
    },

    /// Segment manager failure
    #[error("Segment error: {source}")]
    Segment {
        /// Source segment error
        #[from]
        source: ShmError,
    },
}

/// Result type for event channel operations
pub type EventResult<T> = Result<T, EventError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Data,
    Broadcast,
}

/// Reader side of the event transport.
#[derive(Debug)]
pub struct EventChannel {
    data: SegmentManager,
    broadcast: Option<SegmentManager>,
    current: Option<(Source, usize)>,
    init_received: bool,
}

impl EventChannel {
    /// Combine a data segment with an optional broadcast segment.
    pub fn new(data: SegmentManager, broadcast: Option<SegmentManager>) -> Self {
        Self {
            data,
            broadcast,
            current: None,
            init_received: false,
        }
    }

    /// Attach to the segments named in `config`.
    pub fn from_config(config: &TransportConfig) -> EventResult<Self> {
        config.validate().map_err(ShmError::from)?;
        let data = SegmentManager::attach(config.data.clone())?;
        let broadcast = config
            .broadcast
            .clone()
            .map(SegmentManager::attach)
            .transpose()?;
        Ok(Self::new(data, broadcast))
    }

    /// Data segment.
    pub fn data_segment(&self) -> &SegmentManager {
        &self.data
    }

    /// Broadcast segment, if any.
    pub fn broadcast_segment(&self) -> Option<&SegmentManager> {
        self.broadcast.as_ref()
    }

    /// Whether an event is held.
    pub fn holds_event(&self) -> bool {
        self.current.is_some()
    }

    /// Whether the held event came from the broadcast segment.
    pub fn holds_broadcast(&self) -> bool {
        matches!(self.current, Some((Source::Broadcast, _)))
    }

    fn manager(&self, source: Source) -> EventResult<&SegmentManager> {
        match source {
            Source::Data => Ok(&self.data),
            Source::Broadcast => self
                .broadcast
                .as_ref()
                .ok_or(EventError::Segment {
                    source: ShmError::NotAttached,
                }),
        }
    }

    fn end_of_data(&self) -> bool {
        self.data.is_end_of_data()
            || self
                .broadcast
                .as_ref()
                .is_some_and(SegmentManager::is_end_of_data)
    }

    /// Wait up to `timeout` for an event; `true` once one is held.
    ///
    /// A zero timeout polls once. Returns `false` without waiting further
    /// when a poll finds nothing and either segment signalled end-of-data.
    pub fn ready_for_read(&mut self, broadcast_only: bool, timeout: Duration) -> EventResult<bool> {
        if self.current.is_some() {
            return Ok(true);
        }

        let start = Instant::now();
        loop {
            if self.poll_broadcast()? {
                return Ok(true);
            }
            if !broadcast_only {
                if let Some(slot) = self.data.get_buffer_for_reading()? {
                    self.current = Some((Source::Data, slot));
                    return Ok(true);
                }
            }

            if self.end_of_data() {
                tracing::debug!("End of data reached");
                return Ok(false);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(false);
            }
            let sleep_us = poll_backoff_us(
                elapsed.as_micros() as u64,
                (timeout - elapsed).as_micros() as u64,
            );
            std::thread::sleep(Duration::from_micros(sleep_us));
        }
    }

    /// Claim the next broadcast slot, skipping repeated `Init` broadcasts.
    fn poll_broadcast(&mut self) -> EventResult<bool> {
        let Some(broadcast) = &self.broadcast else {
            return Ok(false);
        };
        while let Some(slot) = broadcast.get_buffer_for_reading()? {
            // held from here on, so a malformed slot can still be released
            self.current = Some((Source::Broadcast, slot));
            if fragment_types(broadcast, slot)?.contains(&FragmentType::INIT) {
                if self.init_received {
                    tracing::debug!("Skipping repeated init broadcast in slot {slot}");
                    self.current = None;
                    broadcast.mark_buffer_empty(slot, false)?;
                    continue;
                }
                self.init_received = true;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Held slot, re-validated against reclamation.
    fn held(&mut self) -> EventResult<(&SegmentManager, usize)> {
        let (source, slot) = self.current.ok_or(EventError::NoBuffer)?;
        let still_held = self.manager(source)?.check_buffer(slot, SlotState::Reading)?;
        if !still_held {
            tracing::warn!("Event buffer {slot} was reclaimed while held");
            self.current = None;
            return Err(EventError::BufferLost { slot });
        }
        Ok((self.manager(source)?, slot))
    }

    /// Header of the held event.
    pub fn read_header(&mut self) -> EventResult<EventHeader> {
        let (manager, slot) = self.held()?;
        read_event_header(manager, slot)
    }

    /// Distinct fragment types in the held event.
    pub fn get_fragment_types(&mut self) -> EventResult<BTreeSet<FragmentType>> {
        let (manager, slot) = self.held()?;
        fragment_types(manager, slot)
    }

    /// Copies of the held event's fragments that pass `filter`.
    pub fn get_fragments_by_type(&mut self, filter: TypeFilter) -> EventResult<Vec<Fragment>> {
        let (manager, slot) = self.held()?;
        let mut fragments = Vec::new();
        scan_fragments(
            manager,
            slot,
            |header| filter.matches(header.fragment_type),
            |header, body| {
                if let Some(body) = body {
                    fragments.push(Fragment::from_parts(header, body)?);
                }
                Ok(())
            },
        )?;
        Ok(fragments)
    }

    /// Release the held event.
    pub fn release_buffer(&mut self) -> EventResult<()> {
        let (manager, slot) = self.held()?;
        manager.mark_buffer_empty(slot, false)?;
        self.current = None;
        Ok(())
    }
}

fn read_event_header(manager: &SegmentManager, slot: usize) -> EventResult<EventHeader> {
    let size = manager.buffer_data_size(slot)?;
    if size < EVENT_HEADER_SIZE {
        return Err(FragmentError::TruncatedHeader {
            expected: EVENT_HEADER_SIZE,
            actual: size,
        }
        .into());
    }
    let mut raw = [0u8; EVENT_HEADER_SIZE];
    manager.reset_read_pos(slot)?;
    manager.read(slot, &mut raw)?;
    Ok(EventHeader::from_bytes(&raw)?)
}

fn fragment_types(manager: &SegmentManager, slot: usize) -> EventResult<BTreeSet<FragmentType>> {
    let mut types = BTreeSet::new();
    scan_fragments(
        manager,
        slot,
        |_| false,
        |header, _| {
            types.insert(header.fragment_type);
            Ok(())
        },
    )?;
    Ok(types)
}

/// Walk the fragment records of a held event slot.
///
/// `want_body` decides per header whether the body is copied or skipped;
/// `visit` sees every header with its body when copied.
fn scan_fragments(
    manager: &SegmentManager,
    slot: usize,
    mut want_body: impl FnMut(&FragmentHeader) -> bool,
    mut visit: impl FnMut(FragmentHeader, Option<Vec<u8>>) -> Result<(), FragmentError>,
) -> EventResult<()> {
    let size = manager.buffer_data_size(slot)?;
    read_event_header(manager, slot)?;
    let mut offset = EVENT_HEADER_SIZE;

    while offset < size {
        let remaining = size - offset;
        if remaining < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::TruncatedHeader {
                expected: FRAGMENT_HEADER_SIZE,
                actual: remaining,
            }
            .into());
        }
        let mut raw = [0u8; FRAGMENT_HEADER_SIZE];
        manager.read(slot, &mut raw)?;
        let header = FragmentHeader::from_bytes(&raw)?;
        let body_len = header.body_bytes();
        if body_len > remaining - FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::BodyLengthMismatch {
                expected: body_len,
                actual: remaining - FRAGMENT_HEADER_SIZE,
            }
            .into());
        }

        let body = if want_body(&header) {
            let mut body = vec![0u8; body_len];
            if body_len > 0 {
                manager.read(slot, &mut body)?;
            }
            Some(body)
        } else {
            if body_len > 0 {
                manager.increment_read_pos(slot, body_len)?;
            }
            None
        };
        visit(header, body)?;
        offset += header.size_bytes();
    }
    Ok(())
}

/// Writer side of the event transport.
#[derive(Debug)]
pub struct EventEmitter {
    data: SegmentManager,
    broadcast: Option<SegmentManager>,
}

impl EventEmitter {
    /// Combine a data segment with an optional broadcast segment.
    pub fn new(data: SegmentManager, broadcast: Option<SegmentManager>) -> Self {
        Self { data, broadcast }
    }

    /// Attach to (or create) the segments named in `config`.
    pub fn from_config(config: &TransportConfig) -> EventResult<Self> {
        config.validate().map_err(ShmError::from)?;
        let data = SegmentManager::attach(config.data.clone())?;
        let broadcast = config
            .broadcast
            .clone()
            .map(SegmentManager::attach)
            .transpose()?;
        Ok(Self::new(data, broadcast))
    }

    /// Data segment.
    pub fn data_segment(&self) -> &SegmentManager {
        &self.data
    }

    /// Broadcast segment, if any.
    pub fn broadcast_segment(&self) -> Option<&SegmentManager> {
        self.broadcast.as_ref()
    }

    /// Pack an event into one data slot; `Ok(false)` if no slot was free.
    pub fn write_event(
        &self,
        header: &EventHeader,
        fragments: &[Fragment],
        overwrite: bool,
        destination: Destination,
    ) -> EventResult<bool> {
        write_packed(&self.data, header, fragments, overwrite, destination)
    }

    /// Pack an event into one broadcast slot for every reader.
    pub fn broadcast(&self, header: &EventHeader, fragments: &[Fragment]) -> EventResult<bool> {
        let broadcast = self.broadcast.as_ref().ok_or(EventError::Segment {
            source: ShmError::NotAttached,
        })?;
        write_packed(broadcast, header, fragments, false, Destination::Any)
    }
}

fn write_packed(
    manager: &SegmentManager,
    header: &EventHeader,
    fragments: &[Fragment],
    overwrite: bool,
    destination: Destination,
) -> EventResult<bool> {
    let size = EVENT_HEADER_SIZE + fragments.iter().map(Fragment::size_bytes).sum::<usize>();
    if size > manager.slot_size() {
        return Err(FragmentError::TooLarge {
            words: size / WORD_SIZE,
        }
        .into());
    }

    let Some(mut lease) = manager.claim_for_writing(overwrite)? else {
        return Ok(false);
    };
    write_records(&mut lease, header, fragments)?;
    Ok(lease.commit(destination)?)
}

fn write_records(
    lease: &mut WriteLease<'_>,
    header: &EventHeader,
    fragments: &[Fragment],
) -> EventResult<()> {
    lease.write(&header.to_bytes())?;
    for fragment in fragments {
        lease.write(&fragment.to_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_key;
    use daq::config::SegmentConfig;

    struct Pair {
        emitter: EventEmitter,
        channel: EventChannel,
    }

    fn pair(broadcast: bool) -> Pair {
        let data = SegmentConfig::new(unique_key(), 4, 4096);
        let bc = broadcast.then(|| {
            SegmentConfig::new(unique_key(), 4, 4096).with_destructive_read(false)
        });
        let emitter = EventEmitter::new(
            SegmentManager::attach(data.clone()).unwrap(),
            bc.clone().map(|c| SegmentManager::attach(c).unwrap()),
        );
        let channel = EventChannel::new(
            SegmentManager::attach(SegmentConfig::attach_only(data.key)).unwrap(),
            bc.map(|c| SegmentManager::attach(SegmentConfig::attach_only(c.key)).unwrap()),
        );
        Pair { emitter, channel }
    }

    fn fragment(seq: u64, id: u16, kind: FragmentType, fill: u8) -> Fragment {
        Fragment::new(seq, id, kind, &[fill; 12]).unwrap()
    }

    #[test]
    fn event_fragments_are_filtered_by_type() {
        let Pair { emitter, mut channel } = pair(false);
        let user = FragmentType::user(1).unwrap();
        let header = EventHeader::new(1, 2, 3, 10);
        let fragments = [
            fragment(10, 0, user, 0xAA),
            fragment(10, 1, FragmentType::DATA, 0xBB),
            fragment(10, 2, user, 0xCC),
        ];
        assert!(emitter
            .write_event(&header, &fragments, false, Destination::Any)
            .unwrap());

        assert!(channel.ready_for_read(false, Duration::ZERO).unwrap());
        assert_eq!(channel.read_header().unwrap(), header);
        assert_eq!(
            channel.get_fragment_types().unwrap(),
            BTreeSet::from([user, FragmentType::DATA])
        );

        let users = channel.get_fragments_by_type(TypeFilter::Only(user)).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0], fragments[0]);
        assert_eq!(users[1], fragments[2]);
        assert_eq!(channel.get_fragments_by_type(TypeFilter::Any).unwrap().len(), 3);

        channel.release_buffer().unwrap();
        assert!(matches!(channel.read_header(), Err(EventError::NoBuffer)));
    }

    #[test]
    fn zero_timeout_polls_once() {
        let Pair { mut channel, .. } = pair(false);
        let start = Instant::now();
        assert!(!channel.ready_for_read(false, Duration::ZERO).unwrap());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn broadcast_is_polled_first() {
        let Pair { emitter, mut channel } = pair(true);
        let header = EventHeader::new(1, 1, 1, 1);
        emitter
            .write_event(&header, &[fragment(1, 0, FragmentType::DATA, 1)], false, Destination::Any)
            .unwrap();
        emitter
            .broadcast(&header, &[fragment(1, 0, FragmentType::INIT, 2)])
            .unwrap();

        assert!(channel.ready_for_read(false, Duration::ZERO).unwrap());
        assert!(channel.holds_broadcast());
        channel.release_buffer().unwrap();

        assert!(channel.ready_for_read(false, Duration::ZERO).unwrap());
        assert!(!channel.holds_broadcast());
        channel.release_buffer().unwrap();
    }

    #[test]
    fn broadcast_only_ignores_data() {
        let Pair { emitter, mut channel } = pair(true);
        emitter
            .write_event(&EventHeader::new(1, 1, 1, 1), &[], false, Destination::Any)
            .unwrap();
        assert!(!channel.ready_for_read(true, Duration::ZERO).unwrap());
        assert!(channel.ready_for_read(false, Duration::ZERO).unwrap());
    }

    #[test]
    fn init_broadcast_is_delivered_once() {
        let Pair { emitter, mut channel } = pair(true);
        let init = [fragment(0, 0, FragmentType::INIT, 7)];
        emitter.broadcast(&EventHeader::new(1, 0, 0, 0), &init).unwrap();
        emitter.broadcast(&EventHeader::new(1, 0, 0, 0), &init).unwrap();

        assert!(channel.ready_for_read(true, Duration::ZERO).unwrap());
        assert!(channel.get_fragment_types().unwrap().contains(&FragmentType::INIT));
        channel.release_buffer().unwrap();

        assert!(!channel.ready_for_read(true, Duration::ZERO).unwrap());
    }

    #[test]
    fn oversized_event_is_rejected() {
        let Pair { emitter, .. } = pair(false);
        let big = Fragment::new(1, 0, FragmentType::DATA, &[0u8; 8192]).unwrap();
        let err = emitter
            .write_event(&EventHeader::default(), &[big], false, Destination::Any)
            .unwrap_err();
        assert!(matches!(err, EventError::Framing { .. }));
        assert!(emitter.data_segment().is_valid());
    }

    #[test]
    fn reclaimed_slot_reports_buffer_lost() {
        let Pair { emitter, mut channel } = pair(false);
        emitter
            .write_event(&EventHeader::new(1, 1, 1, 1), &[], false, Destination::Any)
            .unwrap();
        assert!(channel.ready_for_read(false, Duration::ZERO).unwrap());

        // the creator may force the slot empty underneath the reader
        emitter.data_segment().mark_buffer_empty(0, true).unwrap();
        assert!(matches!(
            channel.read_header(),
            Err(EventError::BufferLost { slot: 0 })
        ));
        assert!(!channel.holds_event());
    }
}
