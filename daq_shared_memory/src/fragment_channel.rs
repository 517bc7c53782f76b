//! One fragment per slot.
//!
//! The writer side packs a complete fragment record (header, metadata and
//! payload) into a freshly claimed slot. The reader side reads the fixed-size
//! header first, sizes the rest from its word count, and releases the slot
//! once the payload has been copied out.

use crate::error::ShmError;
use crate::segment::{Destination, SegmentManager};
use daq::config::SegmentConfig;
use daq::consts::poll_backoff_us;
use daq::fragment::{FRAGMENT_HEADER_SIZE, Fragment, FragmentHeader};
use daq::statistics::{MonitoredQuantity, StatisticsCollector};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors of fragment channel operations.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The underlying manager is detached
    #[error("Segment {key:#010x} is not attached")]
    SegmentInvalid {
        /// Segment key
        key: u32,
    },

    /// No slot could be claimed in time
    #[error("No buffer available on segment {key:#010x}")]
    NoBufferAvailable {
        /// Segment key
        key: u32,
    },

    /// The slot did not receive the whole record
    #[error("Wrote {actual} bytes of a {expected}-byte fragment")]
    UnexpectedWriteLength {
        /// Record size
        expected: usize,
        /// Bytes in the slot
        actual: usize,
    },

    /// The fragment header could not be read
    #[error("Fragment header read failed: {reason}")]
    HeaderReadFailed {
        /// What went wrong
        reason: String,
    },

    /// The fragment payload could not be read
    #[error("Fragment payload read failed: {reason}")]
    PayloadReadFailed {
        /// What went wrong
        reason: String,
    },

    /// Segment manager failure
    #[error("Segment error: {source}")]
    Segment {
        /// Source segment error
        #[from]
        source: ShmError,
    },
}

impl ChannelError {
    /// Numeric status code of the error.
    pub fn code(&self) -> i32 {
        match self {
            Self::SegmentInvalid { .. } => -1,
            Self::NoBufferAvailable { .. } => -2,
            Self::UnexpectedWriteLength { .. } => -3,
            Self::HeaderReadFailed { .. } => -4,
            Self::PayloadReadFailed { .. } => -5,
            Self::Segment { .. } => -6,
        }
    }
}

/// Result type for fragment channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

struct ChannelStatistics {
    fragments_written: Arc<MonitoredQuantity>,
    bytes_written: Arc<MonitoredQuantity>,
    fragments_read: Arc<MonitoredQuantity>,
    bytes_read: Arc<MonitoredQuantity>,
}

/// Single-fragment transport over one segment.
pub struct FragmentChannel {
    segment: SegmentManager,
    destination: Destination,
    active_read: Option<(usize, FragmentHeader)>,
    statistics: Option<ChannelStatistics>,
}

impl FragmentChannel {
    /// Wrap an attached segment manager.
    pub fn new(segment: SegmentManager) -> Self {
        Self {
            segment,
            destination: Destination::Any,
            active_read: None,
            statistics: None,
        }
    }

    /// Attach to (or create) the segment described by `config`.
    pub fn attach(config: SegmentConfig) -> ChannelResult<Self> {
        Ok(Self::new(SegmentManager::attach(config)?))
    }

    /// Address written fragments to `destination`.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Register per-channel quantities with `collector` and feed them.
    pub fn with_statistics(mut self, collector: &StatisticsCollector) -> Self {
        let prefix = format!("shm_{:08x}", self.segment.key());
        let window = collector.interval() * 10;
        self.statistics = Some(ChannelStatistics {
            fragments_written: collector.register_new(format!("{prefix}.fragments_written"), window),
            bytes_written: collector.register_new(format!("{prefix}.bytes_written"), window),
            fragments_read: collector.register_new(format!("{prefix}.fragments_read"), window),
            bytes_read: collector.register_new(format!("{prefix}.bytes_read"), window),
        });
        self
    }

    /// Underlying segment manager.
    pub fn segment(&self) -> &SegmentManager {
        &self.segment
    }

    fn ensure_valid(&self) -> ChannelResult<()> {
        if !self.segment.is_valid() {
            return Err(ChannelError::SegmentInvalid {
                key: self.segment.key(),
            });
        }
        Ok(())
    }

    /// Write `fragment` into one slot, waiting up to `timeout` for room.
    pub fn write_fragment(
        &mut self,
        fragment: &Fragment,
        overwrite: bool,
        timeout: Duration,
    ) -> ChannelResult<()> {
        let destination = self.destination;
        self.write_fragment_to(fragment, overwrite, timeout, destination)
    }

    /// Write `fragment` addressed to `destination`.
    pub fn write_fragment_to(
        &mut self,
        fragment: &Fragment,
        overwrite: bool,
        timeout: Duration,
        destination: Destination,
    ) -> ChannelResult<()> {
        self.ensure_valid()?;
        let record = fragment.to_bytes();
        if record.len() > self.segment.slot_size() {
            return Err(ChannelError::UnexpectedWriteLength {
                expected: record.len(),
                actual: 0,
            });
        }

        let slot = self.claim_for_writing(overwrite, timeout)?;
        self.segment.write(slot, &record)?;
        let actual = self.segment.buffer_data_size(slot)?;
        if actual != record.len() {
            self.segment.reset_buffer(slot)?;
            return Err(ChannelError::UnexpectedWriteLength {
                expected: record.len(),
                actual,
            });
        }
        if !self.segment.mark_buffer_full(slot, destination)? {
            tracing::warn!("Slot {slot} was reclaimed before the fragment was published");
            return Err(ChannelError::NoBufferAvailable {
                key: self.segment.key(),
            });
        }

        if let Some(stats) = &self.statistics {
            stats.fragments_written.add_count(1);
            stats.bytes_written.add_count(record.len() as u64);
        }
        Ok(())
    }

    fn claim_for_writing(&self, overwrite: bool, timeout: Duration) -> ChannelResult<usize> {
        let start = Instant::now();
        loop {
            if let Some(slot) = self.segment.get_buffer_for_writing(overwrite)? {
                return Ok(slot);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ChannelError::NoBufferAvailable {
                    key: self.segment.key(),
                });
            }
            let sleep_us = poll_backoff_us(
                elapsed.as_micros() as u64,
                (timeout - elapsed).as_micros() as u64,
            );
            std::thread::sleep(Duration::from_micros(sleep_us));
        }
    }

    /// Read one whole fragment, or `None` if nothing is ready.
    pub fn read_fragment(&mut self) -> ChannelResult<Option<Fragment>> {
        let Some(header) = self.read_fragment_header()? else {
            return Ok(None);
        };
        let mut body = vec![0u8; header.body_bytes()];
        self.read_fragment_data(&mut body)?;
        Fragment::from_parts(header, body)
            .map(Some)
            .map_err(|e| ChannelError::PayloadReadFailed {
                reason: e.to_string(),
            })
    }

    /// Poll for up to `timeout` until a fragment can be read.
    pub fn wait_fragment(&mut self, timeout: Duration) -> ChannelResult<Option<Fragment>> {
        let start = Instant::now();
        loop {
            if let Some(fragment) = self.read_fragment()? {
                return Ok(Some(fragment));
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout || self.segment.is_end_of_data() {
                return Ok(None);
            }
            let sleep_us = poll_backoff_us(
                elapsed.as_micros() as u64,
                (timeout - elapsed).as_micros() as u64,
            );
            std::thread::sleep(Duration::from_micros(sleep_us));
        }
    }

    /// Claim a readable slot and decode its fragment header.
    ///
    /// The slot stays claimed until [`read_fragment_data`](Self::read_fragment_data)
    /// or [`release_active`](Self::release_active). Calling this again while
    /// a slot is held returns the same header.
    pub fn read_fragment_header(&mut self) -> ChannelResult<Option<FragmentHeader>> {
        if let Some((_, header)) = self.active_read {
            return Ok(Some(header));
        }
        self.ensure_valid()?;
        let Some(slot) = self.segment.get_buffer_for_reading()? else {
            return Ok(None);
        };

        let size = self.segment.buffer_data_size(slot)?;
        if size < FRAGMENT_HEADER_SIZE {
            self.segment.mark_buffer_empty(slot, false)?;
            return Err(ChannelError::HeaderReadFailed {
                reason: format!("slot {slot} holds {size} bytes, less than a header"),
            });
        }

        let mut raw = [0u8; FRAGMENT_HEADER_SIZE];
        self.segment
            .read(slot, &mut raw)
            .map_err(|e| ChannelError::HeaderReadFailed {
                reason: e.to_string(),
            })?;
        let header = match FragmentHeader::from_bytes(&raw) {
            Ok(header) if header.size_bytes() <= size => header,
            Ok(header) => {
                self.segment.mark_buffer_empty(slot, false)?;
                return Err(ChannelError::HeaderReadFailed {
                    reason: format!(
                        "slot {slot}: header declares {} bytes, slot holds {size}",
                        header.size_bytes()
                    ),
                });
            }
            Err(e) => {
                self.segment.mark_buffer_empty(slot, false)?;
                return Err(ChannelError::HeaderReadFailed {
                    reason: format!("slot {slot}: {e}"),
                });
            }
        };

        self.active_read = Some((slot, header));
        Ok(Some(header))
    }

    /// Copy the rest of the held fragment into `buf` and release the slot.
    ///
    /// Returns the number of bytes copied.
    pub fn read_fragment_data(&mut self, buf: &mut [u8]) -> ChannelResult<usize> {
        let Some((slot, header)) = self.active_read else {
            return Err(ChannelError::PayloadReadFailed {
                reason: "no fragment header has been read".to_string(),
            });
        };
        let body = header.body_bytes();
        if buf.len() < body {
            return Err(ChannelError::PayloadReadFailed {
                reason: format!("buffer of {} bytes for a {body}-byte payload", buf.len()),
            });
        }

        self.active_read = None;
        if body > 0 {
            self.segment
                .read(slot, &mut buf[..body])
                .map_err(|e| ChannelError::PayloadReadFailed {
                    reason: e.to_string(),
                })?;
        }
        self.segment.mark_buffer_empty(slot, false)?;

        if let Some(stats) = &self.statistics {
            stats.fragments_read.add_count(1);
            stats
                .bytes_read
                .add_count((FRAGMENT_HEADER_SIZE + body) as u64);
        }
        Ok(body)
    }

    /// Give back a slot claimed by `read_fragment_header` without reading it.
    pub fn release_active(&mut self) -> ChannelResult<()> {
        if let Some((slot, _)) = self.active_read.take() {
            self.segment.reset_buffer(slot)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FragmentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentChannel")
            .field("segment", &self.segment)
            .field("destination", &self.destination)
            .field("active_read", &self.active_read.map(|(slot, _)| slot))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_key;
    use daq::fragment::FragmentType;

    fn channel(slots: usize, size: usize) -> FragmentChannel {
        FragmentChannel::attach(SegmentConfig::new(unique_key(), slots, size)).unwrap()
    }

    #[test]
    fn round_trip_keeps_every_field() {
        let mut channel = channel(4, 1024);
        let mut fragment = Fragment::with_metadata(
            42,
            7,
            FragmentType::user(3).unwrap(),
            &[0xDEAD_BEEF, 17],
            b"payload bytes",
        )
        .unwrap();
        fragment.set_timestamp(123_456);

        channel
            .write_fragment(&fragment, false, Duration::ZERO)
            .unwrap();
        let read = channel.read_fragment().unwrap().unwrap();

        assert_eq!(read, fragment);
        assert_eq!(read.sequence_id(), 42);
        assert_eq!(read.fragment_id(), 7);
        assert_eq!(read.header().timestamp, 123_456);
        assert_eq!(read.metadata(), vec![0xDEAD_BEEF, 17]);
        assert_eq!(&read.payload()[..13], b"payload bytes");
        assert!(channel.read_fragment().unwrap().is_none());
    }

    #[test]
    fn full_segment_reports_no_buffer() {
        let mut channel = channel(1, 256);
        let fragment = Fragment::new(1, 0, FragmentType::DATA, &[1, 2, 3]).unwrap();
        channel
            .write_fragment(&fragment, false, Duration::ZERO)
            .unwrap();
        let err = channel
            .write_fragment(&fragment, false, Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(err.code(), -2);

        channel
            .write_fragment(&fragment, true, Duration::ZERO)
            .unwrap();
    }

    #[test]
    fn oversized_fragment_is_refused_without_detaching() {
        let mut channel = channel(1, 64);
        let fragment = Fragment::new(1, 0, FragmentType::DATA, &[0u8; 128]).unwrap();
        let err = channel
            .write_fragment(&fragment, false, Duration::ZERO)
            .unwrap_err();
        assert_eq!(err.code(), -3);
        assert!(channel.segment().is_valid());
    }

    #[test]
    fn split_read_holds_slot_until_data_is_read() {
        let mut channel = channel(2, 256);
        let fragment = Fragment::new(9, 1, FragmentType::DATA, &[5u8; 24]).unwrap();
        channel
            .write_fragment(&fragment, false, Duration::ZERO)
            .unwrap();

        let header = channel.read_fragment_header().unwrap().unwrap();
        assert_eq!(header.sequence_id, 9);
        assert_eq!(channel.read_fragment_header().unwrap(), Some(header));

        let mut small = [0u8; 4];
        assert_eq!(channel.read_fragment_data(&mut small).unwrap_err().code(), -5);

        let mut body = vec![0u8; header.body_bytes()];
        assert_eq!(channel.read_fragment_data(&mut body).unwrap(), 24);
        assert_eq!(body, vec![5u8; 24]);
        assert_eq!(channel.segment().write_ready_count(false), 2);
    }

    #[test]
    fn malformed_record_is_discarded() {
        let mut channel = channel(1, 256);
        let segment = channel.segment();
        let slot = segment.get_buffer_for_writing(false).unwrap().unwrap();
        segment.write(slot, &[0u8; FRAGMENT_HEADER_SIZE]).unwrap();
        segment.mark_buffer_full(slot, Destination::Any).unwrap();

        let err = channel.read_fragment().unwrap_err();
        assert_eq!(err.code(), -4);
        assert!(channel.segment().is_valid());
        assert!(channel.segment().ready_for_write(false));
    }

    #[test]
    fn statistics_count_traffic() {
        let collector = StatisticsCollector::new(Duration::from_secs(1));
        let mut channel = channel(2, 256).with_statistics(&collector);
        let prefix = format!("shm_{:08x}", channel.segment().key());
        collector.flush(0.0);

        let fragment = Fragment::new(1, 0, FragmentType::DATA, &[0u8; 8]).unwrap();
        channel
            .write_fragment(&fragment, false, Duration::ZERO)
            .unwrap();
        channel.read_fragment().unwrap().unwrap();
        assert_eq!(collector.flush(1.0), 4);

        let bytes = collector
            .get(&format!("{prefix}.bytes_written"))
            .unwrap()
            .stats();
        assert_eq!(bytes.full_value_sum, 40.0);
        let fragments = collector
            .get(&format!("{prefix}.fragments_read"))
            .unwrap()
            .stats();
        assert_eq!(fragments.full_sample_count, 1);
    }
}
