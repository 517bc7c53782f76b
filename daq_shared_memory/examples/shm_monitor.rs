//! Prints the slot table of a running segment twice a second

use daq::config::SegmentConfig;
use daq_shared_memory::{SegmentManager, ShmResult, SlotState};
use std::{thread, time::Duration};

const SEGMENT_KEY: u32 = 0xBEE7_0000;

fn main() -> ShmResult<()> {
    println!("DAQ Segment Monitor - attaching to {SEGMENT_KEY:#010x}...");
    let manager = SegmentManager::attach(SegmentConfig::attach_only(SEGMENT_KEY))?;

    while !manager.is_end_of_data() {
        let snapshot = manager.snapshot()?;
        let count = |state| snapshot.slots.iter().filter(|s| s.state == state).count();
        println!(
            "managers={} writers={} last_seq={} read_seq={} | empty={} writing={} full={} reading={}",
            snapshot.attached_count,
            snapshot.writer_count,
            snapshot.last_sequence_id,
            snapshot.lowest_seq_id_read,
            count(SlotState::Empty),
            count(SlotState::Writing),
            count(SlotState::Full),
            count(SlotState::Reading),
        );
        thread::sleep(Duration::from_millis(500));
    }

    println!("Segment signalled end of data; final state:");
    println!("{}", manager.snapshot_json()?);
    Ok(())
}
