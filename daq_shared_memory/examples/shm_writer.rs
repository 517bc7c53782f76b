//! Fragment producer: creates a segment and writes numbered fragments into it

use daq::config::SegmentConfig;
use daq::fragment::{Fragment, FragmentType};
use daq::time::now_us;
use daq_shared_memory::{ChannelError, FragmentChannel, init_tracing};
use std::time::Duration;

const SEGMENT_KEY: u32 = 0xBEE7_0000;
const FRAGMENT_COUNT: u64 = 100;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    println!("DAQ Shared Memory Writer Example");
    println!("================================");

    let config = SegmentConfig::new(SEGMENT_KEY, 10, 0x10000);
    let mut channel = FragmentChannel::attach(config)?;
    let segment = channel.segment();
    println!(
        "✓ Segment {:#010x}: {} slots x {} bytes, manager {}",
        segment.key(),
        segment.slot_count(),
        segment.slot_size(),
        segment.my_id()
    );

    for sequence_id in 1..=FRAGMENT_COUNT {
        let samples: Vec<u8> = (0..256u32)
            .flat_map(|i| ((sequence_id as u32).wrapping_mul(31) ^ i).to_le_bytes())
            .collect();
        let mut fragment = Fragment::new(sequence_id, 0, FragmentType::DATA, &samples)?;
        fragment.set_timestamp(now_us());

        match channel.write_fragment(&fragment, false, Duration::from_secs(1)) {
            Ok(()) => println!("  wrote fragment {sequence_id} ({} bytes)", fragment.size_bytes()),
            Err(e @ ChannelError::NoBufferAvailable { .. }) => {
                println!("  segment full, dropping fragment {sequence_id}: {e}");
            }
            Err(e) => return Err(e.into()),
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("\nWaiting for readers to drain...");
    while channel.segment().read_ready_count() > 0 {
        std::thread::sleep(Duration::from_millis(50));
    }
    println!("Cleaning up segment...");
    Ok(())
}
