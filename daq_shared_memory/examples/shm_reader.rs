//! Fragment consumer: attaches to the writer example's segment and prints what arrives

use daq::config::{LogLevel, SegmentConfig};
use daq::statistics::StatisticsCollector;
use daq::time::now_us;
use daq_shared_memory::{FragmentChannel, init_tracing_with_level};
use std::time::Duration;

const SEGMENT_KEY: u32 = 0xBEE7_0000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing_with_level(LogLevel::Info);
    println!("DAQ Shared Memory Reader Example");
    println!("================================");

    let collector = StatisticsCollector::new(Duration::from_secs(1));
    collector.start()?;

    let mut channel = match FragmentChannel::attach(SegmentConfig::attach_only(SEGMENT_KEY)) {
        Ok(channel) => channel.with_statistics(&collector),
        Err(e) => {
            println!("✗ No segment {SEGMENT_KEY:#010x}; start the shm_writer example first ({e})");
            return Ok(());
        }
    };
    println!("✓ Attached as manager {}", channel.segment().my_id());

    let mut received = 0u64;
    while let Some(fragment) = channel.wait_fragment(Duration::from_secs(2))? {
        received += 1;
        let latency_us = now_us().saturating_sub(fragment.header().timestamp);
        println!(
            "  fragment {} type {} payload {} bytes, {latency_us} us after stamping",
            fragment.sequence_id(),
            fragment.fragment_type(),
            fragment.payload().len()
        );
    }

    if channel.segment().is_end_of_data() {
        println!("\nWriter finished.");
    }
    collector.stop();

    let key = format!("shm_{SEGMENT_KEY:08x}.bytes_read");
    if let Some(bytes) = collector.get(&key) {
        let stats = bytes.stats();
        println!(
            "Received {received} fragments, {} bytes ({:.1} bytes/s)",
            stats.full_value_sum, stats.full_value_rate
        );
    }
    Ok(())
}
