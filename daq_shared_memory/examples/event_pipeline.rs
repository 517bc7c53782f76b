//! Event builder and consumer threads sharing a data and a broadcast segment

use daq::config::{LogLevel, SegmentConfig, TransportConfig};
use daq::event::EventHeader;
use daq::fragment::{Fragment, FragmentType, TypeFilter};
use daq_shared_memory::{Destination, EventChannel, EventEmitter, init_tracing_with_level};
use std::time::Duration;

const EVENTS: u32 = 20;

fn transport(data: SegmentConfig, broadcast: SegmentConfig) -> TransportConfig {
    TransportConfig {
        log_level: LogLevel::Info,
        data,
        broadcast: Some(broadcast),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing_with_level(LogLevel::Info);

    let emitter = EventEmitter::from_config(&transport(
        SegmentConfig::new(0xBEE7_1000, 8, 0x4000),
        SegmentConfig::new(0xBEE7_1001, 2, 0x400).with_destructive_read(false),
    ))?;
    let mut channel = EventChannel::from_config(&transport(
        SegmentConfig::attach_only(0xBEE7_1000),
        SegmentConfig::attach_only(0xBEE7_1001),
    ))?;

    let adc = FragmentType::user(1).ok_or("bad user type")?;
    let tdc = FragmentType::user(2).ok_or("bad user type")?;

    let consumer = std::thread::spawn(move || -> Result<u32, String> {
        let mut events = 0;
        while channel
            .ready_for_read(false, Duration::from_secs(2))
            .map_err(|e| e.to_string())?
        {
            let header = channel.read_header().map_err(|e| e.to_string())?;
            if channel.holds_broadcast() {
                println!("broadcast for run {}", header.run_id);
            } else {
                let adc_fragments = channel
                    .get_fragments_by_type(TypeFilter::Only(adc))
                    .map_err(|e| e.to_string())?;
                println!(
                    "event {} with {} ADC fragments",
                    header.event_id,
                    adc_fragments.len()
                );
                events += 1;
            }
            channel.release_buffer().map_err(|e| e.to_string())?;
        }
        Ok(events)
    });

    let init = Fragment::new(0, 0, FragmentType::INIT, &[0u8; 8])?;
    emitter.broadcast(&EventHeader::new(7, 0, 0, 0), &[init])?;

    for event_id in 1..=EVENTS {
        let sequence_id = u64::from(event_id);
        let fragments = [
            Fragment::new(sequence_id, 0, adc, &[event_id as u8; 64])?,
            Fragment::new(sequence_id, 1, adc, &[event_id as u8; 64])?,
            Fragment::new(sequence_id, 2, tdc, &[0u8; 32])?,
        ];
        let header = EventHeader::new(7, 0, event_id, sequence_id);
        while !emitter.write_event(&header, &fragments, false, Destination::Any)? {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    emitter.data_segment().signal_end_of_data()?;

    let consumed = consumer.join().map_err(|_| "consumer panicked")??;
    println!("consumed {consumed} of {EVENTS} events");
    Ok(())
}
