//! Slot claim/write/publish/read/release benchmarks

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use daq::config::SegmentConfig;
use daq::fragment::{Fragment, FragmentType};
use daq_shared_memory::{Destination, FragmentChannel, SegmentManager};
use std::hint::black_box;
use std::time::Duration;

fn bench_key(n: u32) -> u32 {
    0x7B00_0000 | ((std::process::id() & 0xFFFF) << 8) | n
}

/// One writer and one reader passing a slot back and forth
fn bench_slot_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_round_trip");

    for (n, size) in [64usize, 1024, 4096, 65536].into_iter().enumerate() {
        let key = bench_key(n as u32);
        let writer = SegmentManager::attach(SegmentConfig::new(key, 8, size)).unwrap();
        let reader = SegmentManager::attach(SegmentConfig::attach_only(key)).unwrap();
        let data = vec![0xAAu8; size];
        let mut buf = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let slot = writer.get_buffer_for_writing(false).unwrap().unwrap();
                writer.write(slot, black_box(&data)).unwrap();
                writer.mark_buffer_full(slot, Destination::Any).unwrap();

                let slot = reader.get_buffer_for_reading().unwrap().unwrap();
                reader.read(slot, &mut buf).unwrap();
                reader.mark_buffer_empty(slot, false).unwrap();
                black_box(&buf);
            });
        });
    }

    group.finish();
}

/// Lease-based round trip with a zero-copy view
fn bench_lease_round_trip(c: &mut Criterion) {
    let key = bench_key(0x10);
    let manager = SegmentManager::attach(SegmentConfig::new(key, 8, 4096)).unwrap();
    let data = vec![0x55u8; 4096];

    c.bench_function("lease_round_trip_4k", |b| {
        b.iter(|| {
            let mut lease = manager.claim_for_writing(false).unwrap().unwrap();
            lease.write(black_box(&data)).unwrap();
            lease.commit(Destination::Any).unwrap();

            let lease = manager.claim_for_reading().unwrap().unwrap();
            black_box(lease.view().unwrap().len());
            lease.release().unwrap();
        });
    });
}

/// Fragment framing on top of the slot protocol
fn bench_fragment_channel(c: &mut Criterion) {
    let key = bench_key(0x20);
    let mut channel = FragmentChannel::attach(SegmentConfig::new(key, 8, 0x2000)).unwrap();
    let fragment = Fragment::new(1, 0, FragmentType::DATA, &[0x42u8; 4096]).unwrap();

    c.bench_function("fragment_write_read_4k", |b| {
        b.iter(|| {
            channel
                .write_fragment(&fragment, false, Duration::ZERO)
                .unwrap();
            black_box(channel.read_fragment().unwrap());
        });
    });
}

/// Readiness scan over a busy segment
fn bench_ready_scan(c: &mut Criterion) {
    let key = bench_key(0x30);
    let manager = SegmentManager::attach(SegmentConfig::new(key, 64, 64)).unwrap();
    for _ in 0..32 {
        let slot = manager.get_buffer_for_writing(false).unwrap().unwrap();
        manager.write(slot, &[1u8; 8]).unwrap();
        manager.mark_buffer_full(slot, Destination::Any).unwrap();
    }

    c.bench_function("read_ready_count_64_slots", |b| {
        b.iter(|| black_box(manager.read_ready_count()));
    });
    c.bench_function("write_ready_count_64_slots", |b| {
        b.iter(|| black_box(manager.write_ready_count(false)));
    });
}

criterion_group!(
    benches,
    bench_slot_round_trip,
    bench_lease_round_trip,
    bench_fragment_channel,
    bench_ready_scan
);
criterion_main!(benches);
