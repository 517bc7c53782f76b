//! Config loading, queue hand-off and record parsing through the public API.

use daq_common::config::{ConfigError, ConfigLoader, LogLevel, TransportConfig};
use daq_common::consts::DEFAULT_STALE_TIMEOUT_US;
use daq_common::fragment::{Fragment, FragmentHeader, FragmentType};
use daq_common::queue::{ConcurrentQueue, KeepNewest};
use proptest::prelude::*;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Write `content` as `transport.toml` in a fresh directory.
fn write_transport_toml(content: &str) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("transport.toml");
    fs::write(&path, content).unwrap();
    (dir, path)
}

#[test]
fn transport_config_loads_with_defaults() {
    let (_dir, path) = write_transport_toml(
        r#"
log_level = "debug"

[data]
key = 0xBEE70000
slot_count = 10
slot_size = 1048576

[broadcast]
key = 0xBEE80000
slot_count = 4
slot_size = 65536
destructive_read = false
"#,
    );

    let config = TransportConfig::load(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.data.key, 0xBEE7_0000);
    assert!(config.data.destructive_read);
    assert_eq!(config.data.stale_timeout_us, DEFAULT_STALE_TIMEOUT_US);

    let broadcast = config.broadcast.unwrap();
    assert!(!broadcast.destructive_read);
    assert!(broadcast.may_create());
}

#[test]
fn attach_only_transport_has_no_sizes() {
    let (_dir, path) = write_transport_toml(
        r#"
[data]
key = 0x1234
"#,
    );
    let config = TransportConfig::load(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.log_level, LogLevel::Info);
    assert!(!config.data.may_create());
    assert!(config.broadcast.is_none());
}

#[test]
fn shared_key_is_rejected() {
    let (_dir, path) = write_transport_toml(
        r#"
[data]
key = 7
slot_count = 2
slot_size = 64

[broadcast]
key = 7
"#,
    );
    let config = TransportConfig::load(&path).unwrap();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn malformed_transport_toml_is_a_parse_error() {
    let (_dir, path) = write_transport_toml("[data]\nkey = \"not a number\"\n");
    assert!(matches!(
        TransportConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));

    let missing = path.with_file_name("absent.toml");
    assert!(matches!(
        TransportConfig::load(&missing),
        Err(ConfigError::FileNotFound)
    ));
}

#[test]
fn keep_newest_queue_hands_latest_items_to_consumer() {
    let queue: Arc<ConcurrentQueue<u32, KeepNewest>> = Arc::new(ConcurrentQueue::new(4));

    let producer = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || (0..100).map(|i| queue.enqueue_nowait(i)).sum::<usize>())
    };
    let evicted = producer.join().unwrap();
    assert_eq!(evicted, 96);

    let drained: Vec<u32> =
        std::iter::from_fn(|| queue.dequeue_timed_wait(Duration::from_millis(10))).collect();
    assert_eq!(drained, vec![96, 97, 98, 99]);
}

#[test]
fn fragment_records_concatenate_and_split() {
    let records: Vec<Fragment> = (0..3u64)
        .map(|i| Fragment::new(i, i as u16, FragmentType::DATA, &[i as u8; 24]).unwrap())
        .collect();
    let packed: Vec<u8> = records.iter().flat_map(Fragment::to_bytes).collect();

    let mut offset = 0;
    let mut parsed = Vec::new();
    while offset < packed.len() {
        let header = FragmentHeader::from_bytes(&packed[offset..]).unwrap();
        let end = offset + header.size_bytes();
        parsed.push(Fragment::from_bytes(&packed[offset..end]).unwrap());
        offset = end;
    }
    assert_eq!(parsed, records);
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic_the_parser(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(fragment) = Fragment::from_bytes(&bytes) {
            prop_assert!(fragment.size_bytes() <= bytes.len());
            prop_assert_eq!(fragment.size_bytes() % 8, 0);
        }
    }
}
