//! End-to-end `GetData` scenarios driven entirely through the public
//! `DeviceHandle` API and `FakeDriver`, as an external consumer would use
//! them.

use dtc_driver::config::{CardKind, DeviceConfig, SimMode};
use dtc_driver::driver::fake::FakeDriver;
use dtc_driver::error::DriverError;
use dtc_driver::ioctl::{Channel, Direction};
use dtc_driver::types::EventWindowTag;
use dtc_driver::DeviceHandle;

const RECORD_LEN: usize = 48;
const TLAST_PADDING_LEN: usize = 8;
const FIRMWARE_VERSION: &str = "fake-version-1";

fn test_config() -> DeviceConfig {
    DeviceConfig {
        card_kind: CardKind::Dtc,
        card_index: 0,
        sim_mode: SimMode::Disabled,
        debug_write_file_path: None,
    }
}

fn record_bytes(tag: u64) -> [u8; RECORD_LEN] {
    let mut bytes = [0u8; RECORD_LEN];
    let tag_be = tag.to_be_bytes();
    bytes[0..6].copy_from_slice(&tag_be[2..8]);
    bytes
}

fn buffer_with_records(tags: &[u64]) -> Vec<u8> {
    let meta_byte_count = tags.len() as u32 * (RECORD_LEN as u32 + TLAST_PADDING_LEN as u32) + 1;
    let mut buf = meta_byte_count.to_le_bytes().to_vec();
    buf.extend_from_slice(&[0u8; 4]);
    for &tag in tags {
        buf.extend_from_slice(&record_bytes(tag));
        buf.extend_from_slice(&[0u8; TLAST_PADDING_LEN]);
    }
    buf
}

#[test]
fn single_record_buffer_meta_57_yields_one_record() {
    let mut driver = FakeDriver::new(4, 128);
    let buf = buffer_with_records(&[42]);
    assert_eq!(buf.len(), 8 + RECORD_LEN + TLAST_PADDING_LEN);
    assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 57);
    driver.push_buffer(Channel::Daq, Direction::C2H, buf);
    let mut handle = DeviceHandle::new(driver, test_config(), FIRMWARE_VERSION).unwrap();

    let records = handle.get_data(EventWindowTag::new(42), false).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tag.value(), 42);
}

#[test]
fn three_ascending_tags_meta_169_yield_three_records_in_order() {
    let mut driver = FakeDriver::new(4, 256);
    let buf = buffer_with_records(&[100, 101, 102]);
    assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 169);
    driver.push_buffer(Channel::Daq, Direction::C2H, buf);
    let mut handle = DeviceHandle::new(driver, test_config(), FIRMWARE_VERSION).unwrap();

    let records = handle.get_data(EventWindowTag::new(100), true).unwrap();
    let tags: Vec<u64> = records.iter().map(|r| r.tag.value()).collect();
    assert_eq!(tags, vec![100, 101, 102]);
}

#[test]
fn duplicate_tag_in_second_record_raises_data_corruption() {
    let mut driver = FakeDriver::new(4, 256);
    driver.push_buffer(Channel::Daq, Direction::C2H, buffer_with_records(&[50, 50]));
    let mut handle = DeviceHandle::new(driver, test_config(), FIRMWARE_VERSION).unwrap();

    let err = handle.get_data(EventWindowTag::new(50), false);
    assert!(matches!(err, Err(DriverError::DataCorruption(_))));
}

#[test]
fn successive_calls_drain_two_queued_buffers_in_order_and_release_each() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut driver = FakeDriver::new(4, 128);
    driver.push_buffer(Channel::Daq, Direction::C2H, buffer_with_records(&[42]));
    driver.push_buffer(Channel::Daq, Direction::C2H, buffer_with_records(&[43]));
    let mut handle = DeviceHandle::new(driver, test_config(), FIRMWARE_VERSION).unwrap();

    let first = handle.get_data(EventWindowTag::new(42), false).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].tag.value(), 42);

    let second = handle.get_data(EventWindowTag::new(43), false).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].tag.value(), 43);

    // Nothing left queued: the third call must come back empty rather than
    // re-walking the second buffer's exhausted tail, and both buffers must
    // have been returned to the driver by now.
    let third = handle.get_data(EventWindowTag::new(0), false).unwrap();
    assert!(third.is_empty());
    assert_eq!(
        handle.driver().released_count(Channel::Daq, Direction::C2H),
        2
    );
}

#[test]
fn tag_match_miss_rewinds_and_a_later_loose_call_sees_the_same_record() {
    let mut driver = FakeDriver::new(4, 128);
    driver.push_buffer(Channel::Daq, Direction::C2H, buffer_with_records(&[5]));
    let mut handle = DeviceHandle::new(driver, test_config(), FIRMWARE_VERSION).unwrap();

    let miss = handle.get_data(EventWindowTag::new(7), true).unwrap();
    assert!(miss.is_empty());

    let hit = handle.get_data(EventWindowTag::new(5), false).unwrap();
    assert_eq!(hit.len(), 1);
    assert_eq!(hit[0].tag.value(), 5);
}
