//! Sub-Event Parser: walks a freshly-fetched buffer's live region, carving
//! out fixed-size records separated by `tlast` padding and validating
//! strictly-increasing Event-Window Tags.

use tracing::trace;

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::record::{SubEventRecord, RECORD_LEN, TLAST_PADDING_LEN};
use crate::ring::RingState;
use crate::types::PreviousTag;

/// The firmware note treats this exact meta-byte-count as an impossible
/// saturation of the 16-bit field rather than a legitimate size.
const SATURATED_META_BYTE_COUNT: u32 = 0x1_0000;

/// Parse every record out of the buffer currently under `ring`'s read
/// cursor. Consumes the whole live region in one pass: the cursor always
/// starts at payload offset 8 right after a fresh acquisition, and the
/// records plus their padding exactly cover `metaBufferSize - 1` bytes.
pub fn parse_records(ring: &mut RingState, driver: &dyn Driver) -> Result<Vec<SubEventRecord>> {
    let meta_byte_count = ring
        .current_meta_byte_count(driver)
        .ok_or_else(|| DriverError::DataCorruption("no buffer under the read cursor".to_string()))?;

    if meta_byte_count == SATURATED_META_BYTE_COUNT {
        return Err(DriverError::DataCorruption(
            "meta-byte-count saturated at 0x10000".to_string(),
        ));
    }

    if meta_byte_count == 0 {
        ring.clear_read_offset();
        return Ok(Vec::new());
    }

    let mut remaining = meta_byte_count - 1;
    let mut previous = PreviousTag::None;
    let mut records = Vec::new();

    while remaining >= RECORD_LEN as u32 {
        remaining -= TLAST_PADDING_LEN as u32;

        let live = ring.current_live_region(driver).ok_or_else(|| {
            DriverError::DataCorruption("read cursor has no live buffer behind it".to_string())
        })?;
        let record = SubEventRecord::decode(live).ok_or_else(|| {
            DriverError::DataCorruption("buffer shorter than one record".to_string())
        })?;

        if previous.equals(record.tag) {
            return Err(DriverError::DataCorruption(format!(
                "duplicate Event-Window Tag {}",
                record.tag
            )));
        }
        if !previous.is_less_than(record.tag) {
            return Err(DriverError::DataCorruption(format!(
                "Event-Window Tag {} is not strictly increasing",
                record.tag
            )));
        }
        previous = PreviousTag::Tag(record.tag);

        ring.advance_read_offset(RECORD_LEN + TLAST_PADDING_LEN);
        remaining -= RECORD_LEN as u32;
        trace!(tag = %record.tag, "parsed sub-event record");
        records.push(record);
    }

    if remaining != 0 {
        return Err(DriverError::DataCorruption(format!(
            "unaligned remainder of {remaining} bytes: truncated record"
        )));
    }

    // The whole live region is consumed: null the cursor so the ring
    // reports "nothing left on hand" (`needs_fresh_buffer`) instead of
    // re-walking this same exhausted buffer on the next call.
    ring.clear_read_offset();

    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::fake::FakeDriver;
    use crate::ioctl::{Channel, Direction};

    fn record_bytes(tag: u64, record_type: u8) -> [u8; RECORD_LEN] {
        let mut bytes = [0u8; RECORD_LEN];
        let tag_be = tag.to_be_bytes();
        bytes[0..6].copy_from_slice(&tag_be[2..8]);
        bytes[6] = record_type;
        bytes
    }

    fn buffer_with_records(tags: &[u64]) -> Vec<u8> {
        let meta_byte_count = tags.len() as u32 * (RECORD_LEN as u32 + TLAST_PADDING_LEN as u32) + 1;
        let mut buf = meta_byte_count.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 4]);
        for &tag in tags {
            buf.extend_from_slice(&record_bytes(tag, 0));
            buf.extend_from_slice(&[0u8; TLAST_PADDING_LEN]);
        }
        buf
    }

    fn fresh_ring_with(driver: &mut FakeDriver, bytes: Vec<u8>) -> RingState {
        driver.push_buffer(Channel::Daq, Direction::C2H, bytes);
        let mut ring = RingState::new(Channel::Daq, Direction::C2H);
        assert!(ring
            .acquire_fresh_buffer(driver, Duration::from_millis(10))
            .unwrap());
        ring
    }

    #[test]
    fn single_record_buffer_yields_one_record_and_zero_remainder() {
        let mut driver = FakeDriver::new(4, 128);
        // meta-byte-count = 57 = 48 + 8 + 1, one record's worth.
        let mut buf = 57u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&record_bytes(42, 0));
        buf.extend_from_slice(&[0u8; TLAST_PADDING_LEN]);
        let mut ring = fresh_ring_with(&mut driver, buf);

        let records = parse_records(&mut ring, &driver).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tag.value(), 42);
    }

    #[test]
    fn three_ascending_tags_parse_in_order() {
        let mut driver = FakeDriver::new(4, 256);
        let mut ring = fresh_ring_with(&mut driver, buffer_with_records(&[100, 101, 102]));

        let records = parse_records(&mut ring, &driver).unwrap();
        let tags: Vec<u64> = records.iter().map(|r| r.tag.value()).collect();
        assert_eq!(tags, vec![100, 101, 102]);
    }

    #[test]
    fn duplicate_tag_is_data_corruption() {
        let mut driver = FakeDriver::new(4, 256);
        let mut ring = fresh_ring_with(&mut driver, buffer_with_records(&[50, 50]));

        let err = parse_records(&mut ring, &driver).unwrap_err();
        assert!(matches!(err, DriverError::DataCorruption(_)));
    }

    #[test]
    fn saturated_meta_byte_count_is_data_corruption() {
        let mut driver = FakeDriver::new(4, 128);
        let mut buf = 0x1_0000u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 4]);
        let mut ring = fresh_ring_with(&mut driver, buf);

        let err = parse_records(&mut ring, &driver).unwrap_err();
        assert!(matches!(err, DriverError::DataCorruption(_)));
    }

    #[test]
    fn truncated_remainder_is_data_corruption() {
        let mut driver = FakeDriver::new(4, 128);
        // meta-byte-count claims two records' worth but only carries one.
        let meta_byte_count = 2 * (RECORD_LEN as u32 + TLAST_PADDING_LEN as u32) + 1;
        let mut buf = meta_byte_count.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&record_bytes(1, 0));
        buf.extend_from_slice(&[0u8; TLAST_PADDING_LEN]);
        let mut ring = fresh_ring_with(&mut driver, buf);

        let err = parse_records(&mut ring, &driver).unwrap_err();
        assert!(matches!(err, DriverError::DataCorruption(_)));
    }
}
