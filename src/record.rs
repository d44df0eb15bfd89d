//! The fixed-size sub-event header the card writes into a DMA buffer,
//! followed on the wire by an 8-byte `tlast` padding word.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::types::EventWindowTag;

/// Size in bytes of one header, not counting the trailing padding word.
pub const RECORD_LEN: usize = 48;

/// Size in bytes of the `tlast` padding word that follows every record.
pub const TLAST_PADDING_LEN: usize = 8;

/// The 48-byte header as it sits in the DMA buffer: an opaque POD byte
/// array, read by value and never aliased back into the ring (the ring
/// buffer outlives any single record and is reused once released).
#[repr(C)]
#[derive(Copy, Clone, FromBytes, FromZeroes, AsBytes)]
pub struct RawRecord {
    bytes: [u8; RECORD_LEN],
}

/// A decoded sub-event, owned independently of the DMA buffer it was read
/// from.
#[derive(Copy, Clone, Debug)]
pub struct SubEventRecord {
    /// The Event-Window Tag this record belongs to.
    pub tag: EventWindowTag,
    /// The firmware-assigned record type byte, checked by callers that
    /// expect a specific kind of sub-event.
    pub record_type: u8,
    /// The full 48-byte header, for consumers that need fields this crate
    /// doesn't otherwise interpret.
    pub header: [u8; RECORD_LEN],
}

impl SubEventRecord {
    /// Decode one record from the front of `bytes`. Returns `None` if fewer
    /// than [`RECORD_LEN`] bytes are available.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let raw = RawRecord::read_from_prefix(bytes)?;
        let tag_bytes = &raw.bytes[0..6];
        let tag = EventWindowTag::new(u64::from_be_bytes([
            0,
            0,
            tag_bytes[0],
            tag_bytes[1],
            tag_bytes[2],
            tag_bytes[3],
            tag_bytes[4],
            tag_bytes[5],
        ]));
        Some(SubEventRecord {
            tag,
            record_type: raw.bytes[6],
            header: raw.bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_bytes(tag: u64, record_type: u8) -> [u8; RECORD_LEN] {
        let mut bytes = [0u8; RECORD_LEN];
        let tag_be = tag.to_be_bytes();
        bytes[0..6].copy_from_slice(&tag_be[2..8]);
        bytes[6] = record_type;
        bytes
    }

    #[test]
    fn decode_reads_big_endian_48_bit_tag() {
        let bytes = record_bytes(0x0102_0304_0506, 9);
        let record = SubEventRecord::decode(&bytes).unwrap();
        assert_eq!(record.tag.value(), 0x0102_0304_0506);
        assert_eq!(record.record_type, 9);
    }

    #[test]
    fn decode_rejects_short_input() {
        let bytes = [0u8; RECORD_LEN - 1];
        assert!(SubEventRecord::decode(&bytes).is_none());
    }
}
