//! DMA Ring Manager: tracks which buffers the host currently holds for a
//! (channel, direction) pair, and drives fresh-buffer acquisition.

use std::time::Duration;

use tracing::{debug, trace};

use crate::driver::{Driver, ReadOutcome};
use crate::error::Result;
use crate::ioctl::{Channel, Direction};

/// A fixed-size byte region the card has written one transfer into.
/// Bytes `[0..4)` carry the card-authored meta-byte-count of the live
/// region; bytes `[4..8)` are overwritten by the host with a monotonically
/// incrementing buffer index; the payload begins at byte offset 8.
pub struct HeldBuffer {
    /// Ring slot this buffer occupies in the driver's mapping.
    pub(crate) slot: u32,
    /// The host-stamped buffer index written into bytes `[4..8)`.
    pub(crate) buffer_index: u64,
}

/// Per-channel, per-direction DMA ring state.
///
/// Invariants upheld by this type:
/// - `current_read_offset` is `None`, or an offset within the live region of
///   the *last* buffer in `held`.
/// - `held.len()` equals the number of buffers acknowledged from the driver
///   but not yet returned.
/// - `next_buffer_index` is strictly increasing for the lifetime of the
///   ring.
pub struct RingState {
    channel: Channel,
    direction: Direction,
    held: Vec<HeldBuffer>,
    /// Offset of the read cursor within the *last* held buffer's live
    /// region, or `None` if nothing is currently being read.
    current_read_offset: Option<usize>,
    /// `current_read_offset` as of the start of the current parse attempt,
    /// so a failed/rejected parse can rewind.
    last_read_offset: Option<usize>,
    next_buffer_index: u64,
}

impl RingState {
    /// Construct an empty ring for `channel`/`direction`.
    pub fn new(channel: Channel, direction: Direction) -> Self {
        RingState {
            channel,
            direction,
            held: Vec::new(),
            current_read_offset: None,
            last_read_offset: None,
            next_buffer_index: 1,
        }
    }

    /// Returns `-1` if no buffer is held; `-2` if buffers are held but none
    /// contains the read cursor (the consumer has exhausted everything on
    /// hand and a fresh DMA is required); otherwise the index of the held
    /// buffer under the read cursor. When `current_read_offset` is `None`
    /// and the ring is non-empty, the queue length is returned instead of
    /// an index, and the release path treats that number as a release
    /// count — a deliberately overloaded return, kept as-is rather than
    /// split into two calls.
    pub fn current_buffer_index(&self) -> i32 {
        if self.held.is_empty() {
            return -1;
        }
        match self.current_read_offset {
            Some(_) => self.held.len() as i32 - 1,
            None => self.held.len() as i32,
        }
    }

    /// True exactly when `current_buffer_index() == -2`'s condition holds
    /// (held non-empty, no read cursor) — the signal that a fresh
    /// acquisition is needed before more records can be parsed.
    pub fn needs_fresh_buffer(&self) -> bool {
        !self.held.is_empty() && self.current_read_offset.is_none()
    }

    /// The meta-byte-count stored in the first two bytes of the buffer at
    /// ring position `index`. Returns 0 if `index` is out of range.
    pub fn buffer_byte_count(&self, driver: &dyn Driver, index: usize) -> u16 {
        let Some(held) = self.held.get(index) else {
            return 0;
        };
        let bytes = driver.buffer(self.channel, self.direction, held.slot);
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    /// Meta-byte-count of the buffer currently under the read cursor (the
    /// *last* held buffer), used by the parser to size its walk.
    pub fn current_meta_byte_count(&self, driver: &dyn Driver) -> Option<u32> {
        let held = self.held.last()?;
        let bytes = driver.buffer(self.channel, self.direction, held.slot);
        Some(u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16) | (u32::from(bytes[3]) << 24))
    }

    /// Tell the driver it owns the front `n` buffers again, pop them from
    /// the host queue, and advance the driver's software index by `n`.
    pub fn release(&mut self, driver: &mut dyn Driver, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let n = n.min(self.held.len());
        driver.give_buffers(self.channel, self.direction, n as u16)?;
        self.held.drain(0..n);
        // If we just released the buffer the cursor pointed into, the
        // cursor no longer has anything to read.
        if self.held.is_empty() {
            self.current_read_offset = None;
        }
        debug!(channel = ?self.channel, direction = ?self.direction, n, "released buffers");
        Ok(())
    }

    /// Release everything currently held. A no-op when nothing is held.
    pub fn release_all(&mut self, driver: &mut dyn Driver) -> Result<()> {
        self.release(driver, self.held.len())
    }

    /// Release whatever is stale: every held buffer if the read cursor is
    /// cleared (the previous call consumed everything), or every held
    /// buffer *except* the last if the cursor still points into it (a
    /// rewound exact-match miss leaves unread data there that the next
    /// call must still be able to parse). Mirrors the overload documented
    /// on [`Self::current_buffer_index`].
    pub fn release_stale(&mut self, driver: &mut dyn Driver) -> Result<()> {
        let n = match self.current_read_offset {
            Some(_) => self.held.len().saturating_sub(1),
            None => self.held.len(),
        };
        self.release(driver, n)
    }

    /// Acquire a fresh DMA buffer when the parser has nothing left to read.
    ///
    /// Returns `Ok(true)` if a new buffer is now under the read cursor,
    /// `Ok(false)` if the poll timed out or the driver redelivered the
    /// previous buffer (both "no data", not errors).
    pub fn acquire_fresh_buffer(
        &mut self,
        driver: &mut dyn Driver,
        timeout: Duration,
    ) -> Result<bool> {
        let outcome = driver.read_data(self.channel, self.direction, timeout)?;
        let slot = match outcome {
            ReadOutcome::Timeout => {
                trace!(channel = ?self.channel, direction = ?self.direction, "read_data timed out");
                return Ok(false);
            }
            ReadOutcome::Buffer { slot } => slot,
        };

        let previously_back_slot = self.held.last().map(|b| b.slot);
        let previously_back_index = self.held.last().map(|b| b.buffer_index);

        // Read the not-yet-restamped buffer index the driver is handing
        // back, to detect a redelivery before we overwrite it.
        let observed_index = {
            let bytes = driver.buffer(self.channel, self.direction, slot);
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as u64
        };

        if previously_back_slot == Some(slot) && previously_back_index == Some(observed_index) {
            // The driver redelivered the old buffer: release one buffer
            // back, null the read pointer, report "no data". This is
            // recoverable, not an error.
            self.release(driver, 1)?;
            self.current_read_offset = None;
            debug!(channel = ?self.channel, direction = ?self.direction, "driver redelivered buffer, releasing");
            return Ok(false);
        }

        // Stamp the new buffer: write the next buffer index into bytes
        // [4..8), then push it onto the held queue with the cursor at
        // payload offset 8.
        let buffer_index = self.next_buffer_index;
        self.next_buffer_index += 1;
        {
            let bytes = driver.buffer_mut(self.channel, self.direction, slot);
            bytes[4..8].copy_from_slice(&(buffer_index as u32).to_le_bytes());
        }
        self.held.push(HeldBuffer { slot, buffer_index });
        self.current_read_offset = Some(8);
        self.last_read_offset = Some(8);
        Ok(true)
    }

    /// The read cursor's current offset within the live buffer, if any.
    pub fn current_read_offset(&self) -> Option<usize> {
        self.current_read_offset
    }

    /// Advance the read cursor by `n` bytes.
    pub fn advance_read_offset(&mut self, n: usize) {
        if let Some(offset) = &mut self.current_read_offset {
            *offset += n;
        }
    }

    /// Snapshot the read cursor before a parse attempt, so a rejected parse
    /// (tag mismatch under exact-match mode) can rewind to it.
    pub fn snapshot_read_offset(&mut self) {
        self.last_read_offset = self.current_read_offset;
    }

    /// Rewind the read cursor to the last snapshot.
    pub fn rewind_to_snapshot(&mut self) {
        self.current_read_offset = self.last_read_offset;
    }

    /// Null the read cursor, forcing the next call to acquire a fresh
    /// buffer. Called on parse, I/O, and corruption errors.
    pub fn clear_read_offset(&mut self) {
        self.current_read_offset = None;
    }

    /// Byte slice of the live region under the current read cursor's
    /// buffer, starting at the cursor. `None` if no buffer is held.
    pub fn current_live_region<'d>(&self, driver: &'d dyn Driver) -> Option<&'d [u8]> {
        let held = self.held.last()?;
        let offset = self.current_read_offset?;
        let bytes = driver.buffer(self.channel, self.direction, held.slot);
        Some(&bytes[offset..])
    }

    /// Number of buffers currently held by the host.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDriver;

    fn make_buffer(meta_byte_count: u32, payload_tail: &[u8]) -> Vec<u8> {
        let mut buf = meta_byte_count.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 4]); // buffer-index slot, overwritten by host
        buf.extend_from_slice(payload_tail);
        buf
    }

    #[test]
    fn current_buffer_index_is_minus_one_when_empty() {
        let ring = RingState::new(Channel::Daq, Direction::C2H);
        assert_eq!(ring.current_buffer_index(), -1);
        assert!(!ring.needs_fresh_buffer());
    }

    #[test]
    fn fresh_acquisition_stamps_buffer_index_and_moves_cursor_to_offset_8() {
        let mut driver = FakeDriver::new(4, 64);
        driver.push_buffer(Channel::Daq, Direction::C2H, make_buffer(9, &[0xaa; 1]));
        let mut ring = RingState::new(Channel::Daq, Direction::C2H);

        let got = ring
            .acquire_fresh_buffer(&mut driver, Duration::from_millis(10))
            .unwrap();
        assert!(got);
        assert_eq!(ring.current_read_offset(), Some(8));
        assert_eq!(ring.held_len(), 1);
        assert_eq!(ring.current_buffer_index(), 0);
    }

    #[test]
    fn timeout_is_not_an_error_and_reports_no_data() {
        let mut driver = FakeDriver::new(4, 64);
        let mut ring = RingState::new(Channel::Daq, Direction::C2H);
        let got = ring
            .acquire_fresh_buffer(&mut driver, Duration::from_millis(1))
            .unwrap();
        assert!(!got);
    }

    #[test]
    fn redelivered_buffer_releases_one_and_reports_no_data() {
        let mut driver = FakeDriver::new(4, 64);
        driver.push_buffer(Channel::Daq, Direction::C2H, make_buffer(9, &[0xaa; 1]));
        let mut ring = RingState::new(Channel::Daq, Direction::C2H);
        assert!(ring
            .acquire_fresh_buffer(&mut driver, Duration::from_millis(10))
            .unwrap());

        driver.arm_redeliver_last(Channel::Daq, Direction::C2H);
        let got = ring
            .acquire_fresh_buffer(&mut driver, Duration::from_millis(10))
            .unwrap();
        assert!(!got);
        assert_eq!(ring.current_read_offset(), None);
        assert_eq!(driver.released_count(Channel::Daq, Direction::C2H), 1);
    }

    #[test]
    fn release_advances_driver_software_index_by_exactly_n() {
        let mut driver = FakeDriver::new(4, 64);
        driver.push_buffer(Channel::Daq, Direction::C2H, make_buffer(9, &[0xaa; 1]));
        driver.push_buffer(Channel::Daq, Direction::C2H, make_buffer(9, &[0xbb; 1]));
        let mut ring = RingState::new(Channel::Daq, Direction::C2H);
        ring.acquire_fresh_buffer(&mut driver, Duration::from_millis(10))
            .unwrap();
        ring.acquire_fresh_buffer(&mut driver, Duration::from_millis(10))
            .unwrap();
        assert_eq!(ring.held_len(), 2);

        ring.release(&mut driver, 2).unwrap();
        assert_eq!(ring.held_len(), 0);
        assert_eq!(driver.released_count(Channel::Daq, Direction::C2H), 2);
    }

    #[test]
    fn release_all_on_empty_ring_is_a_no_op() {
        let mut driver = FakeDriver::new(4, 64);
        let mut ring = RingState::new(Channel::Daq, Direction::C2H);
        ring.release_all(&mut driver).unwrap();
        assert_eq!(driver.released_count(Channel::Daq, Direction::C2H), 0);
    }

    #[test]
    fn release_stale_keeps_the_buffer_under_an_active_cursor() {
        let mut driver = FakeDriver::new(4, 64);
        driver.push_buffer(Channel::Daq, Direction::C2H, make_buffer(9, &[0xaa; 1]));
        let mut ring = RingState::new(Channel::Daq, Direction::C2H);
        ring.acquire_fresh_buffer(&mut driver, Duration::from_millis(10))
            .unwrap();
        assert_eq!(ring.current_read_offset(), Some(8));

        ring.release_stale(&mut driver).unwrap();

        assert_eq!(ring.held_len(), 1);
        assert_eq!(ring.current_read_offset(), Some(8));
        assert_eq!(driver.released_count(Channel::Daq, Direction::C2H), 0);
    }

    #[test]
    fn release_stale_releases_everything_once_the_cursor_is_cleared() {
        let mut driver = FakeDriver::new(4, 64);
        driver.push_buffer(Channel::Daq, Direction::C2H, make_buffer(9, &[0xaa; 1]));
        let mut ring = RingState::new(Channel::Daq, Direction::C2H);
        ring.acquire_fresh_buffer(&mut driver, Duration::from_millis(10))
            .unwrap();
        ring.clear_read_offset();

        ring.release_stale(&mut driver).unwrap();

        assert_eq!(ring.held_len(), 0);
        assert_eq!(driver.released_count(Channel::Daq, Direction::C2H), 1);
    }
}
