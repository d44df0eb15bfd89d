//! The `Driver` trait abstracts the ioctls and the mmap'd buffer regions
//! behind an interface the rest of the crate can use without caring whether
//! it's talking to `/dev/dtc0` or a fake.
//!
//! The split mirrors `thunderscope`'s `sys::Driver` trait
//! (`other_examples/.../src-device.rs.rs`): the high-level logic (ring
//! management, parsing, register verification, link resets) is generic over
//! `Driver`, and only [`LinuxDriver`] touches `libc`/`nix`.

use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::ioctl::{Channel, Direction, RegAccessArg};

/// Outcome of a `read_data` poll.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// The poll's short timeout elapsed with no buffer available. Not an
    /// error.
    Timeout,
    /// A DMA buffer became available at this ring slot index. Two
    /// consecutive `Buffer` outcomes carrying the same `index` (and an
    /// unchanged host-stamped buffer index, checked by the caller) mean the
    /// driver redelivered the same buffer rather than handing over a new one.
    Buffer {
        /// Ring slot index of the delivered buffer.
        slot: u32,
    },
}

/// Outcome of a `DCS_LOCK` ioctl.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DcsLockOutcome {
    /// Lock acquired.
    Acquired,
    /// Lock held by someone else; caller should retry.
    Retry,
    /// The driver doesn't implement locking at all — treated as acquired.
    Unsupported,
}

/// Snapshot returned by `GET_INFO`.
#[derive(Copy, Clone, Debug, Default)]
pub struct ChannelInfo {
    /// Number of DMA buffers allocated for this (channel, direction).
    pub num_buffs: u32,
    /// Size in bytes of each DMA buffer.
    pub buff_size: u32,
    /// Driver's hardware ring index.
    pub hw_idx: u32,
    /// Driver's software ring index.
    pub sw_idx: u32,
    /// Ioctl timeout, in milliseconds, configured for this channel.
    pub tmo_ms: u32,
}

/// Everything the rest of the crate needs from the kernel driver.
///
/// Implementors own the mmap'd buffer and meta regions; buffer contents are
/// exposed as plain byte slices so the ring manager and parser never touch
/// a raw pointer directly (Design Notes: "a slice/view type parameterised
/// by the lifetime of the mapping").
pub trait Driver: Send {
    /// `GET_INFO(channel, direction)`.
    fn channel_info(&self, channel: Channel, direction: Direction) -> Result<ChannelInfo>;

    /// Poll for the next DMA buffer, blocking up to `timeout`.
    fn read_data(
        &mut self,
        channel: Channel,
        direction: Direction,
        timeout: Duration,
    ) -> Result<ReadOutcome>;

    /// Borrow the live bytes of the buffer at ring slot `slot`.
    fn buffer(&self, channel: Channel, direction: Direction, slot: u32) -> &[u8];

    /// Mutably borrow the buffer at ring slot `slot`, so the ring manager
    /// can stamp its host-side buffer index into bytes `[4..8)`.
    fn buffer_mut(&mut self, channel: Channel, direction: Direction, slot: u32) -> &mut [u8];

    /// `BUF_GIVE`: return `count` buffers to the driver and advance its
    /// software index by `count`.
    fn give_buffers(&mut self, channel: Channel, direction: Direction, count: u16) -> Result<()>;

    /// `BUF_XMIT`: hand a TX buffer of `data.len()` bytes to the driver.
    fn xmit(&mut self, channel: Channel, data: &[u8]) -> Result<()>;

    /// `REG_ACCESS`.
    fn reg_access(&self, access: RegAccessArg) -> Result<u32>;

    /// `DCS_LOCK`.
    fn dcs_lock(&self) -> Result<DcsLockOutcome>;

    /// `DCS_RELEASE`.
    fn dcs_release(&self) -> Result<()>;

    /// `GET_VERSION`.
    fn get_version(&self) -> Result<String>;

    /// `DUMP`: best-effort diagnostic text, used only by
    /// [`crate::device::DiagnosticHook`] on the way out of a fatal error,
    /// never on the happy path.
    fn spy(&self, channel: Channel) -> String;
}

pub(crate) fn timeout_error(operation: &'static str, timeout: Duration) -> DriverError {
    let _ = operation;
    DriverError::Timeout(timeout)
}

pub mod fake;
pub mod linux;
