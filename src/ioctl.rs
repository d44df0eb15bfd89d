//! Wire contract with the kernel driver.
//!
//! The ioctl codes and struct layouts here are an external contract owned
//! by the kernel driver, not something this crate is free to redesign. The
//! magic number and sequence below follow the conventional Linux ioctl encoding
//! (`_IOC`-style: an 8-bit "type" identifying the driver, a sequence number,
//! and a size) and are placeholders for whatever the shipped driver header
//! defines; a real deployment pins these to the driver's `<uapi>` header.

use std::time::Duration;

/// Ioctl "type" byte identifying this driver, analogous to the `'D'` used
/// by the v4l2/DRM convention for "device".
const IOC_MAGIC: u8 = 0xd7;

nix::ioctl_readwrite!(ioctl_get_info, IOC_MAGIC, 1, GetInfoArg);
nix::ioctl_write_ptr!(ioctl_buf_give, IOC_MAGIC, 2, BufGiveArg);
nix::ioctl_write_ptr!(ioctl_buf_xmit, IOC_MAGIC, 3, BufXmitArg);
nix::ioctl_readwrite!(ioctl_reg_access, IOC_MAGIC, 4, RegAccessArg);
nix::ioctl_none!(ioctl_dcs_lock, IOC_MAGIC, 5);
nix::ioctl_none!(ioctl_dcs_release, IOC_MAGIC, 6);
nix::ioctl_read!(ioctl_dump, IOC_MAGIC, 7, DumpArg);
nix::ioctl_read_buf!(ioctl_get_version, IOC_MAGIC, 8, u8);

/// One of the two DMA engines.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// High-rate, single-consumer readout DMA channel.
    Daq = 0,
    /// Low-rate, bidirectional, cross-process-shared control channel.
    Dcs = 1,
}

/// Transfer direction of a DMA channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Card-to-host.
    C2H = 0,
    /// Host-to-card.
    H2C = 1,
}

/// A 16-bit register address. The verification mask for a given address is
/// looked up in the table owned by [`crate::registers`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress(pub u16);

impl std::fmt::Debug for RegisterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl std::fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl From<u16> for RegisterAddress {
    fn from(v: u16) -> Self {
        RegisterAddress(v)
    }
}

/// `GET_INFO(channel, direction) -> {num_buffs, buff_size, hw_idx, sw_idx, tmo_ms}`.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct GetInfoArg {
    pub(crate) channel: u8,
    pub(crate) direction: u8,
    pub num_buffs: u32,
    pub buff_size: u32,
    pub hw_idx: u32,
    pub sw_idx: u32,
    pub tmo_ms: u32,
}

/// `BUF_GIVE(channel<<24 | direction<<16 | count)` — return `count` buffers.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct BufGiveArg {
    pub(crate) channel: u8,
    pub(crate) direction: u8,
    pub(crate) count: u16,
}

/// `BUF_XMIT(channel<<24 | bytes)` — hand a TX buffer to the driver.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct BufXmitArg {
    pub(crate) channel: u8,
    pub(crate) bytes: u32,
}

/// The three access modes a [`RegAccessArg`] can request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RegAccessKind {
    /// Plain read.
    Read = 0,
    /// Plain write, no readback.
    Write = 1,
    /// Write, then read back for verification.
    WriteReadback = 2,
}

/// `REG_ACCESS({offset, access_type, val})`.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct RegAccessArg {
    pub offset: u16,
    pub access_type: u8,
    pub val: u32,
}

/// `DUMP` diagnostic payload.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct DumpArg {
    pub buf: [u8; 4096],
    pub len: u32,
}

impl Default for DumpArg {
    fn default() -> Self {
        DumpArg { buf: [0; 4096], len: 0 }
    }
}

/// Default ioctl timeout for blocking `read_data` polls.
pub const READ_DATA_POLL_TIMEOUT: Duration = Duration::from_millis(100);
