//! Real character-device backed [`Driver`] implementation.
//!
//! Opens `/dev/<stem><N>`, `mmap`s the buffer and meta regions for each
//! (channel, direction) pair, and issues the ioctls defined in
//! [`crate::ioctl`]. The mmap/ioctl idiom (raw fd, `nix::sys::mman::mmap`,
//! `munmap` on drop) follows `ssbanerje-rs-perf-utils`'s `RingBuffer`
//! (`other_examples/.../src-perf-mmap.rs.rs`) and `whitequark-thunderscope-rs`'s
//! `sys` driver (`other_examples/.../src-device.rs.rs`).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::time::Duration;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::config::DeviceConfig;
use crate::error::{DriverError, Result};
use crate::ioctl::{
    self, BufGiveArg, BufXmitArg, Channel, Direction, DumpArg, GetInfoArg, RegAccessArg,
};

use super::{ChannelInfo, DcsLockOutcome, Driver, ReadOutcome};

/// Which of the two mmap'd sub-regions of a (channel, direction) pair this
/// is. Offsets into the device file are encoded as
/// `chn << CHANNEL_SHIFT | dir << DIRECTION_SHIFT | map << MAP_SHIFT`.
#[derive(Copy, Clone)]
enum MapKind {
    Buffer = 0,
    Meta = 1,
}

const CHANNEL_SHIFT: u64 = 32;
const DIRECTION_SHIFT: u64 = 28;
const MAP_SHIFT: u64 = 24;

fn mmap_offset(channel: Channel, direction: Direction, map: MapKind) -> libc::off_t {
    let offset = ((channel as u64) << CHANNEL_SHIFT)
        | ((direction as u64) << DIRECTION_SHIFT)
        | ((map as u64) << MAP_SHIFT);
    offset as libc::off_t
}

struct Mapping {
    buf_ptr: NonNull<u8>,
    buf_len: usize,
    meta_ptr: NonNull<u8>,
    num_buffs: u32,
    buff_size: u32,
}

// SAFETY: the mapping is only ever dereferenced through `&`/`&mut [u8]`
// borrows scoped to a single call, guarded by the owning `LinuxDriver`.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.buf_ptr.as_ptr().cast(), self.buf_len);
            let _ = munmap(self.meta_ptr.as_ptr().cast(), self.num_buffs as usize * 4);
        }
    }
}

/// Host-side character-device driver backed by the kernel DMA driver.
pub struct LinuxDriver {
    file: File,
    mappings: HashMap<(Channel, Direction), Mapping>,
}

impl LinuxDriver {
    /// Open the device named by `config` and map every (channel, direction)
    /// region up front.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let path = config.device_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| DriverError::io("open device", e))?;

        let mut driver = LinuxDriver {
            file,
            mappings: HashMap::new(),
        };

        for &channel in &[Channel::Daq, Channel::Dcs] {
            for &direction in &[Direction::C2H, Direction::H2C] {
                driver.map_channel(channel, direction)?;
            }
        }

        Ok(driver)
    }

    fn map_channel(&mut self, channel: Channel, direction: Direction) -> Result<()> {
        let info = self.channel_info(channel, direction)?;
        if info.num_buffs == 0 {
            // Direction not implemented for this channel (e.g. DAQ H2C is
            // unused); nothing to map.
            return Ok(());
        }

        let fd = self.file.as_raw_fd();
        let buf_len = info.num_buffs as usize * info.buff_size as usize;
        let meta_len = info.num_buffs as usize * 4;

        let buf_ptr = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(buf_len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                mmap_offset(channel, direction, MapKind::Buffer),
            )
            .map_err(|e| DriverError::io("mmap buffer region", std::io::Error::from(e)))?
        };
        let meta_ptr = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(meta_len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                mmap_offset(channel, direction, MapKind::Meta),
            )
            .map_err(|e| DriverError::io("mmap meta region", std::io::Error::from(e)))?
        };

        self.mappings.insert(
            (channel, direction),
            Mapping {
                buf_ptr: NonNull::new(buf_ptr.cast()).expect("mmap returned non-null"),
                buf_len,
                meta_ptr: NonNull::new(meta_ptr.cast()).expect("mmap returned non-null"),
                num_buffs: info.num_buffs,
                buff_size: info.buff_size,
            },
        );
        Ok(())
    }

    fn mapping(&self, channel: Channel, direction: Direction) -> &Mapping {
        self.mappings
            .get(&(channel, direction))
            .expect("channel/direction not mapped")
    }
}

impl Driver for LinuxDriver {
    fn channel_info(&self, channel: Channel, direction: Direction) -> Result<ChannelInfo> {
        let mut arg = GetInfoArg {
            channel: channel as u8,
            direction: direction as u8,
            ..Default::default()
        };
        unsafe { ioctl::ioctl_get_info(self.file.as_raw_fd(), &mut arg) }
            .map_err(|e| DriverError::io("GET_INFO", std::io::Error::from(e)))?;
        Ok(ChannelInfo {
            num_buffs: arg.num_buffs,
            buff_size: arg.buff_size,
            hw_idx: arg.hw_idx,
            sw_idx: arg.sw_idx,
            tmo_ms: arg.tmo_ms,
        })
    }

    fn read_data(
        &mut self,
        channel: Channel,
        direction: Direction,
        timeout: Duration,
    ) -> Result<ReadOutcome> {
        // The kernel driver exposes "next buffer available" through its own
        // hw/sw index pair; we poll GET_INFO at the channel's configured
        // cadence until hw_idx has advanced past sw_idx or `timeout` elapses.
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let info = self.channel_info(channel, direction)?;
            if info.hw_idx != info.sw_idx {
                return Ok(ReadOutcome::Buffer { slot: info.sw_idx });
            }
            if std::time::Instant::now() >= deadline {
                return Ok(ReadOutcome::Timeout);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    fn buffer(&self, channel: Channel, direction: Direction, slot: u32) -> &[u8] {
        let mapping = self.mapping(channel, direction);
        let start = slot as usize * mapping.buff_size as usize;
        unsafe {
            std::slice::from_raw_parts(
                mapping.buf_ptr.as_ptr().add(start),
                mapping.buff_size as usize,
            )
        }
    }

    fn buffer_mut(&mut self, channel: Channel, direction: Direction, slot: u32) -> &mut [u8] {
        let mapping = self.mapping(channel, direction);
        let start = slot as usize * mapping.buff_size as usize;
        unsafe {
            std::slice::from_raw_parts_mut(
                mapping.buf_ptr.as_ptr().add(start),
                mapping.buff_size as usize,
            )
        }
    }

    fn give_buffers(&mut self, channel: Channel, direction: Direction, count: u16) -> Result<()> {
        let arg = BufGiveArg {
            channel: channel as u8,
            direction: direction as u8,
            count,
        };
        unsafe { ioctl::ioctl_buf_give(self.file.as_raw_fd(), &arg) }
            .map_err(|e| DriverError::io("BUF_GIVE", std::io::Error::from(e)))?;
        Ok(())
    }

    fn xmit(&mut self, channel: Channel, data: &[u8]) -> Result<()> {
        let arg = BufXmitArg {
            channel: channel as u8,
            bytes: data.len() as u32,
        };
        unsafe { ioctl::ioctl_buf_xmit(self.file.as_raw_fd(), &arg) }
            .map_err(|e| DriverError::io("BUF_XMIT", std::io::Error::from(e)))?;
        Ok(())
    }

    fn reg_access(&self, access: RegAccessArg) -> Result<u32> {
        let mut arg = access;
        unsafe { ioctl::ioctl_reg_access(self.file.as_raw_fd(), &mut arg) }
            .map_err(|e| DriverError::io("REG_ACCESS", std::io::Error::from(e)))?;
        Ok(arg.val)
    }

    fn dcs_lock(&self) -> Result<DcsLockOutcome> {
        match unsafe { ioctl::ioctl_dcs_lock(self.file.as_raw_fd()) } {
            Ok(_) => Ok(DcsLockOutcome::Acquired),
            Err(nix::errno::Errno::EAGAIN) => Ok(DcsLockOutcome::Retry),
            Err(nix::errno::Errno::ENOTTY) => Ok(DcsLockOutcome::Unsupported),
            Err(e) => Err(DriverError::io("DCS_LOCK", std::io::Error::from(e))),
        }
    }

    fn dcs_release(&self) -> Result<()> {
        unsafe { ioctl::ioctl_dcs_release(self.file.as_raw_fd()) }
            .map_err(|e| DriverError::io("DCS_RELEASE", std::io::Error::from(e)))?;
        Ok(())
    }

    fn get_version(&self) -> Result<String> {
        let mut buf = [0u8; 64];
        let n = unsafe { ioctl::ioctl_get_version(self.file.as_raw_fd(), &mut buf[..]) }
            .map_err(|e| DriverError::io("GET_VERSION", std::io::Error::from(e)))?;
        Ok(String::from_utf8_lossy(&buf[..n as usize]).into_owned())
    }

    fn spy(&self, _channel: Channel) -> String {
        let mut arg = DumpArg::default();
        match unsafe { ioctl::ioctl_dump(self.file.as_raw_fd(), &mut arg) } {
            Ok(_) => String::from_utf8_lossy(&arg.buf[..arg.len as usize]).into_owned(),
            Err(e) => format!("<DUMP ioctl failed: {e}>"),
        }
    }
}
