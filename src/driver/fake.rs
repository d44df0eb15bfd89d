//! An in-memory [`Driver`] used by this crate's own tests, and available to
//! integration tests under `tests/`. Modeled on the fake/loopback drivers
//! commonly paired with a hardware trait like `thunderscope`'s `sys::Driver`
//! so the ring manager, parser, DCS lock, and oscillator programmer can be
//! exercised without a physical card.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Result;
use crate::ioctl::{Channel, Direction, RegAccessArg, RegAccessKind};

use super::{ChannelInfo, DcsLockOutcome, Driver, ReadOutcome};

/// A single queued delivery: the ring slot it lands in, and the bytes the
/// card "wrote" there.
struct Delivery {
    slot: u32,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct ChannelState {
    buff_size: u32,
    slots: Vec<Vec<u8>>,
    pending: VecDeque<Delivery>,
    /// Slot index of the last buffer delivered, used to redeliver the same
    /// slot when `redeliver_last` is armed.
    last_delivered_slot: Option<u32>,
    redeliver_last: bool,
    released_count: u32,
}

/// Fake [`Driver`] backed by `Vec<u8>` buffers instead of an mmap'd region.
///
/// Register-like state lives behind `Mutex`/`AtomicBool` so `reg_access`,
/// `dcs_lock`, and friends can honor the trait's `&self` signature (the real
/// driver's register writes are a syscall, not a mutation of the
/// `LinuxDriver` value itself) while keeping the whole type `Sync`, which
/// the DCS lock tests need to share one fake across threads.
pub struct FakeDriver {
    /// Buffer storage is mutated only through `&mut self` methods
    /// (`read_data`, `buffer_mut`, `give_buffers`, and the `push_*`/`arm_*`
    /// test seams below), so it needs no interior mutability.
    channels: HashMap<(Channel, Direction), ChannelState>,
    registers: Mutex<HashMap<u16, u32>>,
    /// addr -> remaining poll reads before a self-clearing "go" bit (bit 0)
    /// reads back clear.
    self_clearing_countdown: Mutex<HashMap<u16, u32>>,
    /// addr -> queued values to hand back on successive plain reads, for
    /// registers (like an I²C result byte) whose value depends on which
    /// transaction was last issued rather than on what was last written.
    register_read_script: Mutex<HashMap<u16, VecDeque<u32>>>,
    dcs_lock_script: Mutex<VecDeque<DcsLockOutcome>>,
    version: String,
    fail_next_reg_access: AtomicBool,
}

impl FakeDriver {
    /// Construct a fake with `num_buffs` empty slots of `buff_size` bytes
    /// allocated for every (channel, direction) pair.
    pub fn new(num_buffs: u32, buff_size: u32) -> Self {
        let mut channels = HashMap::new();
        for &channel in &[Channel::Daq, Channel::Dcs] {
            for &direction in &[Direction::C2H, Direction::H2C] {
                channels.insert(
                    (channel, direction),
                    ChannelState {
                        buff_size,
                        slots: vec![vec![0u8; buff_size as usize]; num_buffs as usize],
                        ..Default::default()
                    },
                );
            }
        }
        FakeDriver {
            channels,
            registers: Mutex::new(HashMap::new()),
            self_clearing_countdown: Mutex::new(HashMap::new()),
            register_read_script: Mutex::new(HashMap::new()),
            dcs_lock_script: Mutex::new(VecDeque::new()),
            version: "fake-version-1".to_string(),
            fail_next_reg_access: AtomicBool::new(false),
        }
    }

    /// Queue `bytes` (padded/truncated to the channel's buffer size) for
    /// delivery at the next free ring slot on `channel`/`direction`.
    pub fn push_buffer(&mut self, channel: Channel, direction: Direction, bytes: Vec<u8>) {
        let state = self.channels.get_mut(&(channel, direction)).unwrap();
        assert!(
            bytes.len() <= state.buff_size as usize,
            "buffer contents exceed configured buffer size"
        );
        let slot = (state.pending.len() as u32) % state.slots.len().max(1) as u32;
        state.pending.push_back(Delivery { slot, bytes });
    }

    /// Arm a one-shot "driver redelivered the same buffer" response on the
    /// next `read_data` call for this channel/direction.
    pub fn arm_redeliver_last(&mut self, channel: Channel, direction: Direction) {
        self.channels
            .get_mut(&(channel, direction))
            .unwrap()
            .redeliver_last = true;
    }

    /// How many buffers have been released via `give_buffers` on this
    /// channel/direction so far.
    pub fn released_count(&self, channel: Channel, direction: Direction) -> u32 {
        self.channels[&(channel, direction)].released_count
    }

    /// Seed a register's initial value.
    pub fn set_register(&mut self, addr: u16, value: u32) {
        self.registers.lock().unwrap().insert(addr, value);
    }

    /// Read a register's current value.
    pub fn get_register(&self, addr: u16) -> u32 {
        *self.registers.lock().unwrap().get(&addr).unwrap_or(&0)
    }

    /// Mark `addr` as a self-clearing "go" register: the next
    /// `reads_before_clear` reads observe bit 0 set; after that, reads
    /// observe the stored value with bit 0 forced clear.
    pub fn arm_self_clearing(&mut self, addr: u16, reads_before_clear: u32) {
        self.self_clearing_countdown
            .lock()
            .unwrap()
            .insert(addr, reads_before_clear);
    }

    /// Script the sequence of outcomes returned by successive `dcs_lock`
    /// calls; once exhausted, further calls return `Acquired`.
    pub fn script_dcs_lock(&mut self, outcomes: impl IntoIterator<Item = DcsLockOutcome>) {
        self.dcs_lock_script.lock().unwrap().extend(outcomes);
    }

    /// Script the sequence of values returned by successive plain reads of
    /// `addr`; once exhausted, reads fall back to the register's stored
    /// value. Models a register (like an I²C low-word result byte) whose
    /// value depends on which transaction was last issued.
    pub fn script_register_reads(&mut self, addr: u16, values: impl IntoIterator<Item = u32>) {
        self.register_read_script
            .lock()
            .unwrap()
            .entry(addr)
            .or_default()
            .extend(values);
    }

    /// Force the next `reg_access` call to fail with an I/O error.
    pub fn fail_next_reg_access(&mut self) {
        self.fail_next_reg_access.store(true, Ordering::SeqCst);
    }
}

fn decode_access_kind(v: u8) -> RegAccessKind {
    match v {
        0 => RegAccessKind::Read,
        1 => RegAccessKind::Write,
        _ => RegAccessKind::WriteReadback,
    }
}

impl Driver for FakeDriver {
    fn channel_info(&self, channel: Channel, direction: Direction) -> Result<ChannelInfo> {
        let state = &self.channels[&(channel, direction)];
        Ok(ChannelInfo {
            num_buffs: state.slots.len() as u32,
            buff_size: state.buff_size,
            hw_idx: 0,
            sw_idx: 0,
            tmo_ms: 100,
        })
    }

    fn read_data(
        &mut self,
        channel: Channel,
        direction: Direction,
        _timeout: Duration,
    ) -> Result<ReadOutcome> {
        let state = self.channels.get_mut(&(channel, direction)).unwrap();

        if state.redeliver_last {
            state.redeliver_last = false;
            return Ok(ReadOutcome::Buffer {
                slot: state.last_delivered_slot.unwrap_or(0),
            });
        }

        match state.pending.pop_front() {
            Some(delivery) => {
                let slot_len = state.slots[delivery.slot as usize].len();
                let mut bytes = delivery.bytes;
                bytes.resize(slot_len, 0);
                state.slots[delivery.slot as usize] = bytes;
                state.last_delivered_slot = Some(delivery.slot);
                Ok(ReadOutcome::Buffer { slot: delivery.slot })
            }
            None => Ok(ReadOutcome::Timeout),
        }
    }

    fn buffer(&self, channel: Channel, direction: Direction, slot: u32) -> &[u8] {
        &self.channels[&(channel, direction)].slots[slot as usize]
    }

    fn buffer_mut(&mut self, channel: Channel, direction: Direction, slot: u32) -> &mut [u8] {
        &mut self
            .channels
            .get_mut(&(channel, direction))
            .unwrap()
            .slots[slot as usize]
    }

    fn give_buffers(&mut self, channel: Channel, direction: Direction, count: u16) -> Result<()> {
        self.channels
            .get_mut(&(channel, direction))
            .unwrap()
            .released_count += count as u32;
        Ok(())
    }

    fn xmit(&mut self, _channel: Channel, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn reg_access(&self, access: RegAccessArg) -> Result<u32> {
        if self.fail_next_reg_access.swap(false, Ordering::SeqCst) {
            return Err(crate::error::DriverError::io(
                "REG_ACCESS",
                std::io::Error::new(std::io::ErrorKind::Other, "fake I/O failure"),
            ));
        }

        let kind = decode_access_kind(access.access_type);

        if matches!(kind, RegAccessKind::Write | RegAccessKind::WriteReadback) {
            self.registers
                .lock()
                .unwrap()
                .insert(access.offset, access.val);
            if let Some(countdown) = self
                .self_clearing_countdown
                .lock()
                .unwrap()
                .get_mut(&access.offset)
            {
                // Arm the countdown fresh on every write, as a real "go" bit
                // would be re-armed by the next transaction.
                *countdown = (*countdown).max(1);
            }
        }

        let scripted = if kind == RegAccessKind::Read {
            self.register_read_script
                .lock()
                .unwrap()
                .get_mut(&access.offset)
                .and_then(VecDeque::pop_front)
        } else {
            None
        };

        let mut stored = scripted.unwrap_or_else(|| {
            *self
                .registers
                .lock()
                .unwrap()
                .get(&access.offset)
                .unwrap_or(&0)
        });

        if let Some(countdown) = self
            .self_clearing_countdown
            .lock()
            .unwrap()
            .get_mut(&access.offset)
        {
            if *countdown > 0 {
                stored |= 1;
                *countdown -= 1;
            } else {
                stored &= !1u32;
            }
        }

        Ok(stored)
    }

    fn dcs_lock(&self) -> Result<DcsLockOutcome> {
        Ok(self
            .dcs_lock_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DcsLockOutcome::Acquired))
    }

    fn dcs_release(&self) -> Result<()> {
        Ok(())
    }

    fn get_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    fn spy(&self, _channel: Channel) -> String {
        "<fake spy dump>".to_string()
    }
}
