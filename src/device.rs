//! Device Handle: the top-level entry point. Owns the open driver, the
//! per-channel ring state, and the DCS lock; exposes `get_data` and the
//! thin per-card wrappers.

use std::ops::{Deref, DerefMut};

use tracing::error;

use crate::config::{CardKind, DeviceConfig};
use crate::dcs::DcsLock;
use crate::driver::linux::LinuxDriver;
use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::ioctl::{Channel, Direction, READ_DATA_POLL_TIMEOUT};
use crate::parser;
use crate::record::SubEventRecord;
use crate::ring::RingState;
use crate::types::EventWindowTag;

/// Called with a diagnostic register/ring dump just before a fatal error
/// propagates out of [`DeviceHandle::get_data`]. Never invoked on the happy
/// path.
pub type DiagnosticHook = Box<dyn Fn(&str) + Send + Sync>;

/// Owns the open device and the per-channel state machines. Generic over
/// [`Driver`] so tests can substitute [`crate::driver::fake::FakeDriver`].
pub struct DeviceHandle<D: Driver> {
    driver: D,
    config: DeviceConfig,
    daq_ring: RingState,
    dcs_ring: RingState,
    dcs_lock: DcsLock,
    firmware_design_date: String,
    diagnostic_hook: Option<DiagnosticHook>,
}

impl DeviceHandle<LinuxDriver> {
    /// Open the real character device for `card_kind`, resolving its index
    /// and simulator mode from the environment, and verify its firmware
    /// design date matches `expected_firmware_design_date`.
    pub fn open(card_kind: CardKind, expected_firmware_design_date: &str) -> Result<Self> {
        let config = DeviceConfig::from_env(card_kind);
        let driver = LinuxDriver::open(&config)?;
        Self::new(driver, config, expected_firmware_design_date)
    }
}

impl<D: Driver> DeviceHandle<D> {
    /// Construct a handle over an already-open driver, checking its
    /// firmware design date against `expected_firmware_design_date`.
    pub fn new(driver: D, config: DeviceConfig, expected_firmware_design_date: &str) -> Result<Self> {
        let found = driver.get_version()?;
        if found != expected_firmware_design_date {
            return Err(DriverError::VersionMismatch {
                expected: expected_firmware_design_date.to_string(),
                found,
            });
        }
        Ok(DeviceHandle {
            driver,
            config,
            daq_ring: RingState::new(Channel::Daq, Direction::C2H),
            dcs_ring: RingState::new(Channel::Dcs, Direction::C2H),
            dcs_lock: DcsLock::default(),
            firmware_design_date: expected_firmware_design_date.to_string(),
            diagnostic_hook: None,
        })
    }

    /// Install (or replace) the diagnostic hook.
    pub fn set_diagnostic_hook(&mut self, hook: DiagnosticHook) {
        self.diagnostic_hook = Some(hook);
    }

    /// The resolved configuration this handle was opened with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The firmware design date this handle verified at construction.
    pub fn firmware_design_date(&self) -> &str {
        &self.firmware_design_date
    }

    fn raise_with_diagnostics(&self, err: DriverError) -> DriverError {
        if let Some(hook) = &self.diagnostic_hook {
            let dump = self.driver.spy(Channel::Daq);
            error!(error = %err, "fatal error, running diagnostic hook");
            hook(&dump);
        }
        err
    }

    /// `GetData(expectedTag, matchExact)`: releases buffers from the prior
    /// call, tries up to 3 times to acquire a fresh buffer and parse it,
    /// handles the exact-match rewind, and nulls the read pointer on any
    /// parser-raised error before re-raising.
    pub fn get_data(
        &mut self,
        expected_tag: EventWindowTag,
        match_exact: bool,
    ) -> Result<Vec<SubEventRecord>> {
        self.daq_ring.release_stale(&mut self.driver)?;

        let mut records = Vec::new();
        for _ in 0..3 {
            if self.daq_ring.needs_fresh_buffer() || self.daq_ring.held_len() == 0 {
                let got = self
                    .daq_ring
                    .acquire_fresh_buffer(&mut self.driver, READ_DATA_POLL_TIMEOUT)
                    .map_err(|e| self.raise_with_diagnostics(e))?;
                if !got {
                    continue;
                }
            }

            match parser::parse_records(&mut self.daq_ring, &self.driver) {
                Ok(r) => {
                    records = r;
                    break;
                }
                Err(e) => {
                    self.daq_ring.clear_read_offset();
                    return Err(self.raise_with_diagnostics(e));
                }
            }
        }

        if match_exact {
            if let Some(first) = records.first() {
                if first.tag != expected_tag {
                    self.daq_ring.rewind_to_snapshot();
                    return Ok(Vec::new());
                }
            }
        }

        Ok(records)
    }

    /// Release every buffer currently held on the DAQ channel back to the
    /// driver and null the read pointer, unconditionally.
    pub fn reset_daq(&mut self) -> Result<()> {
        self.daq_ring.release_all(&mut self.driver)?;
        self.daq_ring.clear_read_offset();
        Ok(())
    }

    /// Release every buffer currently held on the DCS channel back to the
    /// driver and null the read pointer, unconditionally.
    pub fn reset_dcs(&mut self) -> Result<()> {
        self.dcs_ring.release_all(&mut self.driver)?;
        self.dcs_ring.clear_read_offset();
        Ok(())
    }

    /// Acquire the DCS lock for the calling thread.
    pub fn acquire_dcs_lock(&self) -> Result<()> {
        self.dcs_lock.acquire(&self.driver)
    }

    /// Release one level of the calling thread's DCS lock reentrancy.
    pub fn release_dcs_lock(&self) -> Result<()> {
        self.dcs_lock.release(&self.driver)
    }

    /// Send `bytes` on the DCS channel's bidirectional packet path. The
    /// caller must hold the DCS lock.
    pub fn write_dcs_packet(&mut self, bytes: &[u8]) -> Result<()> {
        self.dcs_lock.assert_held_by_caller()?;
        self.driver.xmit(Channel::Dcs, bytes)
    }

    /// Read the next packet off the DCS channel. The caller must hold the
    /// DCS lock. Returns an empty vector if no packet is available within
    /// the poll timeout.
    pub fn read_dcs_packet(&mut self) -> Result<Vec<u8>> {
        self.dcs_lock.assert_held_by_caller()?;
        if self.dcs_ring.needs_fresh_buffer() || self.dcs_ring.held_len() == 0 {
            let got = self
                .dcs_ring
                .acquire_fresh_buffer(&mut self.driver, READ_DATA_POLL_TIMEOUT)?;
            if !got {
                return Ok(Vec::new());
            }
        }
        let meta = self
            .dcs_ring
            .current_meta_byte_count(&self.driver)
            .unwrap_or(0);
        let live = self
            .dcs_ring
            .current_live_region(&self.driver)
            .unwrap_or(&[]);
        let len = (meta.saturating_sub(1) as usize).min(live.len());
        let packet = live[..len].to_vec();
        self.dcs_ring.clear_read_offset();
        Ok(packet)
    }

    /// Borrow the underlying driver, for components (registers, link,
    /// oscillator) that take `&dyn Driver` directly.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

/// Thin Command/Fan-Out card wrapper. All behavior is inherited from
/// [`DeviceHandle`]; this only fixes the card kind at construction.
pub struct Cfo<D: Driver = LinuxDriver>(DeviceHandle<D>);

impl Cfo<LinuxDriver> {
    /// Open `/dev/cfo<N>` and verify its firmware design date.
    pub fn open(expected_firmware_design_date: &str) -> Result<Self> {
        Ok(Cfo(DeviceHandle::open(
            CardKind::Cfo,
            expected_firmware_design_date,
        )?))
    }
}

impl<D: Driver> Deref for Cfo<D> {
    type Target = DeviceHandle<D>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<D: Driver> DerefMut for Cfo<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Thin Data-Transfer Card wrapper. All behavior is inherited from
/// [`DeviceHandle`]; this only fixes the card kind at construction.
pub struct Dtc<D: Driver = LinuxDriver>(DeviceHandle<D>);

impl Dtc<LinuxDriver> {
    /// Open `/dev/dtc<N>` and verify its firmware design date.
    pub fn open(expected_firmware_design_date: &str) -> Result<Self> {
        Ok(Dtc(DeviceHandle::open(
            CardKind::Dtc,
            expected_firmware_design_date,
        )?))
    }
}

impl<D: Driver> Deref for Dtc<D> {
    type Target = DeviceHandle<D>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<D: Driver> DerefMut for Dtc<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
