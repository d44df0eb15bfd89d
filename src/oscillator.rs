//! Oscillator Programmer: retunes a Si570-style I²C-programmable oscillator
//! to a new output frequency without rebooting the part, by solving for new
//! HSDIV/N1/RFREQ values against the crystal frequency implied by the
//! oscillator's *current* program.
//!
//! A single [`Oscillator`] type serves both the SERDES reference clock and
//! the DDR reference clock; they differ only in which I²C mux channel and
//! register pair they're reached through.

use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::ioctl::RegisterAddress;
use crate::link::reset_all_roc_links;
use crate::registers;

/// Valid HSDIV values, tried largest first so the smallest even N1 is found
/// before falling back to a smaller HSDIV.
const HSDIV_CANDIDATES: [u32; 6] = [11, 9, 7, 6, 5, 4];

/// Inclusive bounds on the DCO frequency, in Hz.
const DCO_MIN_HZ: f64 = 4.85e9;
const DCO_MAX_HZ: f64 = 5.67e9;

/// Retune is skipped if the requested frequency is already within this
/// fraction of the current one.
const RETUNE_THRESHOLD_PPM: f64 = 30.0;

/// Current HSDIV/N1/RFREQ decoded from a live oscillator.
#[derive(Copy, Clone, Debug, PartialEq)]
struct CurrentProgram {
    hsdiv: u32,
    n1: u32,
    rfreq: f64,
}

/// One I²C-programmable oscillator, identified by its mux channel and
/// register pair in [`registers`].
pub struct Oscillator {
    i2c_high: RegisterAddress,
    i2c_low: RegisterAddress,
    mux_channel: u8,
}

impl Oscillator {
    /// The SERDES reference clock oscillator.
    pub fn serdes() -> Self {
        Oscillator {
            i2c_high: registers::I2C_SERDES_HIGH,
            i2c_low: registers::I2C_SERDES_LOW,
            mux_channel: 0,
        }
    }

    /// The DDR reference clock oscillator.
    pub fn ddr() -> Self {
        Oscillator {
            i2c_high: registers::I2C_DDR_HIGH,
            i2c_low: registers::I2C_DDR_LOW,
            mux_channel: 1,
        }
    }

    fn read_byte(&self, driver: &dyn Driver, register: u8, firmware_design_date: &str) -> Result<u8> {
        let command = (u32::from(self.mux_channel) << 16) | (u32::from(register) << 8);
        let result = registers::i2c_transaction(
            driver,
            self.i2c_high,
            self.i2c_low,
            command,
            firmware_design_date,
        )?;
        Ok((result & 0xff) as u8)
    }

    fn write_byte(
        &self,
        driver: &dyn Driver,
        register: u8,
        value: u8,
        firmware_design_date: &str,
    ) -> Result<()> {
        let command = (u32::from(self.mux_channel) << 16) | (u32::from(register) << 8) | u32::from(value);
        registers::i2c_transaction(
            driver,
            self.i2c_high,
            self.i2c_low,
            command,
            firmware_design_date,
        )?;
        Ok(())
    }

    fn read_current_program(&self, driver: &dyn Driver, firmware_design_date: &str) -> Result<CurrentProgram> {
        let b7 = self.read_byte(driver, 7, firmware_design_date)?;
        let b8 = self.read_byte(driver, 8, firmware_design_date)?;
        let b9 = self.read_byte(driver, 9, firmware_design_date)?;
        let b10 = self.read_byte(driver, 10, firmware_design_date)?;
        let b11 = self.read_byte(driver, 11, firmware_design_date)?;
        let b12 = self.read_byte(driver, 12, firmware_design_date)?;

        let hs_code = (b7 >> 5) & 0x7;
        let hsdiv = u32::from(hs_code) + 4;
        let n1 = ((u32::from(b7) & 0x1f) << 2) | (u32::from(b8) >> 6);
        let n1 = n1 + 1;

        let rfreq_int = ((u32::from(b8) & 0x3f) as u64) << 28
            | (u32::from(b9) as u64) << 20
            | (u32::from(b10) as u64) << 12
            | (u32::from(b11) as u64) << 4
            | (u32::from(b12) as u64) >> 4;
        let rfreq = rfreq_int as f64 / (1u64 << 28) as f64;

        Ok(CurrentProgram { hsdiv, n1, rfreq })
    }

    fn write_program(
        &self,
        driver: &dyn Driver,
        hsdiv: u32,
        n1: u32,
        rfreq: f64,
        firmware_design_date: &str,
    ) -> Result<()> {
        if !HSDIV_CANDIDATES.contains(&hsdiv) {
            return Err(DriverError::InvalidOscillatorProgram(format!(
                "HSDIV {hsdiv} is not one of {HSDIV_CANDIDATES:?}"
            )));
        }
        if n1 == 0 || n1 > 128 || (n1 > 1 && n1 % 2 != 0) {
            return Err(DriverError::InvalidOscillatorProgram(format!(
                "N1 {n1} must be 1 or an even value in [2, 128]"
            )));
        }
        if rfreq <= 0.0 {
            return Err(DriverError::InvalidOscillatorProgram(format!(
                "RFREQ {rfreq} must be positive"
            )));
        }

        let rfreq_int = (rfreq * (1u64 << 28) as f64).round() as u64;
        let hs_code = (hsdiv - 4) as u8;
        let n1_field = (n1 - 1) as u32;

        let b7 = (hs_code << 5) | ((n1_field >> 2) & 0x1f) as u8;
        let b8 = (((n1_field & 0x3) << 6) as u8) | ((rfreq_int >> 28) & 0x3f) as u8;
        let b9 = ((rfreq_int >> 20) & 0xff) as u8;
        let b10 = ((rfreq_int >> 12) & 0xff) as u8;
        let b11 = ((rfreq_int >> 4) & 0xff) as u8;
        let b12 = ((rfreq_int & 0xf) << 4) as u8;

        // Freeze the DCO, then write byte 5 before the others so a
        // mid-write abort never leaves a half-programmed RFREQ observed
        // running.
        self.write_byte(driver, 137, 0x10, firmware_design_date)?;
        self.write_byte(driver, 5, 0, firmware_design_date)?;
        self.write_byte(driver, 7, b7, firmware_design_date)?;
        self.write_byte(driver, 8, b8, firmware_design_date)?;
        self.write_byte(driver, 9, b9, firmware_design_date)?;
        self.write_byte(driver, 10, b10, firmware_design_date)?;
        self.write_byte(driver, 11, b11, firmware_design_date)?;
        self.write_byte(driver, 12, b12, firmware_design_date)?;
        self.write_byte(driver, 137, 0x00, firmware_design_date)?;
        self.write_byte(driver, 135, 0x40, firmware_design_date)?;
        thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    /// Retune this oscillator's output to `target_hz`, given its current
    /// output frequency `current_hz`. A no-op if the two are already within
    /// 30ppm. Resets all six ROC SERDES links afterward, since their CDRs
    /// need to relock to the new reference.
    pub fn retune(
        &self,
        driver: &dyn Driver,
        current_hz: f64,
        target_hz: f64,
        firmware_design_date: &str,
    ) -> Result<()> {
        let threshold = target_hz * RETUNE_THRESHOLD_PPM / 1.0e6;
        if (target_hz - current_hz).abs() < threshold {
            debug!(current_hz, target_hz, "oscillator already within tolerance, skipping retune");
            return Ok(());
        }

        let program = self.read_current_program(driver, firmware_design_date)?;
        let f_xtal = current_hz * f64::from(program.hsdiv) * f64::from(program.n1) / program.rfreq;

        let (hsdiv, n1) = solve_hsdiv_n1(target_hz)?;
        let f_dco = f64::from(hsdiv) * f64::from(n1) * target_hz;
        let rfreq_new = f_dco / f_xtal;

        info!(
            target_hz,
            hsdiv, n1, rfreq_new, "retuning oscillator"
        );
        self.write_program(driver, hsdiv, n1, rfreq_new, firmware_design_date)?;
        reset_all_roc_links(driver, firmware_design_date)?;
        Ok(())
    }
}

/// Find the smallest valid (HSDIV, N1) pair, trying HSDIV candidates in
/// descending order, such that `HSDIV * N1 * f_target` lands within the
/// DCO's valid band.
fn solve_hsdiv_n1(f_target: f64) -> Result<(u32, u32)> {
    for &hsdiv in &HSDIV_CANDIDATES {
        let mut n1 = 1u32;
        loop {
            let f_dco = f64::from(hsdiv) * f64::from(n1) * f_target;
            if f_dco > DCO_MAX_HZ {
                break;
            }
            if f_dco >= DCO_MIN_HZ {
                return Ok((hsdiv, n1));
            }
            n1 = if n1 == 1 { 2 } else { n1 + 2 };
            if n1 > 128 {
                break;
            }
        }
    }
    Err(DriverError::InvalidOscillatorProgram(format!(
        "no HSDIV/N1 pair keeps f_dco in [{DCO_MIN_HZ}, {DCO_MAX_HZ}] for target {f_target} Hz"
    )))
}
