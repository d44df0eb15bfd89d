//! Register Gateway: the uniform read/write/write-with-readback path,
//! including the per-family "don't-care-bit" verify masks and the
//! self-clearing I²C "go" bit poll.
//!
//! The concrete addresses below beyond Control (0x9100), Link Enable
//! (0x9114), SERDES Reset (0x9118), and Reset-Done (0x9138) are placeholders
//! for the real firmware header, same posture as the ioctl magic number in
//! [`crate::ioctl`] — a real deployment pins these to firmware's published
//! address map.

use std::thread;
use std::time::Duration;

use tracing::{trace, warn};

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::ioctl::{RegAccessArg, RegAccessKind, RegisterAddress};

/// Control register: has a write-only reset bit at bit 31.
pub const CONTROL: RegisterAddress = RegisterAddress(0x9100);
/// Per-ROC-link enable bits.
pub const LINK_ENABLE: RegisterAddress = RegisterAddress(0x9114);
/// Per-link SERDES reset bits.
pub const SERDES_RESET: RegisterAddress = RegisterAddress(0x9118);
/// Per-link reset-done status bits.
pub const RESET_DONE: RegisterAddress = RegisterAddress(0x9138);
/// I²C bus low word (data) for the SERDES oscillator.
pub const I2C_SERDES_LOW: RegisterAddress = RegisterAddress(0x9140);
/// I²C bus high word (command / go bit) for the SERDES oscillator.
pub const I2C_SERDES_HIGH: RegisterAddress = RegisterAddress(0x9144);
/// I²C bus low word (data) for the DDR oscillator.
pub const I2C_DDR_LOW: RegisterAddress = RegisterAddress(0x9148);
/// I²C bus high word (command / go bit) for the DDR oscillator.
pub const I2C_DDR_HIGH: RegisterAddress = RegisterAddress(0x914c);
/// Jitter-attenuator control/status register.
pub const JITTER_ATTENUATOR_CSR: RegisterAddress = RegisterAddress(0x9150);
/// Cable-delay control register.
pub const CABLE_DELAY_CONTROL: RegisterAddress = RegisterAddress(0x9154);
/// Self-clearing per-link counter-reset register.
pub const COUNTER_RESET: RegisterAddress = RegisterAddress(0x9158);
/// Per-link combined ready status: PLL-locked, RX/TX reset-done, and
/// CDR-locked, one 4-bit field per link.
pub const LINK_STATUS: RegisterAddress = RegisterAddress(0x915c);

const GO_BIT: u32 = 1 << 0;
const CONTROL_RESET_BIT: u32 = 1 << 31;
const JITTER_ATTENUATOR_SELECT_MASK: u32 = 0b11;

const GO_BIT_POLL_INTERVAL: Duration = Duration::from_millis(1);
const GO_BIT_POLL_ITERATIONS: u32 = 1000;

/// How a register family's write-then-readback comparison is shaped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum VerifyRule {
    /// Compare the full 32 bits.
    Exact,
    /// Mask out the lower 16 bits (carries the last I²C read's return byte).
    MaskLowWord,
    /// Poll bit 0 clear before comparing, then mask it out of the compare.
    GoBit,
    /// Mask out bit 31 (write-only reset strobe).
    MaskResetBit31,
    /// Compare only the 2-bit input-select field.
    JitterAttenuatorSelect,
    /// Skip the readback comparison entirely.
    Skip,
}

fn classify(addr: RegisterAddress) -> VerifyRule {
    match addr {
        CONTROL => VerifyRule::MaskResetBit31,
        I2C_SERDES_LOW | I2C_DDR_LOW => VerifyRule::MaskLowWord,
        I2C_SERDES_HIGH | I2C_DDR_HIGH => VerifyRule::GoBit,
        JITTER_ATTENUATOR_CSR => VerifyRule::JitterAttenuatorSelect,
        CABLE_DELAY_CONTROL | COUNTER_RESET => VerifyRule::Skip,
        _ => VerifyRule::Exact,
    }
}

fn compare_mask(rule: VerifyRule) -> u32 {
    match rule {
        VerifyRule::Exact => u32::MAX,
        VerifyRule::MaskLowWord => 0xffff_0000,
        VerifyRule::GoBit => !GO_BIT,
        VerifyRule::MaskResetBit31 => !CONTROL_RESET_BIT,
        VerifyRule::JitterAttenuatorSelect => JITTER_ATTENUATOR_SELECT_MASK,
        VerifyRule::Skip => 0,
    }
}

fn reg_read(driver: &dyn Driver, addr: RegisterAddress) -> Result<u32> {
    driver.reg_access(RegAccessArg {
        offset: addr.0,
        access_type: RegAccessKind::Read as u8,
        val: 0,
    })
}

fn reg_write(driver: &dyn Driver, addr: RegisterAddress, value: u32) -> Result<()> {
    driver.reg_access(RegAccessArg {
        offset: addr.0,
        access_type: RegAccessKind::Write as u8,
        val: value,
    })?;
    Ok(())
}

/// Write `value` to `addr`, applying whatever readback-verification rule
/// governs that register family. `firmware_design_date` is carried into a
/// [`DriverError::RegisterVerifyMismatch`] so a mismatch can be correlated
/// with a firmware/host version skew.
pub fn write_verified(
    driver: &dyn Driver,
    addr: RegisterAddress,
    value: u32,
    firmware_design_date: &str,
) -> Result<()> {
    let rule = classify(addr);

    reg_write(driver, addr, value)?;

    if rule == VerifyRule::Skip {
        trace!(address = %addr, "register write skips readback verification");
        return Ok(());
    }

    if rule == VerifyRule::GoBit {
        poll_go_bit_clear(driver, addr)?;
    }

    let mask = compare_mask(rule);
    let read_back = reg_read(driver, addr)?;
    if read_back & mask != value & mask {
        warn!(address = %addr, written = value, read_back, "register verify mismatch");
        return Err(DriverError::RegisterVerifyMismatch {
            address: addr,
            written: value,
            read_back,
            firmware_design_date: firmware_design_date.to_string(),
        });
    }
    Ok(())
}

/// Plain, unverified read.
pub fn read(driver: &dyn Driver, addr: RegisterAddress) -> Result<u32> {
    reg_read(driver, addr)
}

fn poll_go_bit_clear(driver: &dyn Driver, addr: RegisterAddress) -> Result<()> {
    for _ in 0..GO_BIT_POLL_ITERATIONS {
        let value = reg_read(driver, addr)?;
        if value & GO_BIT == 0 {
            return Ok(());
        }
        thread::sleep(GO_BIT_POLL_INTERVAL);
    }
    Err(DriverError::Timeout(
        GO_BIT_POLL_INTERVAL * GO_BIT_POLL_ITERATIONS,
    ))
}

/// Run one I²C transaction through the go-bit protocol: write `command`
/// (with the go bit set) to `high_addr`, poll it clear, verify the
/// readback, then read the low word that carries the transaction's result
/// byte from `low_addr`.
pub fn i2c_transaction(
    driver: &dyn Driver,
    high_addr: RegisterAddress,
    low_addr: RegisterAddress,
    command: u32,
    firmware_design_date: &str,
) -> Result<u32> {
    write_verified(driver, high_addr, command | GO_BIT, firmware_design_date)?;
    reg_read(driver, low_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDriver;

    #[test]
    fn exact_match_register_round_trips() {
        let driver = FakeDriver::new(1, 64);
        write_verified(&driver, LINK_ENABLE, 0x2a, "2024-01-01").unwrap();
        assert_eq!(read(&driver, LINK_ENABLE).unwrap(), 0x2a);
    }

    #[test]
    fn control_register_ignores_reset_bit_on_verify() {
        let driver = FakeDriver::new(1, 64);
        // A value with the reset bit set should still verify, since the
        // hardware never reflects it back.
        write_verified(&driver, CONTROL, CONTROL_RESET_BIT | 0x5, "2024-01-01").unwrap();
    }

    #[test]
    fn mismatch_outside_the_mask_is_fatal() {
        let mut driver = FakeDriver::new(1, 64);
        // Script a readback that diverges from what's about to be written,
        // simulating hardware that didn't actually take the write.
        driver.script_register_reads(LINK_ENABLE.0, [0xffff_ffff]);

        let err = write_verified(&driver, LINK_ENABLE, 0x1, "2024-01-01");
        assert!(matches!(
            err,
            Err(DriverError::RegisterVerifyMismatch {
                written: 0x1,
                read_back: 0xffff_ffff,
                ..
            })
        ));
    }

    #[test]
    fn go_bit_register_polls_until_self_clearing_countdown_elapses() {
        let mut driver = FakeDriver::new(1, 64);
        driver.arm_self_clearing(I2C_SERDES_HIGH.0, 3);
        let result = i2c_transaction(&driver, I2C_SERDES_HIGH, I2C_SERDES_LOW, 0x10, "2024-01-01");
        assert!(result.is_ok());
    }
}
