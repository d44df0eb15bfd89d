//! Link State Machine: reset sequencing and ready-polling for the six ROC
//! SERDES links plus the CFO/EVB links.

use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{info, warn};

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::registers;
use crate::types::LinkId;

bitflags! {
    /// One link's slice of the reset-control/reset-done registers: 3 live
    /// bits (RX, TX, PLL) plus a spare, repeated every 4 bits per link.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct ResetBits: u32 {
        const RX = 1 << 0;
        const TX = 1 << 1;
        const PLL = 1 << 2;
    }
}

bitflags! {
    /// One link's slice of [`registers::LINK_STATUS`]: the four conditions
    /// that together mean the link is ready for traffic.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct ReadyBits: u32 {
        const PLL_LOCKED = 1 << 0;
        const RX_RESET_DONE = 1 << 1;
        const TX_RESET_DONE = 1 << 2;
        const CDR_LOCKED = 1 << 3;
    }
}

const RESET_DONE_POLL_INTERVAL: Duration = Duration::from_millis(1);
const RESET_DONE_MAX_ITERATIONS: u32 = 100;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READY_DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const READY_PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Bit pattern expected in the reset-done register once every ROC link has
/// finished resetting.
const ALL_ROCS_DONE_PATTERN: u32 = 0x3f;

/// Which reset stage to run: a link's RX/TX SERDES lanes, its PLL, or a full
/// reset of all three together.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResetScope {
    /// Reset the RX SERDES lane only.
    Rx,
    /// Reset the TX SERDES lane only.
    Tx,
    /// Reset the PLL only.
    Pll,
    /// Reset RX, TX, and PLL together.
    Full,
}

impl ResetScope {
    fn bits(self) -> ResetBits {
        match self {
            ResetScope::Rx => ResetBits::RX,
            ResetScope::Tx => ResetBits::TX,
            ResetScope::Pll => ResetBits::PLL,
            ResetScope::Full => ResetBits::RX | ResetBits::TX | ResetBits::PLL,
        }
    }
}

/// Every link's SERDES reset and reset-done state lives in a private 4-bit
/// field of [`registers::SERDES_RESET`] / [`registers::RESET_DONE`], so
/// resetting one link never touches another's in-flight reset.
fn link_base_bit(link: LinkId) -> u32 {
    match link {
        LinkId::Roc(idx) => u32::from(idx.get()) * 4,
        LinkId::Cfo => 6 * 4,
        LinkId::Evb => 7 * 4,
        LinkId::All => unreachable!("All is handled by reset_all_roc_links"),
    }
}

fn reset_mask(link: LinkId, scope: ResetScope) -> u32 {
    scope.bits().bits() << link_base_bit(link)
}

/// The full ready-mask (all four status bits) shifted into `link`'s 4-bit
/// field of [`registers::LINK_STATUS`].
pub fn link_ready_mask(link: LinkId) -> u32 {
    ReadyBits::all().bits() << link_base_bit(link)
}

fn done_bit(link: LinkId) -> u32 {
    if let Some(roc_bit) = link.roc_bit() {
        return u32::from(roc_bit);
    }
    match link {
        LinkId::Cfo => 1 << 6,
        LinkId::Evb => 1 << 7,
        _ => unreachable!(),
    }
}

/// Reset a single link's chosen reset scope: set the reset bit(s), hold
/// briefly, clear them, then poll the done bit until it comes back set or
/// the bounded retry budget is exhausted.
pub fn reset_link(
    driver: &dyn Driver,
    link: LinkId,
    scope: ResetScope,
    firmware_design_date: &str,
) -> Result<()> {
    let mask = reset_mask(link, scope);
    let current = registers::read(driver, registers::SERDES_RESET)?;
    registers::write_verified(
        driver,
        registers::SERDES_RESET,
        current | mask,
        firmware_design_date,
    )?;
    thread::sleep(Duration::from_micros(100));
    registers::write_verified(
        driver,
        registers::SERDES_RESET,
        current & !mask,
        firmware_design_date,
    )?;

    let bit = done_bit(link);
    for attempt in 0..RESET_DONE_MAX_ITERATIONS {
        let done = registers::read(driver, registers::RESET_DONE)?;
        if done & bit == bit {
            info!(?link, ?scope, attempt, "link reset complete");
            return Ok(());
        }
        thread::sleep(RESET_DONE_POLL_INTERVAL);
    }

    warn!(?link, ?scope, "link reset did not reach done within budget");
    Err(DriverError::LinkResetFailed {
        link,
        attempts: RESET_DONE_MAX_ITERATIONS,
    })
}

/// Broadcast a full reset across all six ROC links, expecting the done
/// register to reach `0x3f` (every ROC bit set).
pub fn reset_all_roc_links(driver: &dyn Driver, firmware_design_date: &str) -> Result<()> {
    let current = registers::read(driver, registers::SERDES_RESET)?;
    let roc_mask: u32 = LinkId::ALL_ROCS
        .iter()
        .fold(0, |acc, &l| acc | reset_mask(l, ResetScope::Full));

    registers::write_verified(
        driver,
        registers::SERDES_RESET,
        current | roc_mask,
        firmware_design_date,
    )?;
    thread::sleep(Duration::from_micros(100));
    registers::write_verified(
        driver,
        registers::SERDES_RESET,
        current & !roc_mask,
        firmware_design_date,
    )?;

    for attempt in 0..RESET_DONE_MAX_ITERATIONS {
        let done = registers::read(driver, registers::RESET_DONE)?;
        if done & ALL_ROCS_DONE_PATTERN == ALL_ROCS_DONE_PATTERN {
            info!(attempt, "all ROC links reset complete");
            return Ok(());
        }
        thread::sleep(RESET_DONE_POLL_INTERVAL);
    }

    Err(DriverError::LinkResetFailed {
        link: LinkId::All,
        attempts: RESET_DONE_MAX_ITERATIONS,
    })
}

/// Block until `link` reports its combined PLL-locked / RX-reset-done /
/// TX-reset-done / CDR-locked status, or `timeout` (default 1s) elapses.
/// Prints progress at most once every 5 seconds while waiting.
pub fn wait_for_link_ready(driver: &dyn Driver, link: LinkId, timeout: Option<Duration>) -> Result<()> {
    if link == LinkId::All {
        return Err(DriverError::LinkResetFailed { link, attempts: 0 });
    }
    let mask = link_ready_mask(link);
    let timeout = timeout.unwrap_or(READY_DEFAULT_TIMEOUT);
    let deadline = Instant::now() + timeout;
    let mut last_log = Instant::now();

    loop {
        let status = registers::read(driver, registers::LINK_STATUS)?;
        if status & mask == mask {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DriverError::Timeout(timeout));
        }
        if last_log.elapsed() >= READY_PROGRESS_LOG_INTERVAL {
            info!(?link, "still waiting for link ready");
            last_log = Instant::now();
        }
        thread::sleep(READY_POLL_INTERVAL);
    }
}
