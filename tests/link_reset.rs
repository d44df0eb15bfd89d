//! Link reset sequencing through the public `link` module and `FakeDriver`.

use std::time::Duration;

use dtc_driver::driver::fake::FakeDriver;
use dtc_driver::link::{self, ResetScope};
use dtc_driver::types::{LinkId, RocIndex};
use dtc_driver::{registers, DriverError};

const FIRMWARE_VERSION: &str = "2024-01-01";

#[test]
fn reset_all_roc_links_waits_for_the_0x3f_done_pattern() {
    let mut driver = FakeDriver::new(1, 64);
    driver.set_register(registers::RESET_DONE.0, 0x3f);
    link::reset_all_roc_links(&driver, FIRMWARE_VERSION).unwrap();
}

#[test]
fn resetting_one_roc_link_does_not_perturb_a_concurrently_resetting_sibling() {
    let mut driver = FakeDriver::new(1, 64);
    let link_a = LinkId::Roc(RocIndex::new(0).unwrap());
    let link_b = LinkId::Roc(RocIndex::new(3).unwrap());

    // Link B is mid-reset: its reset bits are set in SERDES_RESET and its
    // done bit is not yet up.
    driver.set_register(
        registers::SERDES_RESET.0,
        1 << (3 * 4), // link B's RX bit
    );
    // Link A's done bit comes up immediately.
    driver.set_register(registers::RESET_DONE.0, link_done_bit(link_a));

    link::reset_link(&driver, link_a, ResetScope::Rx, FIRMWARE_VERSION).unwrap();

    // Link B's in-flight reset bit must still be set afterward.
    let after = driver.get_register(registers::SERDES_RESET.0);
    assert_ne!(after & (1 << (3 * 4)), 0);
}

#[test]
fn wait_for_link_ready_rejects_the_all_broadcast_selector() {
    let driver = FakeDriver::new(1, 64);
    let err = link::wait_for_link_ready(&driver, LinkId::All, Some(Duration::from_millis(10)));
    assert!(matches!(err, Err(DriverError::LinkResetFailed { .. })));
}

#[test]
fn wait_for_link_ready_succeeds_once_all_four_status_bits_are_set() {
    let mut driver = FakeDriver::new(1, 64);
    let link_id = LinkId::Roc(RocIndex::new(1).unwrap());
    driver.set_register(registers::LINK_STATUS.0, link::link_ready_mask(link_id));
    link::wait_for_link_ready(&driver, link_id, Some(Duration::from_millis(50))).unwrap();
}

fn link_done_bit(link: LinkId) -> u32 {
    u32::from(link.roc_bit().expect("test links are all ROC links"))
}
