//! DCS lock contention across two threads, driven through the public
//! `DeviceHandle` API.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dtc_driver::config::{CardKind, DeviceConfig, SimMode};
use dtc_driver::driver::fake::FakeDriver;
use dtc_driver::DeviceHandle;

fn test_config() -> DeviceConfig {
    DeviceConfig {
        card_kind: CardKind::Cfo,
        card_index: 0,
        sim_mode: SimMode::Disabled,
        debug_write_file_path: None,
    }
}

#[test]
fn thread_b_acquires_once_thread_a_releases_mid_wait() {
    let driver = FakeDriver::new(4, 64);
    let handle = Arc::new(DeviceHandle::new(driver, test_config(), "fake-version-1").unwrap());

    handle.acquire_dcs_lock().unwrap();

    let handle_b = Arc::clone(&handle);
    let acquired_at = Arc::new(Mutex::new(None));
    let acquired_at_b = Arc::clone(&acquired_at);
    let start = Instant::now();

    let b = thread::spawn(move || {
        handle_b.acquire_dcs_lock().unwrap();
        *acquired_at_b.lock().unwrap() = Some(start.elapsed());
    });

    thread::sleep(Duration::from_millis(500));
    handle.release_dcs_lock().unwrap();

    b.join().unwrap();
    let elapsed = acquired_at
        .lock()
        .unwrap()
        .expect("thread B should have acquired the lock");
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_secs(1));
}
