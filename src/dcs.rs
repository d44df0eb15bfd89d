//! DCS (Device Control Service) mutual exclusion: a process-wide, reentrant,
//! thread-aware gate wrapping the driver's own cross-process `DCS_LOCK`.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::driver::{DcsLockOutcome, Driver};
use crate::error::{DriverError, Result};

/// Total time budget for acquiring both lock levels.
const LOCK_BUDGET: Duration = Duration::from_millis(1000);

/// Granularity of the busy-wait against another thread holding the gate.
const THREAD_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Granularity of the poll against the driver's `DCS_LOCK` ioctl when it
/// reports `Retry`.
const DRIVER_POLL_INTERVAL: Duration = Duration::from_micros(100);

struct GateState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Two-level DCS lock: an in-process reentrant mutex keyed by thread
/// identity, wrapping the driver's kernel-level lock for cross-process
/// exclusion.
pub struct DcsLock {
    state: Mutex<GateState>,
    released: Condvar,
}

impl Default for DcsLock {
    fn default() -> Self {
        DcsLock {
            state: Mutex::new(GateState {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }
}

impl DcsLock {
    /// Acquire the lock for the calling thread, blocking up to the 1-second
    /// budget. Re-entry by the thread that already holds it is a no-op.
    pub fn acquire(&self, driver: &dyn Driver) -> Result<()> {
        let deadline = Instant::now() + LOCK_BUDGET;
        let this_thread = thread::current().id();

        {
            let mut state = self.state.lock().unwrap();
            if state.owner == Some(this_thread) {
                state.depth += 1;
                return Ok(());
            }
            loop {
                if state.owner.is_none() {
                    state.owner = Some(this_thread);
                    state.depth = 1;
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    drop(state);
                    warn!("DCS thread-local gate acquisition timed out");
                    return Err(self.force_release_and_raise(driver));
                }
                let (guard, timeout_result) = self
                    .released
                    .wait_timeout(state, deadline.saturating_duration_since(now).min(THREAD_POLL_INTERVAL))
                    .unwrap();
                state = guard;
                if timeout_result.timed_out() && Instant::now() >= deadline {
                    drop(state);
                    warn!("DCS thread-local gate acquisition timed out");
                    return Err(self.force_release_and_raise(driver));
                }
            }
        }

        // Thread-local gate held; now acquire the driver-level lock within
        // whatever's left of the 1-second budget.
        loop {
            match driver.dcs_lock()? {
                DcsLockOutcome::Acquired | DcsLockOutcome::Unsupported => {
                    debug!("DCS lock acquired");
                    return Ok(());
                }
                DcsLockOutcome::Retry => {
                    if Instant::now() >= deadline {
                        warn!("DCS driver-level lock acquisition timed out");
                        return Err(self.force_release_and_raise(driver));
                    }
                    thread::sleep(DRIVER_POLL_INTERVAL);
                }
            }
        }
    }

    /// Release one level of reentrancy; releases the driver lock and wakes
    /// waiters only once the depth reaches zero.
    pub fn release(&self, driver: &dyn Driver) -> Result<()> {
        let this_thread = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.owner != Some(this_thread) {
            return Ok(());
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            driver.dcs_release()?;
            self.released.notify_all();
        }
        Ok(())
    }

    /// True if the calling thread currently holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        let this_thread = thread::current().id();
        self.state.lock().unwrap().owner == Some(this_thread)
    }

    /// Every DCS-channel operation must call this before touching the
    /// device.
    pub fn assert_held_by_caller(&self) -> Result<()> {
        if self.is_held_by_current_thread() {
            Ok(())
        } else {
            Err(DriverError::DcsNotLocked)
        }
    }

    fn force_release_and_raise(&self, driver: &dyn Driver) -> DriverError {
        let mut state = self.state.lock().unwrap();
        state.owner = None;
        state.depth = 0;
        drop(state);
        let _ = driver.dcs_release();
        self.released.notify_all();
        DriverError::DcsLockTimeout
    }
}
