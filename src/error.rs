//! Error kinds raised by the driver.

use crate::ioctl::RegisterAddress;

/// Every fallible operation in this crate returns a [`DriverError`].
///
/// Each variant carries enough diagnostic context that a caller (or a log
/// line) never has to go dig the detail back out of the device.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A bounded poll or blocking ioctl did not complete in its budgeted
    /// time. Callers may retry.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An ioctl or read/write syscall failed with a negative return code.
    /// The device may be unusable; fatal to the current transaction.
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// What the driver was attempting when the syscall failed.
        operation: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A sub-event parser invariant was violated: a truncated record, a
    /// duplicate Event-Window Tag, or a saturated meta-size field.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Firmware delivered a record whose type byte did not match what the
    /// caller expected. Recovered the same way as [`DriverError::DataCorruption`].
    #[error("wrong packet type: expected {expected:#x}, got {actual:#x}")]
    WrongPacketType {
        /// The record type the caller asked for.
        expected: u8,
        /// The record type actually found on the wire.
        actual: u8,
    },

    /// A readback-checked register write observed a different value than
    /// written, after applying the address's verify mask.
    #[error(
        "register verify mismatch at {address}: wrote {written:#010x}, read back {read_back:#010x} (firmware design date {firmware_design_date})"
    )]
    RegisterVerifyMismatch {
        /// The register that failed verification.
        address: RegisterAddress,
        /// The value the caller asked to write.
        written: u32,
        /// The value actually read back.
        read_back: u32,
        /// The firmware design date reported at construction, included so the
        /// mismatch can be correlated with a firmware/host version skew.
        firmware_design_date: String,
    },

    /// The firmware design version read back at construction did not match
    /// the version the caller expected. Fatal at init.
    #[error("firmware version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// The version string the caller supplied at construction.
        expected: String,
        /// The version string the device actually reported.
        found: String,
    },

    /// The DCS lock could not be acquired within its 1-second budget. The
    /// library force-releases both lock levels before raising this.
    #[error("DCS lock acquisition timed out")]
    DcsLockTimeout,

    /// A DCS-channel operation was attempted without holding the DCS lock.
    #[error("DCS channel operation attempted without holding the lock")]
    DcsNotLocked,

    /// An oscillator program failed validation: HSDIV outside the allowed
    /// set, N1 outside [0, 128], or RFREQ <= 0.
    #[error("invalid oscillator program: {0}")]
    InvalidOscillatorProgram(String),

    /// A link reset did not reach the expected done-bit pattern within the
    /// bounded retry budget.
    #[error("link {link:?} failed to report reset-done after {attempts} attempts")]
    LinkResetFailed {
        /// The link that failed to reset.
        link: crate::types::LinkId,
        /// How many poll iterations were attempted before giving up.
        attempts: u32,
    },
}

impl DriverError {
    pub(crate) fn io(operation: &'static str, source: std::io::Error) -> Self {
        DriverError::Io { operation, source }
    }

    /// True for the kinds that a failed read should recover from by nulling
    /// the read pointer and re-raising rather than leaving the ring wedged.
    pub fn is_recoverable_by_refetch(&self) -> bool {
        matches!(
            self,
            DriverError::DataCorruption(_)
                | DriverError::WrongPacketType { .. }
                | DriverError::Io { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DriverError>;
