//! One-time configuration built from the environment.
//!
//! The core never reads an environment variable itself; a thin
//! [`DeviceConfig`] is built once, at construction, and threaded through
//! instead of scattering `env::var` calls across the crate.

use std::env;
use std::path::PathBuf;

/// Which card variant this handle addresses. Both variants share a register
/// bank and DMA channel layout; this only selects the `/dev` stem.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CardKind {
    /// Command/Fan-Out card.
    Cfo,
    /// Data-Transfer Card.
    Dtc,
}

impl CardKind {
    /// The character-device path stem, e.g. `/dev/cfo` or `/dev/dtc`.
    pub fn dev_stem(self) -> &'static str {
        match self {
            CardKind::Cfo => "cfo",
            CardKind::Dtc => "dtc",
        }
    }

    fn index_env_var(self) -> &'static str {
        match self {
            CardKind::Cfo => "CFOLIB_CFO",
            CardKind::Dtc => "DTCLIB_DTC",
        }
    }
}

/// Parsed value of `<LIB>_SIM_ENABLE`. The simulator itself runs out of
/// process; this crate only parses the mode so a caller can decide whether
/// to construct a real or simulated handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SimMode {
    /// No simulator; talk to real hardware.
    #[default]
    Disabled,
    /// Simulator loops DAQ output back to DCS input.
    Loopback,
    /// Simulator replays a captured tracker data file.
    Tracker,
    /// Simulator emulates ROC link traffic.
    RocEmulator,
}

impl SimMode {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "LOOPBACK" => SimMode::Loopback,
            "TRACKER" => SimMode::Tracker,
            "ROCEMULATOR" | "ROC_EMULATOR" => SimMode::RocEmulator,
            _ => SimMode::Disabled,
        }
    }
}

/// Configuration resolved once, at construction, from the environment.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Which card variant (selects the `/dev` stem).
    pub card_kind: CardKind,
    /// Card index, e.g. `2` in `/dev/dtc2`. Defaults to 0.
    pub card_index: u32,
    /// Parsed `<LIB>_SIM_ENABLE`.
    pub sim_mode: SimMode,
    /// `DTCLIB_DEBUG_WRITE_FILE_PATH`, if set: every register write is
    /// additionally appended to this file for offline replay/debugging.
    pub debug_write_file_path: Option<PathBuf>,
}

impl DeviceConfig {
    /// Resolve configuration for `card_kind` from the process environment.
    pub fn from_env(card_kind: CardKind) -> Self {
        let card_index = env::var(card_kind.index_env_var())
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let sim_mode = env::var("DTCLIB_SIM_ENABLE")
            .or_else(|_| env::var("CFOLIB_SIM_ENABLE"))
            .map(|v| SimMode::parse(&v))
            .unwrap_or_default();

        let debug_write_file_path =
            env::var("DTCLIB_DEBUG_WRITE_FILE_PATH").ok().map(PathBuf::from);

        DeviceConfig {
            card_kind,
            card_index,
            sim_mode,
            debug_write_file_path,
        }
    }

    /// The `/dev` path this configuration resolves to, e.g. `/dev/dtc2`.
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/dev/{}{}",
            self.card_kind.dev_stem(),
            self.card_index
        ))
    }
}
