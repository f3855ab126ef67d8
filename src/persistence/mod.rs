//! RETAIN restore-at-boot and dirty-triggered flush through the HAL's
//! persistence port. Persistence failures are logged, never fatal: a PLC
//! keeps scanning even when its backing store is unavailable.

use crate::hal::Hal;
use crate::memory::RETAIN_SIZE;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

const RETAIN_KEY: &str = "retain";
const PROGRAM_KEY: &str = "program";
const PROGRAM_META_KEY: &str = "program_meta";

/// Mirrors the `program` key's header fields so a client can inspect what's
/// installed without re-parsing and re-validating the whole package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramMeta {
    pub version: u16,
    pub size: u32,
    pub crc32: u32,
}

pub struct Persistence {
    last_flush_failed: bool,
}

impl Persistence {
    pub fn new() -> Self {
        Self { last_flush_failed: false }
    }

    /// Persists the raw `.zplc` package alongside a small `program_meta`
    /// sidecar, so a boot-time recovery path can confirm what's installed
    /// without re-parsing the full package. Best-effort: a failure here is
    /// logged, not fatal, matching the RETAIN flush's degrade-don't-crash
    /// treatment of the persistence port.
    pub fn save_program(&mut self, hal: &mut impl Hal, raw: &[u8]) {
        if let Err(e) = hal.persist_save(PROGRAM_KEY, raw) {
            error!(error = %e, "failed to persist program package");
            return;
        }
        if raw.len() < 12 {
            return;
        }
        let meta = ProgramMeta {
            version: u16::from_le_bytes([raw[4], raw[5]]),
            size: raw.len() as u32,
            crc32: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        };
        match serde_json::to_vec(&meta) {
            Ok(bytes) => {
                if let Err(e) = hal.persist_save(PROGRAM_META_KEY, &bytes) {
                    warn!(error = %e, "failed to persist program_meta");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise program_meta"),
        }
    }

    /// Loads the last persisted `.zplc` package, if any. Callers still run
    /// it through `loader::parse` to verify the CRC32 before trusting it.
    pub fn restore_program(&mut self, hal: &mut impl Hal) -> Option<Vec<u8>> {
        hal.persist_load(PROGRAM_KEY).ok()
    }

    pub fn restore_program_meta(&mut self, hal: &mut impl Hal) -> Option<ProgramMeta> {
        let bytes = hal.persist_load(PROGRAM_META_KEY).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Loads the RETAIN blob at boot. Absent, oversized, or undersized data
    /// is treated as "no prior state": the caller zero-initialises instead.
    pub fn restore_retain(&mut self, hal: &mut impl Hal) -> Option<Vec<u8>> {
        match hal.persist_load(RETAIN_KEY) {
            Ok(bytes) if bytes.len() == RETAIN_SIZE as usize => Some(bytes),
            Ok(bytes) => {
                warn!(got = bytes.len(), want = RETAIN_SIZE, "RETAIN blob size mismatch, discarding");
                None
            }
            Err(_) => {
                warn!("no prior RETAIN state found, zero-initialising");
                None
            }
        }
    }

    pub fn flush_retain(&mut self, hal: &mut impl Hal, bytes: &[u8]) {
        match hal.persist_save(RETAIN_KEY, bytes) {
            Ok(()) => self.last_flush_failed = false,
            Err(e) => {
                if !self.last_flush_failed {
                    error!(error = %e, "RETAIN flush failed, will keep retrying");
                }
                self.last_flush_failed = true;
            }
        }
    }
}

impl Default for Persistence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimulatedHal;

    #[test]
    fn restore_with_no_prior_state_returns_none() {
        let mut hal = SimulatedHal::new(None);
        let mut persistence = Persistence::new();
        assert!(persistence.restore_retain(&mut hal).is_none());
    }

    #[test]
    fn flush_then_restore_roundtrips() {
        let mut hal = SimulatedHal::new(None);
        let mut persistence = Persistence::new();
        let bytes = vec![0xAB; RETAIN_SIZE as usize];
        persistence.flush_retain(&mut hal, &bytes);
        assert_eq!(persistence.restore_retain(&mut hal), Some(bytes));
    }

    #[test]
    fn restore_rejects_wrong_size() {
        let mut hal = SimulatedHal::new(None);
        let mut persistence = Persistence::new();
        hal.persist_save(RETAIN_KEY, &[1, 2, 3]).unwrap();
        assert!(persistence.restore_retain(&mut hal).is_none());
    }

    #[test]
    fn save_program_roundtrips_bytes_and_meta() {
        let mut hal = SimulatedHal::new(None);
        let mut persistence = Persistence::new();
        let mut raw = vec![0u8; 16];
        raw[4..6].copy_from_slice(&1u16.to_le_bytes());
        raw[8..12].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());

        persistence.save_program(&mut hal, &raw);

        assert_eq!(persistence.restore_program(&mut hal), Some(raw.clone()));
        let meta = persistence.restore_program_meta(&mut hal).unwrap();
        assert_eq!(meta, ProgramMeta { version: 1, size: 16, crc32: 0xDEAD_BEEF });
    }

    #[test]
    fn restore_program_with_no_prior_state_returns_none() {
        let mut hal = SimulatedHal::new(None);
        let mut persistence = Persistence::new();
        assert!(persistence.restore_program(&mut hal).is_none());
    }
}
