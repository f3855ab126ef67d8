//! An in-process reference HAL: plain byte buffers for digital/analog
//! channels, an in-memory (optionally file-backed) key-value store for
//! persistence. No I/O latency beyond what the scan cycle's own pacing
//! imposes. This is a test double and the CLI's default run mode, not a
//! production platform port.

use super::{Hal, HalError, LogLevel};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

const DIGITAL_CHANNELS: usize = 256;
const ANALOG_CHANNELS: usize = 64;

pub struct SimulatedHal {
    started_at: Instant,
    digital: [bool; DIGITAL_CHANNELS],
    analog: [u16; ANALOG_CHANNELS],
    store: HashMap<String, Vec<u8>>,
    backing_dir: Option<PathBuf>,
}

impl SimulatedHal {
    pub fn new(backing_dir: Option<PathBuf>) -> Self {
        Self {
            started_at: Instant::now(),
            digital: [false; DIGITAL_CHANNELS],
            analog: [0; ANALOG_CHANNELS],
            store: HashMap::new(),
            backing_dir,
        }
    }

    fn backing_path(&self, key: &str) -> Option<PathBuf> {
        self.backing_dir.as_ref().map(|dir| dir.join(format!("{key}.bin")))
    }
}

impl Hal for SimulatedHal {
    fn init(&mut self) -> Result<(), HalError> {
        if let Some(dir) = &self.backing_dir {
            std::fs::create_dir_all(dir).map_err(|e| HalError::Persistence(e.to_string()))?;
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), HalError> {
        Ok(())
    }

    fn tick_ms(&self) -> u32 {
        self.started_at.elapsed().as_millis() as u32
    }

    fn sleep(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }

    fn gpio_read(&self, channel: u16) -> Result<bool, HalError> {
        self.digital.get(channel as usize).copied().ok_or(HalError::UnknownChannel(channel))
    }

    fn gpio_write(&mut self, channel: u16, value: bool) -> Result<(), HalError> {
        let slot = self.digital.get_mut(channel as usize).ok_or(HalError::UnknownChannel(channel))?;
        *slot = value;
        Ok(())
    }

    fn adc_read(&self, channel: u16) -> Result<u16, HalError> {
        self.analog.get(channel as usize).copied().ok_or(HalError::UnknownChannel(channel))
    }

    fn dac_write(&mut self, channel: u16, value: u16) -> Result<(), HalError> {
        let slot = self.analog.get_mut(channel as usize).ok_or(HalError::UnknownChannel(channel))?;
        *slot = value;
        Ok(())
    }

    fn persist_save(&mut self, key: &str, bytes: &[u8]) -> Result<(), HalError> {
        if let Some(path) = self.backing_path(key) {
            std::fs::write(&path, bytes).map_err(|e| HalError::Persistence(e.to_string()))?;
        }
        self.store.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn persist_load(&self, key: &str) -> Result<Vec<u8>, HalError> {
        if let Some(bytes) = self.store.get(key) {
            return Ok(bytes.clone());
        }
        if let Some(path) = self.backing_path(key) {
            if let Ok(bytes) = std::fs::read(&path) {
                return Ok(bytes);
            }
        }
        Err(HalError::NotFound)
    }

    fn persist_delete(&mut self, key: &str) -> Result<(), HalError> {
        self.store.remove(key);
        if let Some(path) = self.backing_path(key) {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digital_roundtrip() {
        let mut hal = SimulatedHal::new(None);
        hal.gpio_write(3, true).unwrap();
        assert!(hal.gpio_read(3).unwrap());
        assert!(!hal.gpio_read(4).unwrap());
    }

    #[test]
    fn unknown_channel_errors() {
        let hal = SimulatedHal::new(None);
        assert_eq!(hal.gpio_read(9999), Err(HalError::UnknownChannel(9999)));
    }

    #[test]
    fn persistence_not_found_then_saved() {
        let mut hal = SimulatedHal::new(None);
        assert_eq!(hal.persist_load("retain"), Err(HalError::NotFound));
        hal.persist_save("retain", &[1, 2, 3]).unwrap();
        assert_eq!(hal.persist_load("retain").unwrap(), vec![1, 2, 3]);
        hal.persist_delete("retain").unwrap();
        assert_eq!(hal.persist_load("retain"), Err(HalError::NotFound));
    }

    #[test]
    fn log_does_not_panic() {
        let hal = SimulatedHal::new(None);
        hal.log(LogLevel::Info, "test message");
    }
}
