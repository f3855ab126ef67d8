//! The hardware abstraction layer port contract: the capability set
//! `{lifecycle, timing, digital, analog, persistence, logging}` every
//! platform port must implement. This module also ships the in-process
//! simulated port used by the CLI's default run mode and by tests.

pub mod sim;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum HalError {
    #[error("channel {0} is not wired on this port")]
    UnknownChannel(u16),
    #[error("persistence key not found")]
    NotFound,
    #[error("persistence backend error: {0}")]
    Persistence(String),
}

/// Logging is satisfied by the ambient `tracing` stack (see the `log` module):
/// every port runs inside a process with a subscriber installed, so `log` is
/// a thin call into `tracing` rather than a bespoke sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub trait Hal {
    fn init(&mut self) -> Result<(), HalError>;
    fn shutdown(&mut self) -> Result<(), HalError>;

    /// Monotonic milliseconds since an arbitrary but fixed epoch.
    fn tick_ms(&self) -> u32;
    fn sleep(&self, ms: u32);

    fn gpio_read(&self, channel: u16) -> Result<bool, HalError>;
    fn gpio_write(&mut self, channel: u16, value: bool) -> Result<(), HalError>;

    fn adc_read(&self, channel: u16) -> Result<u16, HalError>;
    fn dac_write(&mut self, channel: u16, value: u16) -> Result<(), HalError>;

    fn persist_save(&mut self, key: &str, bytes: &[u8]) -> Result<(), HalError>;
    fn persist_load(&self, key: &str) -> Result<Vec<u8>, HalError>;
    fn persist_delete(&mut self, key: &str) -> Result<(), HalError>;

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(target: "hal", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "hal", "{message}"),
            LogLevel::Info => tracing::info!(target: "hal", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "hal", "{message}"),
            LogLevel::Error => tracing::error!(target: "hal", "{message}"),
        }
    }
}
