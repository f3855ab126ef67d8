//! Runtime configuration: defaults for cyclic task pacing and watchdog
//! tolerance, overridable from a YAML file via `serde_yaml`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default interval for a CYCLIC task that doesn't specify its own, in microseconds.
    pub default_cyclic_interval_us: u32,
    /// A task is forced into the safe state once its cumulative overrun time
    /// reaches this many microseconds. Defaults to one interval's worth.
    pub fatal_overrun_threshold_us: u32,
    pub retain_backing_dir: Option<String>,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_cyclic_interval_us: crate::loader::DEFAULT_CYCLIC_INTERVAL_US,
            fatal_overrun_threshold_us: crate::loader::DEFAULT_CYCLIC_INTERVAL_US,
            retain_backing_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn load_from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.fatal_overrun_threshold_us, cfg.default_cyclic_interval_us);
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let cfg = RuntimeConfig::from_yaml_str("log_level: debug\n").unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.default_cyclic_interval_us, crate::loader::DEFAULT_CYCLIC_INTERVAL_US);
    }
}
