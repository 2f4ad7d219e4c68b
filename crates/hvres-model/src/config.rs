//! TOML configuration: service tuning and desired-state files.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{MemoryConfiguration, ProcessorConfiguration};

/// Tuning for the reconciliation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Delay between job polls.
    pub poll_interval_ms: u64,
    /// Give up on a job after this long. `None` polls forever.
    pub job_timeout_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            job_timeout_secs: Some(600),
        }
    }
}

impl ServiceConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

/// Desired hardware state for one VM, as written in a TOML file.
///
/// ```toml
/// [memory]
/// startup = 4096
/// dynamic_memory_enabled = false
/// backing_page_size = "1gb"
///
/// [processor]
/// count = 4
/// smt_mode = "single_thread"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub memory: Option<MemoryConfiguration>,
    pub processor: Option<ProcessorConfiguration>,
}

impl DesiredState {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackingPageSize, SmtMode};

    #[test]
    fn service_config_defaults() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.job_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn parse_desired_state() {
        let state = DesiredState::parse(
            r#"
[memory]
startup = 3000
minimum = 1000
maximum = 5000
dynamic_memory_enabled = true
backing_page_size = "1gb"

[processor]
count = 4
smt_mode = "single_thread"

[processor.features]
expose_virtualization_extensions = true
"#,
        )
        .unwrap();

        let memory = state.memory.unwrap();
        assert_eq!(memory.startup, 3000);
        assert_eq!(memory.backing_page_size, Some(BackingPageSize::Huge1Gb));
        assert_eq!(memory.buffer, 20);

        let processor = state.processor.unwrap();
        assert_eq!(processor.count, 4);
        assert_eq!(processor.smt_mode, Some(SmtMode::SingleThread));
        assert_eq!(processor.features.expose_virtualization_extensions, Some(true));
        assert_eq!(processor.features.limit_cpuid, None);
    }

    #[test]
    fn desired_state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.toml");
        let state = DesiredState {
            memory: Some(MemoryConfiguration::default()),
            processor: None,
        };
        std::fs::write(&path, state.to_toml_string().unwrap()).unwrap();

        let loaded = DesiredState::from_file(&path).unwrap();
        assert_eq!(loaded, state);
    }
}
