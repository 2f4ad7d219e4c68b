//! Desired-state types for memory, virtual processors and CPU groups.
//!
//! Units follow the management UI rather than the host schema: memory in
//! megabytes, processor reserve/limit in whole percent, memory priority on
//! a 0–100 scale. The engine converts to host units on the way out.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default dynamic-memory buffer, in percent.
pub const DEFAULT_MEMORY_BUFFER: u32 = 20;

/// Default memory priority when the host reports no weight.
pub const DEFAULT_MEMORY_PRIORITY: u32 = 50;

/// Highest relative processor weight the host accepts.
pub const MAX_PROCESSOR_WEIGHT: u32 = 10_000;

/// Largest virtual processor count a VM definition accepts.
pub const MAX_PROCESSOR_COUNT: u32 = 2048;

/// A configuration value outside the range the host accepts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    #[error("minimum memory ({minimum} MB) exceeds maximum memory ({maximum} MB)")]
    MinimumAboveMaximum { minimum: u64, maximum: u64 },

    #[error("CPU group {0} has no logical processors")]
    EmptyCpuGroup(Uuid),
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

// ── Memory ────────────────────────────────────────────────────────

/// Page size used to back guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackingPageSize {
    /// Regular 4K pages.
    #[serde(rename = "small")]
    Small,
    /// 2 MB large pages.
    #[serde(rename = "2mb")]
    Large2Mb,
    /// 1 GB huge pages.
    #[serde(rename = "1gb")]
    Huge1Gb,
}

impl BackingPageSize {
    /// Host schema code for this page size.
    pub fn code(self) -> u8 {
        match self {
            BackingPageSize::Small => 0,
            BackingPageSize::Large2Mb => 1,
            BackingPageSize::Huge1Gb => 2,
        }
    }

    /// Inverse of [`code`](Self::code). Unknown codes yield `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(BackingPageSize::Small),
            1 => Some(BackingPageSize::Large2Mb),
            2 => Some(BackingPageSize::Huge1Gb),
            _ => None,
        }
    }

    /// Granularity, in megabytes, that memory sizes must be multiples of.
    pub fn alignment_mb(self) -> u64 {
        match self {
            BackingPageSize::Small => 1,
            BackingPageSize::Large2Mb => 2,
            BackingPageSize::Huge1Gb => 1024,
        }
    }

    /// Whether this mode pins memory in large or huge pages.
    pub fn is_huge(self) -> bool {
        self != BackingPageSize::Small
    }
}

/// Desired memory allocation for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfiguration {
    /// Startup RAM in megabytes.
    pub startup: u64,
    /// Dynamic-memory floor in megabytes.
    pub minimum: u64,
    /// Dynamic-memory ceiling in megabytes.
    pub maximum: u64,
    /// Relative priority, 0–100. Stored by the host as weight ×100.
    pub priority: u32,
    pub dynamic_memory_enabled: bool,
    /// Dynamic-memory buffer in percent.
    pub buffer: u32,
    /// `None` leaves the host setting alone.
    pub backing_page_size: Option<BackingPageSize>,
    /// Host-defined encryption policy code. `None` leaves it alone.
    pub memory_encryption_policy: Option<u8>,
}

impl Default for MemoryConfiguration {
    fn default() -> Self {
        Self {
            startup: 1024,
            minimum: 512,
            maximum: 1_048_576,
            priority: DEFAULT_MEMORY_PRIORITY,
            dynamic_memory_enabled: false,
            buffer: DEFAULT_MEMORY_BUFFER,
            backing_page_size: None,
            memory_encryption_policy: None,
        }
    }
}

impl MemoryConfiguration {
    /// Host weight (0–10000) for the configured priority.
    pub fn weight(&self) -> u32 {
        self.priority.min(100) * 100
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("priority", self.priority.into(), 0, 100)?;
        check_range("buffer", self.buffer.into(), 0, 2000)?;
        Ok(())
    }

    /// Minimum and maximum only reach the host when dynamic memory stays
    /// on, so callers check them once that is decided.
    pub fn validate_dynamic_bounds(&self) -> Result<(), ConfigError> {
        if self.minimum > self.maximum {
            return Err(ConfigError::MinimumAboveMaximum {
                minimum: self.minimum,
                maximum: self.maximum,
            });
        }
        Ok(())
    }
}

// ── Processor ─────────────────────────────────────────────────────

/// Simultaneous multithreading exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtMode {
    SingleThread,
    MultiThread,
}

impl SmtMode {
    /// Hardware threads per virtual core.
    pub fn threads_per_core(self) -> u64 {
        match self {
            SmtMode::SingleThread => 1,
            SmtMode::MultiThread => 2,
        }
    }

    /// Anything other than exactly one thread reads back as multithreaded.
    pub fn from_threads_per_core(threads: u64) -> Self {
        if threads == 1 {
            SmtMode::SingleThread
        } else {
            SmtMode::MultiThread
        }
    }
}

/// Optional processor capability switches.
///
/// `None` means "leave the host default"; only `Some` values are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorFeatures {
    pub expose_virtualization_extensions: Option<bool>,
    pub enable_host_resource_protection: Option<bool>,
    /// Limit processor features for migration compatibility.
    pub limit_processor_features: Option<bool>,
    /// Limit CPUID for older guest operating systems.
    pub limit_cpuid: Option<bool>,
    pub disable_speculation_controls: Option<bool>,
    pub hide_hypervisor_present: Option<bool>,
    pub enable_perfmon_arch_pmu: Option<bool>,
    pub allow_acount_mcount: Option<bool>,
    pub enable_socket_topology: Option<bool>,
}

/// Names one switch in [`ProcessorFeatures`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorFeature {
    ExposeVirtualizationExtensions,
    EnableHostResourceProtection,
    LimitProcessorFeatures,
    LimitCpuid,
    DisableSpeculationControls,
    HideHypervisorPresent,
    EnablePerfmonArchPmu,
    AllowAcountMcount,
    EnableSocketTopology,
}

impl ProcessorFeature {
    pub const ALL: [ProcessorFeature; 9] = [
        ProcessorFeature::ExposeVirtualizationExtensions,
        ProcessorFeature::EnableHostResourceProtection,
        ProcessorFeature::LimitProcessorFeatures,
        ProcessorFeature::LimitCpuid,
        ProcessorFeature::DisableSpeculationControls,
        ProcessorFeature::HideHypervisorPresent,
        ProcessorFeature::EnablePerfmonArchPmu,
        ProcessorFeature::AllowAcountMcount,
        ProcessorFeature::EnableSocketTopology,
    ];
}

impl ProcessorFeatures {
    pub fn get(&self, feature: ProcessorFeature) -> Option<bool> {
        *self.slot(feature)
    }

    pub fn set(&mut self, feature: ProcessorFeature, value: Option<bool>) {
        *self.slot_mut(feature) = value;
    }

    fn slot(&self, feature: ProcessorFeature) -> &Option<bool> {
        match feature {
            ProcessorFeature::ExposeVirtualizationExtensions => &self.expose_virtualization_extensions,
            ProcessorFeature::EnableHostResourceProtection => &self.enable_host_resource_protection,
            ProcessorFeature::LimitProcessorFeatures => &self.limit_processor_features,
            ProcessorFeature::LimitCpuid => &self.limit_cpuid,
            ProcessorFeature::DisableSpeculationControls => &self.disable_speculation_controls,
            ProcessorFeature::HideHypervisorPresent => &self.hide_hypervisor_present,
            ProcessorFeature::EnablePerfmonArchPmu => &self.enable_perfmon_arch_pmu,
            ProcessorFeature::AllowAcountMcount => &self.allow_acount_mcount,
            ProcessorFeature::EnableSocketTopology => &self.enable_socket_topology,
        }
    }

    fn slot_mut(&mut self, feature: ProcessorFeature) -> &mut Option<bool> {
        match feature {
            ProcessorFeature::ExposeVirtualizationExtensions => {
                &mut self.expose_virtualization_extensions
            }
            ProcessorFeature::EnableHostResourceProtection => &mut self.enable_host_resource_protection,
            ProcessorFeature::LimitProcessorFeatures => &mut self.limit_processor_features,
            ProcessorFeature::LimitCpuid => &mut self.limit_cpuid,
            ProcessorFeature::DisableSpeculationControls => &mut self.disable_speculation_controls,
            ProcessorFeature::HideHypervisorPresent => &mut self.hide_hypervisor_present,
            ProcessorFeature::EnablePerfmonArchPmu => &mut self.enable_perfmon_arch_pmu,
            ProcessorFeature::AllowAcountMcount => &mut self.allow_acount_mcount,
            ProcessorFeature::EnableSocketTopology => &mut self.enable_socket_topology,
        }
    }
}

/// Desired virtual processor allocation for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfiguration {
    /// Number of virtual processors.
    pub count: u32,
    /// Reserved share of one host processor, in percent (0–100).
    pub reserve: u32,
    /// Maximum share of one host processor, in percent (0–100).
    pub maximum: u32,
    /// Relative weight, 0–10000.
    pub relative_weight: u32,
    /// `None` leaves the host's threads-per-core alone.
    pub smt_mode: Option<SmtMode>,
    pub features: ProcessorFeatures,
}

impl Default for ProcessorConfiguration {
    fn default() -> Self {
        Self {
            count: 1,
            reserve: 0,
            maximum: 100,
            relative_weight: 100,
            smt_mode: None,
            features: ProcessorFeatures::default(),
        }
    }
}

impl ProcessorConfiguration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("reserve", self.reserve.into(), 0, 100)?;
        check_range("maximum", self.maximum.into(), 0, 100)?;
        check_range(
            "relative_weight",
            self.relative_weight.into(),
            0,
            MAX_PROCESSOR_WEIGHT.into(),
        )?;
        Ok(())
    }

    /// The core count is only written to a VM's definition, never to its
    /// realized settings.
    pub fn validate_count(&self) -> Result<(), ConfigError> {
        check_range("count", self.count.into(), 1, MAX_PROCESSOR_COUNT.into())
    }
}

// ── CPU groups ────────────────────────────────────────────────────

/// A pool of host logical processors that VMs can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuGroupDescriptor {
    pub group_id: Uuid,
    /// Host logical processor indices.
    pub logical_processors: BTreeSet<u32>,
    /// Capacity cap, 0–65535. `None` when the host reports no cap.
    pub cap: Option<u16>,
}

impl CpuGroupDescriptor {
    pub fn new(group_id: Uuid, logical_processors: impl IntoIterator<Item = u32>) -> Self {
        Self {
            group_id,
            logical_processors: logical_processors.into_iter().collect(),
            cap: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.logical_processors.is_empty() {
            return Err(ConfigError::EmptyCpuGroup(self.group_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_codes_round_trip() {
        for size in [
            BackingPageSize::Small,
            BackingPageSize::Large2Mb,
            BackingPageSize::Huge1Gb,
        ] {
            assert_eq!(BackingPageSize::from_code(size.code()), Some(size));
        }
        assert_eq!(BackingPageSize::from_code(7), None);
    }

    #[test]
    fn page_size_alignment() {
        assert_eq!(BackingPageSize::Small.alignment_mb(), 1);
        assert_eq!(BackingPageSize::Large2Mb.alignment_mb(), 2);
        assert_eq!(BackingPageSize::Huge1Gb.alignment_mb(), 1024);
        assert!(!BackingPageSize::Small.is_huge());
        assert!(BackingPageSize::Huge1Gb.is_huge());
    }

    #[test]
    fn weight_is_priority_times_hundred() {
        let config = MemoryConfiguration {
            priority: 80,
            ..Default::default()
        };
        assert_eq!(config.weight(), 8000);
    }

    #[test]
    fn smt_mode_reads_back_non_one_as_multithread() {
        assert_eq!(SmtMode::from_threads_per_core(1), SmtMode::SingleThread);
        assert_eq!(SmtMode::from_threads_per_core(2), SmtMode::MultiThread);
        assert_eq!(SmtMode::from_threads_per_core(0), SmtMode::MultiThread);
        assert_eq!(SmtMode::MultiThread.threads_per_core(), 2);
    }

    #[test]
    fn features_get_and_set_by_name() {
        let mut features = ProcessorFeatures::default();
        features.set(ProcessorFeature::LimitCpuid, Some(true));
        assert_eq!(features.limit_cpuid, Some(true));
        assert_eq!(features.get(ProcessorFeature::LimitCpuid), Some(true));
        assert_eq!(features.get(ProcessorFeature::EnableSocketTopology), None);
    }

    #[test]
    fn processor_validation_rejects_reserve_over_100() {
        let config = ProcessorConfiguration {
            reserve: 150,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "reserve", .. })
        ));
    }

    #[test]
    fn memory_bounds_are_checked_separately() {
        let config = MemoryConfiguration {
            dynamic_memory_enabled: true,
            minimum: 4096,
            maximum: 2048,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.validate_dynamic_bounds(),
            Err(ConfigError::MinimumAboveMaximum { minimum: 4096, maximum: 2048 })
        ));
    }

    #[test]
    fn processor_count_is_checked_separately() {
        let config = ProcessorConfiguration {
            count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.validate_count(),
            Err(ConfigError::OutOfRange { field: "count", .. })
        ));
    }

    #[test]
    fn empty_cpu_group_is_invalid() {
        let group = CpuGroupDescriptor::new(Uuid::new_v4(), []);
        assert!(group.validate().is_err());
        let group = CpuGroupDescriptor::new(Uuid::new_v4(), [0, 1]);
        assert!(group.validate().is_ok());
    }
}
