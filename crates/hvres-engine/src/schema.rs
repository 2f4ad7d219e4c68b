//! Host property names used by the engine.

use hvres_model::ProcessorFeature;

// ── Memory settings ───────────────────────────────────────────────

pub const VIRTUAL_QUANTITY: &str = "VirtualQuantity";
pub const RESERVATION: &str = "Reservation";
pub const LIMIT: &str = "Limit";
pub const WEIGHT: &str = "Weight";
pub const DYNAMIC_MEMORY_ENABLED: &str = "DynamicMemoryEnabled";
pub const TARGET_MEMORY_BUFFER: &str = "TargetMemoryBuffer";
pub const BACKING_PAGE_SIZE: &str = "BackingPageSize";
pub const MEMORY_ENCRYPTION_POLICY: &str = "MemoryEncryptionPolicy";
pub const MAX_MEMORY_BLOCKS_PER_NUMA_NODE: &str = "MaxMemoryBlocksPerNumaNode";

// ── Processor settings ────────────────────────────────────────────

pub const HW_THREADS_PER_CORE: &str = "HwThreadsPerCore";
pub const CPU_GROUP_ID: &str = "CpuGroupId";

/// Host property behind a processor capability switch.
pub fn feature_property(feature: ProcessorFeature) -> &'static str {
    match feature {
        ProcessorFeature::ExposeVirtualizationExtensions => "ExposeVirtualizationExtensions",
        ProcessorFeature::EnableHostResourceProtection => "EnableHostResourceProtection",
        ProcessorFeature::LimitProcessorFeatures => "LimitProcessorFeatures",
        ProcessorFeature::LimitCpuid => "LimitCPUID",
        ProcessorFeature::DisableSpeculationControls => "DisableSpeculationControls",
        ProcessorFeature::HideHypervisorPresent => "HideHypervisorPresent",
        ProcessorFeature::EnablePerfmonArchPmu => "EnablePerfmonArchPmu",
        ProcessorFeature::AllowAcountMcount => "AllowAcountMcount",
        ProcessorFeature::EnableSocketTopology => "EnableSocketTopology",
    }
}

// ── System and service settings ───────────────────────────────────

pub const ELEMENT_NAME: &str = "ElementName";
pub const ENABLED_STATE: &str = "EnabledState";
pub const VIRTUAL_SYSTEM_TYPE: &str = "VirtualSystemType";
pub const NAME: &str = "Name";

/// `VirtualSystemType` of the snapshot currently in force.
pub const REALIZED_SYSTEM_TYPE: &str = "Microsoft:Hyper-V:System:Realized";
pub const NUMA_SPANNING_ENABLED: &str = "NumaSpanningEnabled";
