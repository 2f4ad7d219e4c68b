//! Processor settings: unit conversion and schema-tolerant flag writes.

use hvres_bridge::{BridgeResult, PropertyBag};
use hvres_model::{ProcessorConfiguration, ProcessorFeature, ProcessorFeatures, SmtMode};
use tracing::debug;

use crate::schema::*;

/// Which of a VM's settings snapshots an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsVariant {
    /// The configuration currently in force on the host.
    Realized,
    /// The stored configuration used at next start.
    Definition,
}

/// What [`apply_processor`] decided, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorChanges {
    /// Whether the virtual processor count was written.
    pub core_count_applied: bool,
    /// Optional properties not written: absent on this host or rejected.
    pub skipped: Vec<&'static str>,
}

/// Write `desired` into `bag`, a host processor settings object.
///
/// The host rejects live core-count changes, so on the realized variant
/// the count is left alone and everything else still goes through.
/// Optional properties are written only when the caller set them and this
/// host's schema has them; a failed optional write is skipped.
pub fn apply_processor(
    bag: &mut PropertyBag,
    desired: &ProcessorConfiguration,
    variant: SettingsVariant,
) -> BridgeResult<ProcessorChanges> {
    let mut changes = ProcessorChanges::default();

    if variant == SettingsVariant::Definition {
        bag.set(VIRTUAL_QUANTITY, u64::from(desired.count))?;
        changes.core_count_applied = true;
    }

    bag.set(RESERVATION, u64::from(desired.reserve) * 1000)?;
    bag.set(LIMIT, u64::from(desired.maximum) * 1000)?;
    bag.set(WEIGHT, desired.relative_weight)?;

    if let Some(mode) = desired.smt_mode {
        try_set(bag, HW_THREADS_PER_CORE, mode.threads_per_core(), &mut changes.skipped);
    }

    for feature in ProcessorFeature::ALL {
        if let Some(value) = desired.features.get(feature) {
            try_set(bag, feature_property(feature), value, &mut changes.skipped);
        }
    }

    debug!(?variant, core_count_applied = changes.core_count_applied, skipped = ?changes.skipped, "processor settings computed");
    Ok(changes)
}

fn try_set<V: Into<hvres_bridge::PropertyValue>>(
    bag: &mut PropertyBag,
    name: &'static str,
    value: V,
    skipped: &mut Vec<&'static str>,
) {
    if !bag.has(name) {
        debug!(property = name, "not supported by this host, skipping");
        skipped.push(name);
        return;
    }
    if let Err(e) = bag.set(name, value) {
        debug!(property = name, error = %e, "optional property rejected, skipping");
        skipped.push(name);
    }
}

/// Project a host processor settings object into a [`ProcessorConfiguration`].
pub fn read_processor(bag: &PropertyBag) -> ProcessorConfiguration {
    let mut features = ProcessorFeatures::default();
    for feature in ProcessorFeature::ALL {
        features.set(feature, bag.get_bool(feature_property(feature)));
    }

    ProcessorConfiguration {
        count: bag.get_u64(VIRTUAL_QUANTITY).unwrap_or(0) as u32,
        reserve: (bag.get_u64(RESERVATION).unwrap_or(0) / 1000) as u32,
        maximum: (bag.get_u64(LIMIT).unwrap_or(0) / 1000) as u32,
        relative_weight: bag.get_u64(WEIGHT).unwrap_or(0) as u32,
        smt_mode: bag
            .get_u64(HW_THREADS_PER_CORE)
            .map(SmtMode::from_threads_per_core),
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_processor() -> PropertyBag {
        let mut bag = PropertyBag::new();
        bag.insert(VIRTUAL_QUANTITY, 2u64);
        bag.insert(RESERVATION, 0u64);
        bag.insert(LIMIT, 100_000u64);
        bag.insert(WEIGHT, 100u32);
        bag.insert(HW_THREADS_PER_CORE, 0u64);
        bag.insert("ExposeVirtualizationExtensions", false);
        bag.insert("LimitCPUID", false);
        bag
    }

    fn desired() -> ProcessorConfiguration {
        ProcessorConfiguration {
            count: 8,
            reserve: 10,
            maximum: 75,
            relative_weight: 200,
            smt_mode: Some(SmtMode::SingleThread),
            features: ProcessorFeatures {
                expose_virtualization_extensions: Some(true),
                limit_cpuid: Some(true),
                enable_socket_topology: Some(true),
                ..Default::default()
            },
        }
    }

    #[test]
    fn definition_variant_gets_everything() {
        let mut bag = host_processor();
        let changes = apply_processor(&mut bag, &desired(), SettingsVariant::Definition).unwrap();

        assert!(changes.core_count_applied);
        assert_eq!(bag.get_u64(VIRTUAL_QUANTITY), Some(8));
        assert_eq!(bag.get_u64(RESERVATION), Some(10_000));
        assert_eq!(bag.get_u64(LIMIT), Some(75_000));
        assert_eq!(bag.get_u64(WEIGHT), Some(200));
        assert_eq!(bag.get_u64(HW_THREADS_PER_CORE), Some(1));
        assert_eq!(bag.get_bool("ExposeVirtualizationExtensions"), Some(true));
        assert_eq!(bag.get_bool("LimitCPUID"), Some(true));
    }

    #[test]
    fn realized_variant_keeps_core_count() {
        let mut bag = host_processor();
        let changes = apply_processor(&mut bag, &desired(), SettingsVariant::Realized).unwrap();

        assert!(!changes.core_count_applied);
        assert_eq!(bag.get_u64(VIRTUAL_QUANTITY), Some(2));
        assert_eq!(bag.get_u64(LIMIT), Some(75_000));
    }

    #[test]
    fn absent_flags_are_skipped() {
        let mut bag = host_processor();
        let changes = apply_processor(&mut bag, &desired(), SettingsVariant::Definition).unwrap();
        assert_eq!(changes.skipped, vec!["EnableSocketTopology"]);
        assert!(!bag.has("EnableSocketTopology"));
    }

    #[test]
    fn unset_flags_are_not_written() {
        let mut bag = host_processor();
        let config = ProcessorConfiguration {
            smt_mode: None,
            features: ProcessorFeatures::default(),
            ..desired()
        };
        let changes = apply_processor(&mut bag, &config, SettingsVariant::Definition).unwrap();
        assert!(changes.skipped.is_empty());
        assert_eq!(bag.get_bool("LimitCPUID"), Some(false));
        assert_eq!(bag.get_u64(HW_THREADS_PER_CORE), Some(0));
    }

    #[test]
    fn rejected_optional_write_is_swallowed() {
        let mut bag = host_processor();
        bag.insert("LimitCPUID", "not-a-bool");
        let changes = apply_processor(&mut bag, &desired(), SettingsVariant::Definition).unwrap();
        assert!(changes.skipped.contains(&"LimitCPUID"));
        assert_eq!(bag.get_u64(LIMIT), Some(75_000));
    }

    #[test]
    fn repeated_application_is_stable() {
        for variant in [SettingsVariant::Realized, SettingsVariant::Definition] {
            let mut once = host_processor();
            apply_processor(&mut once, &desired(), variant).unwrap();
            let mut twice = once.clone();
            apply_processor(&mut twice, &desired(), variant).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn read_back_converts_units() {
        let mut bag = host_processor();
        apply_processor(&mut bag, &desired(), SettingsVariant::Definition).unwrap();
        let config = read_processor(&bag);

        assert_eq!(config.count, 8);
        assert_eq!(config.reserve, 10);
        assert_eq!(config.maximum, 75);
        assert_eq!(config.relative_weight, 200);
        assert_eq!(config.smt_mode, Some(SmtMode::SingleThread));
        assert_eq!(config.features.limit_cpuid, Some(true));
        assert_eq!(config.features.enable_socket_topology, None);
    }

    #[test]
    fn zero_threads_per_core_reads_as_multithread() {
        let config = read_processor(&host_processor());
        assert_eq!(config.smt_mode, Some(SmtMode::MultiThread));
    }
}
