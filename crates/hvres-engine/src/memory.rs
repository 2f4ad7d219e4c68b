//! Memory settings: alignment and power-state rules.
//!
//! The host pins large- and huge-page memory in fixed chunks, so every
//! size it checks must be a multiple of the page alignment. Huge pages
//! also rule out dynamic memory. While a VM runs, page size, encryption
//! policy and the dynamic-memory switch are frozen.

use hvres_bridge::{BridgeResult, PropertyBag};
use hvres_model::{
    BackingPageSize, DEFAULT_MEMORY_BUFFER, DEFAULT_MEMORY_PRIORITY, MemoryConfiguration,
};
use tracing::debug;

use crate::schema::*;

/// What [`apply_memory`] decided, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryChanges {
    /// Alignment unit in megabytes.
    pub alignment: u64,
    pub aligned_startup: u64,
    /// Large or huge pages are in effect for this submission.
    pub huge_pages: bool,
    /// Dynamic memory as it will be after submission.
    pub dynamic_memory_enabled: bool,
    /// Properties left alone because this host lacks them or the VM is running.
    pub skipped: Vec<&'static str>,
}

/// Round `value` up to the next multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment) * alignment
}

/// Round a per-NUMA-node block size down to a multiple of `alignment`,
/// never below one alignment unit.
pub fn align_numa_block(current: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    (current / alignment * alignment).max(alignment)
}

/// Write `desired` into `bag`, the host's memory settings object.
///
/// `running` selects the hot path: structural fields are skipped and only
/// quantities the host can change live are written.
pub fn apply_memory(
    bag: &mut PropertyBag,
    desired: &MemoryConfiguration,
    running: bool,
) -> BridgeResult<MemoryChanges> {
    let mut skipped = Vec::new();

    // Page size in effect for this submission. A running VM keeps the one
    // it has; otherwise the request wins and `None` keeps the host's.
    let current = current_page_size(bag);
    let page_size = if !bag.has(BACKING_PAGE_SIZE) {
        if desired.backing_page_size.is_some() {
            skipped.push(BACKING_PAGE_SIZE);
        }
        None
    } else if running {
        current
    } else {
        desired.backing_page_size.or(current)
    };
    let alignment = page_size.map_or(1, BackingPageSize::alignment_mb);
    let aligned_startup = align_up(desired.startup, alignment);

    bag.set(VIRTUAL_QUANTITY, aligned_startup)?;
    bag.set(WEIGHT, desired.weight())?;

    if running {
        if desired.backing_page_size.is_some() {
            skipped.push(BACKING_PAGE_SIZE);
        }
        if desired.memory_encryption_policy.is_some() {
            skipped.push(MEMORY_ENCRYPTION_POLICY);
        }

        let dynamic = bag
            .get_bool(DYNAMIC_MEMORY_ENABLED)
            .unwrap_or(desired.dynamic_memory_enabled);
        if dynamic {
            bag.set(RESERVATION, desired.minimum)?;
            bag.set(LIMIT, desired.maximum)?;
            set_buffer(bag, desired.buffer, &mut skipped)?;
        }

        skipped.dedup();
        debug!(aligned_startup, dynamic, ?skipped, "memory settings computed for running vm");
        return Ok(MemoryChanges {
            alignment,
            aligned_startup,
            huge_pages: false,
            dynamic_memory_enabled: dynamic,
            skipped,
        });
    }

    if let (Some(size), Some(_)) = (page_size, desired.backing_page_size) {
        bag.set(BACKING_PAGE_SIZE, size.code())?;
    }
    if let Some(policy) = desired.memory_encryption_policy {
        if bag.has(MEMORY_ENCRYPTION_POLICY) {
            bag.set(MEMORY_ENCRYPTION_POLICY, policy)?;
        } else {
            skipped.push(MEMORY_ENCRYPTION_POLICY);
        }
    }

    let huge_pages = page_size.is_some_and(BackingPageSize::is_huge);
    let dynamic = if huge_pages {
        bag.set(DYNAMIC_MEMORY_ENABLED, false)?;
        bag.set(RESERVATION, aligned_startup)?;
        bag.set(LIMIT, aligned_startup)?;

        if let Some(current) = bag.get_u64(MAX_MEMORY_BLOCKS_PER_NUMA_NODE) {
            bag.set(
                MAX_MEMORY_BLOCKS_PER_NUMA_NODE,
                align_numa_block(current, alignment),
            )?;
        }
        false
    } else {
        bag.set(DYNAMIC_MEMORY_ENABLED, desired.dynamic_memory_enabled)?;
        if desired.dynamic_memory_enabled {
            bag.set(RESERVATION, desired.minimum)?;
            bag.set(LIMIT, desired.maximum)?;
            set_buffer(bag, desired.buffer, &mut skipped)?;
        } else {
            bag.set(RESERVATION, aligned_startup)?;
            bag.set(LIMIT, aligned_startup)?;
        }
        desired.dynamic_memory_enabled
    };

    debug!(alignment, aligned_startup, huge_pages, dynamic, ?skipped, "memory settings computed");
    Ok(MemoryChanges {
        alignment,
        aligned_startup,
        huge_pages,
        dynamic_memory_enabled: dynamic,
        skipped,
    })
}

fn current_page_size(bag: &PropertyBag) -> Option<BackingPageSize> {
    bag.get_u64(BACKING_PAGE_SIZE)
        .and_then(|code| u8::try_from(code).ok())
        .and_then(BackingPageSize::from_code)
}

fn set_buffer(bag: &mut PropertyBag, buffer: u32, skipped: &mut Vec<&'static str>) -> BridgeResult<()> {
    if bag.has(TARGET_MEMORY_BUFFER) {
        bag.set(TARGET_MEMORY_BUFFER, buffer)
    } else {
        skipped.push(TARGET_MEMORY_BUFFER);
        Ok(())
    }
}

/// Project a host memory settings object into a [`MemoryConfiguration`].
pub fn read_memory(bag: &PropertyBag) -> MemoryConfiguration {
    MemoryConfiguration {
        startup: bag.get_u64(VIRTUAL_QUANTITY).unwrap_or(0),
        minimum: bag.get_u64(RESERVATION).unwrap_or(0),
        maximum: bag.get_u64(LIMIT).unwrap_or(0),
        priority: bag
            .get_u64(WEIGHT)
            .map_or(DEFAULT_MEMORY_PRIORITY, |w| (w / 100) as u32),
        dynamic_memory_enabled: bag.get_bool(DYNAMIC_MEMORY_ENABLED).unwrap_or(false),
        buffer: bag
            .get_u64(TARGET_MEMORY_BUFFER)
            .map_or(DEFAULT_MEMORY_BUFFER, |b| b as u32),
        backing_page_size: current_page_size(bag),
        memory_encryption_policy: bag
            .get_u64(MEMORY_ENCRYPTION_POLICY)
            .and_then(|code| u8::try_from(code).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn host_memory() -> PropertyBag {
        let mut bag = PropertyBag::new();
        bag.insert(VIRTUAL_QUANTITY, 1024u64);
        bag.insert(RESERVATION, 512u64);
        bag.insert(LIMIT, 1_048_576u64);
        bag.insert(WEIGHT, 5000u32);
        bag.insert(DYNAMIC_MEMORY_ENABLED, false);
        bag.insert(TARGET_MEMORY_BUFFER, 20u32);
        bag.insert(BACKING_PAGE_SIZE, 0u8);
        bag.insert(MEMORY_ENCRYPTION_POLICY, 0u8);
        bag.insert(MAX_MEMORY_BLOCKS_PER_NUMA_NODE, 1_048_575u64);
        bag
    }

    fn huge_page_request() -> MemoryConfiguration {
        MemoryConfiguration {
            startup: 3000,
            minimum: 1000,
            maximum: 5000,
            dynamic_memory_enabled: true,
            backing_page_size: Some(BackingPageSize::Huge1Gb),
            ..Default::default()
        }
    }

    #[test]
    fn huge_pages_force_static_aligned_memory() {
        let mut bag = host_memory();
        let changes = apply_memory(&mut bag, &huge_page_request(), false).unwrap();

        assert_eq!(changes.alignment, 1024);
        assert_eq!(changes.aligned_startup, 3072);
        assert!(changes.huge_pages);
        assert_eq!(bag.get_u64(VIRTUAL_QUANTITY), Some(3072));
        assert_eq!(bag.get_bool(DYNAMIC_MEMORY_ENABLED), Some(false));
        assert_eq!(bag.get_u64(RESERVATION), Some(3072));
        assert_eq!(bag.get_u64(LIMIT), Some(3072));
        assert_eq!(bag.get_u64(BACKING_PAGE_SIZE), Some(2));
    }

    #[test]
    fn huge_pages_realign_numa_block_down() {
        let mut bag = host_memory();
        apply_memory(&mut bag, &huge_page_request(), false).unwrap();
        assert_eq!(bag.get_u64(MAX_MEMORY_BLOCKS_PER_NUMA_NODE), Some(1_047_552));
    }

    #[test]
    fn numa_block_smaller_than_alignment_becomes_one_unit() {
        let mut bag = host_memory();
        bag.set(MAX_MEMORY_BLOCKS_PER_NUMA_NODE, 100u64).unwrap();
        apply_memory(&mut bag, &huge_page_request(), false).unwrap();
        assert_eq!(bag.get_u64(MAX_MEMORY_BLOCKS_PER_NUMA_NODE), Some(1024));
    }

    #[test]
    fn large_pages_align_to_two() {
        let mut bag = host_memory();
        let desired = MemoryConfiguration {
            startup: 1025,
            backing_page_size: Some(BackingPageSize::Large2Mb),
            ..Default::default()
        };
        let changes = apply_memory(&mut bag, &desired, false).unwrap();
        assert_eq!(changes.aligned_startup, 1026);
        assert_eq!(bag.get_u64(BACKING_PAGE_SIZE), Some(1));
    }

    #[test]
    fn unspecified_page_size_keeps_host_huge_pages() {
        let mut bag = host_memory();
        bag.set(BACKING_PAGE_SIZE, 2u8).unwrap();
        let desired = MemoryConfiguration {
            startup: 2000,
            dynamic_memory_enabled: true,
            backing_page_size: None,
            ..Default::default()
        };
        let changes = apply_memory(&mut bag, &desired, false).unwrap();
        assert!(changes.huge_pages);
        assert_eq!(changes.aligned_startup, 2048);
        assert_eq!(bag.get_u64(BACKING_PAGE_SIZE), Some(2));
        assert_eq!(bag.get_bool(DYNAMIC_MEMORY_ENABLED), Some(false));
    }

    #[test]
    fn running_vm_aligns_to_its_current_page_size() {
        let mut bag = host_memory();
        bag.set(BACKING_PAGE_SIZE, 1u8).unwrap();
        let desired = MemoryConfiguration {
            startup: 1001,
            backing_page_size: Some(BackingPageSize::Huge1Gb),
            ..Default::default()
        };
        let changes = apply_memory(&mut bag, &desired, true).unwrap();
        assert_eq!(changes.alignment, 2);
        assert_eq!(bag.get_u64(VIRTUAL_QUANTITY), Some(1002));
        assert_eq!(bag.get_u64(BACKING_PAGE_SIZE), Some(1));
    }

    #[test]
    fn dynamic_memory_uses_requested_bounds() {
        let mut bag = host_memory();
        let desired = MemoryConfiguration {
            startup: 2048,
            minimum: 512,
            maximum: 8192,
            buffer: 35,
            priority: 70,
            dynamic_memory_enabled: true,
            backing_page_size: Some(BackingPageSize::Small),
            ..Default::default()
        };
        let changes = apply_memory(&mut bag, &desired, false).unwrap();

        assert!(!changes.huge_pages);
        assert_eq!(bag.get_bool(DYNAMIC_MEMORY_ENABLED), Some(true));
        assert_eq!(bag.get_u64(RESERVATION), Some(512));
        assert_eq!(bag.get_u64(LIMIT), Some(8192));
        assert_eq!(bag.get_u64(TARGET_MEMORY_BUFFER), Some(35));
        assert_eq!(bag.get_u64(WEIGHT), Some(7000));
    }

    #[test]
    fn static_memory_pins_bounds_to_startup() {
        let mut bag = host_memory();
        let desired = MemoryConfiguration {
            startup: 4096,
            minimum: 512,
            maximum: 8192,
            dynamic_memory_enabled: false,
            ..Default::default()
        };
        apply_memory(&mut bag, &desired, false).unwrap();
        assert_eq!(bag.get_u64(RESERVATION), Some(4096));
        assert_eq!(bag.get_u64(LIMIT), Some(4096));
    }

    #[test]
    fn running_vm_leaves_structural_fields_alone() {
        let mut bag = host_memory();
        bag.set(DYNAMIC_MEMORY_ENABLED, true).unwrap();
        let desired = MemoryConfiguration {
            memory_encryption_policy: Some(1),
            ..huge_page_request()
        };
        let changes = apply_memory(&mut bag, &desired, true).unwrap();

        assert_eq!(bag.get_u64(BACKING_PAGE_SIZE), Some(0));
        assert_eq!(bag.get_u64(MEMORY_ENCRYPTION_POLICY), Some(0));
        assert_eq!(bag.get_bool(DYNAMIC_MEMORY_ENABLED), Some(true));
        assert_eq!(bag.get_u64(RESERVATION), Some(1000));
        assert_eq!(bag.get_u64(LIMIT), Some(5000));
        assert_eq!(bag.get_u64(MAX_MEMORY_BLOCKS_PER_NUMA_NODE), Some(1_048_575));
        assert!(changes.skipped.contains(&BACKING_PAGE_SIZE));
        assert!(changes.skipped.contains(&MEMORY_ENCRYPTION_POLICY));
    }

    #[test]
    fn running_static_vm_keeps_bounds() {
        let mut bag = host_memory();
        let desired = MemoryConfiguration {
            dynamic_memory_enabled: true,
            minimum: 256,
            maximum: 9999,
            ..Default::default()
        };
        let changes = apply_memory(&mut bag, &desired, true).unwrap();
        assert!(!changes.dynamic_memory_enabled);
        assert_eq!(bag.get_u64(RESERVATION), Some(512));
        assert_eq!(bag.get_u64(LIMIT), Some(1_048_576));
    }

    #[test]
    fn host_without_page_size_support_ignores_huge_pages() {
        let mut bag = host_memory();
        bag.remove(BACKING_PAGE_SIZE);
        bag.remove(MAX_MEMORY_BLOCKS_PER_NUMA_NODE);
        let changes = apply_memory(&mut bag, &huge_page_request(), false).unwrap();

        assert_eq!(changes.alignment, 1);
        assert_eq!(changes.aligned_startup, 3000);
        assert_eq!(bag.get_bool(DYNAMIC_MEMORY_ENABLED), Some(true));
        assert!(changes.skipped.contains(&BACKING_PAGE_SIZE));
    }

    #[test]
    fn missing_buffer_property_is_skipped() {
        let mut bag = host_memory();
        bag.remove(TARGET_MEMORY_BUFFER);
        let desired = MemoryConfiguration {
            dynamic_memory_enabled: true,
            ..Default::default()
        };
        let changes = apply_memory(&mut bag, &desired, false).unwrap();
        assert_eq!(changes.skipped, vec![TARGET_MEMORY_BUFFER]);
    }

    #[test]
    fn repeated_application_is_stable() {
        let mut once = host_memory();
        apply_memory(&mut once, &huge_page_request(), false).unwrap();
        let mut twice = once.clone();
        apply_memory(&mut twice, &huge_page_request(), false).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn read_back_projects_host_units() {
        let mut bag = host_memory();
        bag.set(WEIGHT, 8000u32).unwrap();
        bag.set(BACKING_PAGE_SIZE, 1u8).unwrap();
        let config = read_memory(&bag);
        assert_eq!(config.startup, 1024);
        assert_eq!(config.priority, 80);
        assert_eq!(config.buffer, 20);
        assert_eq!(config.backing_page_size, Some(BackingPageSize::Large2Mb));
        assert_eq!(config.memory_encryption_policy, Some(0));
    }

    #[test]
    fn read_back_defaults_absent_fields() {
        let mut bag = PropertyBag::new();
        bag.insert(VIRTUAL_QUANTITY, 2048u64);
        let config = read_memory(&bag);
        assert_eq!(config.priority, DEFAULT_MEMORY_PRIORITY);
        assert_eq!(config.buffer, DEFAULT_MEMORY_BUFFER);
        assert_eq!(config.backing_page_size, None);
        assert_eq!(config.memory_encryption_policy, None);
    }

    proptest! {
        #[test]
        fn aligned_startup_is_smallest_multiple(
            startup in 0u64..=1 << 40,
            alignment in prop::sample::select(vec![1u64, 2, 1024]),
        ) {
            let aligned = align_up(startup, alignment);
            prop_assert_eq!(aligned % alignment, 0);
            prop_assert!(aligned >= startup);
            prop_assert!(aligned - startup < alignment);
        }

        #[test]
        fn numa_block_is_aligned_and_nonzero(
            current in 0u64..=1 << 40,
            alignment in prop::sample::select(vec![1u64, 2, 1024]),
        ) {
            let block = align_numa_block(current, alignment);
            prop_assert_eq!(block % alignment, 0);
            prop_assert!(block >= alignment);
            prop_assert!(block <= current.max(alignment));
        }

        #[test]
        fn huge_pages_ignore_requested_bounds(
            startup in 0u64..=1 << 20,
            minimum in any::<u32>(),
            maximum in any::<u32>(),
            dynamic in any::<bool>(),
        ) {
            let mut bag = host_memory();
            let desired = MemoryConfiguration {
                startup,
                minimum: minimum.into(),
                maximum: maximum.into(),
                dynamic_memory_enabled: dynamic,
                backing_page_size: Some(BackingPageSize::Huge1Gb),
                ..Default::default()
            };
            let changes = apply_memory(&mut bag, &desired, false).unwrap();
            prop_assert_eq!(bag.get_bool(DYNAMIC_MEMORY_ENABLED), Some(false));
            prop_assert_eq!(bag.get_u64(RESERVATION), Some(changes.aligned_startup));
            prop_assert_eq!(bag.get_u64(LIMIT), Some(changes.aligned_startup));
        }
    }
}
