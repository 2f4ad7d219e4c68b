//! Typed settings queries.
//!
//! Replaces hand-built filter strings with a small value type that
//! backends evaluate with [`SettingsQuery::matches`].

use crate::types::{EntityKind, ManagementObject};

/// Resource-type discriminator for memory settings.
pub const RESOURCE_TYPE_MEMORY: u16 = 4;

/// Resource-type discriminator for processor settings.
pub const RESOURCE_TYPE_PROCESSOR: u16 = 3;

/// Match on an object's `InstanceID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFilter {
    Any,
    /// `InstanceID LIKE '<prefix>%'`
    Prefix(String),
    /// `InstanceID LIKE '%<fragment>%'`
    Contains(String),
}

/// A filtered lookup of settings objects of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsQuery {
    pub kind: EntityKind,
    pub instance: InstanceFilter,
    pub resource_type: Option<u16>,
}

impl SettingsQuery {
    pub fn all(kind: EntityKind) -> Self {
        Self {
            kind,
            instance: InstanceFilter::Any,
            resource_type: None,
        }
    }

    /// Memory settings belonging to the VM with host id `vm_id`.
    pub fn memory_for_vm(vm_id: &str) -> Self {
        Self {
            kind: EntityKind::MemorySettings,
            instance: InstanceFilter::Prefix(format!("Microsoft:{vm_id}")),
            resource_type: Some(RESOURCE_TYPE_MEMORY),
        }
    }

    /// Processor settings whose instance id mentions `vm_id`.
    pub fn processor_for_vm(vm_id: &str) -> Self {
        Self {
            kind: EntityKind::ProcessorSettings,
            instance: InstanceFilter::Contains(vm_id.to_string()),
            resource_type: None,
        }
    }

    pub fn matches(&self, object: &ManagementObject) -> bool {
        if object.kind != self.kind {
            return false;
        }
        if let Some(resource_type) = self.resource_type {
            if object.get_u64("ResourceType") != Some(u64::from(resource_type)) {
                return false;
            }
        }
        let instance_id = object.instance_id().unwrap_or_default();
        match &self.instance {
            InstanceFilter::Any => true,
            InstanceFilter::Prefix(prefix) => starts_with_ignore_case(instance_id, prefix),
            InstanceFilter::Contains(fragment) => instance_id
                .to_ascii_lowercase()
                .contains(&fragment.to_ascii_lowercase()),
        }
    }
}

fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len()
        && haystack.is_char_boundary(prefix.len())
        && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectPath, PropertyBag};

    fn memory_object(instance_id: &str, resource_type: u16) -> ManagementObject {
        let mut bag = PropertyBag::new();
        bag.insert("InstanceID", instance_id);
        bag.insert("ResourceType", resource_type);
        ManagementObject::new(
            EntityKind::MemorySettings,
            ObjectPath::new(instance_id),
            bag,
        )
    }

    #[test]
    fn memory_query_matches_prefix_and_resource_type() {
        let query = SettingsQuery::memory_for_vm("ABC");
        assert!(query.matches(&memory_object(r"Microsoft:abc\4764", 4)));
        assert!(!query.matches(&memory_object(r"Microsoft:abc\4764", 3)));
        assert!(!query.matches(&memory_object(r"Microsoft:xyz\4764", 4)));
    }

    #[test]
    fn processor_query_matches_fragment_anywhere() {
        let query = SettingsQuery::processor_for_vm("abc");
        let mut object = memory_object(r"Microsoft:Definition\ABC\0", 3);
        object.kind = EntityKind::ProcessorSettings;
        assert!(query.matches(&object));
    }
}
