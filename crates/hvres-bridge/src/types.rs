//! Typed property bags for host management objects.
//!
//! The host exposes late-bound objects: a class name plus a set of named,
//! CIM-typed properties whose membership varies by host build. These types
//! model that as an explicit map from property name to a typed slot, so a
//! missing property is a lookup miss instead of a reflection failure.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

// ── Entity kinds ──────────────────────────────────────────────────

/// The kinds of host object hvres reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A virtual machine.
    ComputerSystem,
    /// A VM's system-level settings snapshot (realized or definition).
    SystemSettings,
    MemorySettings,
    ProcessorSettings,
    /// The singleton service that accepts modification requests.
    ManagementService,
    /// Host-wide settings of the management service.
    ServiceSettings,
    /// An asynchronous job started by a modification request.
    Job,
}

impl EntityKind {
    /// Class name in the host's management schema.
    pub fn class_name(self) -> &'static str {
        match self {
            EntityKind::ComputerSystem => "Msvm_ComputerSystem",
            EntityKind::SystemSettings => "Msvm_VirtualSystemSettingData",
            EntityKind::MemorySettings => "Msvm_MemorySettingData",
            EntityKind::ProcessorSettings => "Msvm_ProcessorSettingData",
            EntityKind::ManagementService => "Msvm_VirtualSystemManagementService",
            EntityKind::ServiceSettings => "Msvm_VirtualSystemManagementServiceSettingData",
            EntityKind::Job => "Msvm_ConcreteJob",
        }
    }

    pub fn from_class_name(name: &str) -> Option<Self> {
        [
            EntityKind::ComputerSystem,
            EntityKind::SystemSettings,
            EntityKind::MemorySettings,
            EntityKind::ProcessorSettings,
            EntityKind::ManagementService,
            EntityKind::ServiceSettings,
            EntityKind::Job,
        ]
        .into_iter()
        .find(|kind| kind.class_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

// ── Values ────────────────────────────────────────────────────────

/// CIM type of a property slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CimType {
    Boolean,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    String,
}

impl CimType {
    pub fn as_str(self) -> &'static str {
        match self {
            CimType::Boolean => "boolean",
            CimType::Uint8 => "uint8",
            CimType::Uint16 => "uint16",
            CimType::Uint32 => "uint32",
            CimType::Uint64 => "uint64",
            CimType::String => "string",
        }
    }

    fn is_unsigned(self) -> bool {
        matches!(
            self,
            CimType::Uint8 | CimType::Uint16 | CimType::Uint32 | CimType::Uint64
        )
    }
}

impl fmt::Display for CimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-null property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Boolean(bool),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    String(String),
}

impl PropertyValue {
    pub fn cim_type(&self) -> CimType {
        match self {
            PropertyValue::Boolean(_) => CimType::Boolean,
            PropertyValue::Uint8(_) => CimType::Uint8,
            PropertyValue::Uint16(_) => CimType::Uint16,
            PropertyValue::Uint32(_) => CimType::Uint32,
            PropertyValue::Uint64(_) => CimType::Uint64,
            PropertyValue::String(_) => CimType::String,
        }
    }

    /// Any unsigned integer, widened.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            PropertyValue::Uint8(v) => Some(v.into()),
            PropertyValue::Uint16(v) => Some(v.into()),
            PropertyValue::Uint32(v) => Some(v.into()),
            PropertyValue::Uint64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            PropertyValue::Boolean(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Text form used in settings documents.
    pub fn to_text(&self) -> String {
        match self {
            PropertyValue::Boolean(v) => (if *v { "TRUE" } else { "FALSE" }).to_string(),
            PropertyValue::Uint8(v) => v.to_string(),
            PropertyValue::Uint16(v) => v.to_string(),
            PropertyValue::Uint32(v) => v.to_string(),
            PropertyValue::Uint64(v) => v.to_string(),
            PropertyValue::String(v) => v.clone(),
        }
    }

    /// Parse the text form of a value of the given type.
    pub fn parse(name: &str, cim_type: CimType, text: &str) -> BridgeResult<Self> {
        let invalid = || BridgeError::InvalidValue {
            name: name.to_string(),
            cim_type,
            value: text.to_string(),
        };
        let value = match cim_type {
            CimType::Boolean => {
                if text.eq_ignore_ascii_case("true") {
                    PropertyValue::Boolean(true)
                } else if text.eq_ignore_ascii_case("false") {
                    PropertyValue::Boolean(false)
                } else {
                    return Err(invalid());
                }
            }
            CimType::Uint8 => PropertyValue::Uint8(text.parse().map_err(|_| invalid())?),
            CimType::Uint16 => PropertyValue::Uint16(text.parse().map_err(|_| invalid())?),
            CimType::Uint32 => PropertyValue::Uint32(text.parse().map_err(|_| invalid())?),
            CimType::Uint64 => PropertyValue::Uint64(text.parse().map_err(|_| invalid())?),
            CimType::String => PropertyValue::String(text.to_string()),
        };
        Ok(value)
    }

    /// Convert to `target`, the way the host coerces assignments: unsigned
    /// integers convert between widths when they fit, nothing else converts.
    pub fn coerce(self, name: &str, target: CimType) -> BridgeResult<Self> {
        let found = self.cim_type();
        if found == target {
            return Ok(self);
        }
        let mismatch = || BridgeError::TypeMismatch {
            name: name.to_string(),
            expected: target,
            found,
        };
        if !(found.is_unsigned() && target.is_unsigned()) {
            return Err(mismatch());
        }
        let Some(wide) = self.as_u64() else {
            return Err(mismatch());
        };
        let out_of_range = || BridgeError::InvalidValue {
            name: name.to_string(),
            cim_type: target,
            value: wide.to_string(),
        };
        Ok(match target {
            CimType::Uint8 => PropertyValue::Uint8(u8::try_from(wide).map_err(|_| out_of_range())?),
            CimType::Uint16 => {
                PropertyValue::Uint16(u16::try_from(wide).map_err(|_| out_of_range())?)
            }
            CimType::Uint32 => {
                PropertyValue::Uint32(u32::try_from(wide).map_err(|_| out_of_range())?)
            }
            CimType::Uint64 => PropertyValue::Uint64(wide),
            CimType::Boolean | CimType::String => return Err(mismatch()),
        })
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

impl From<u8> for PropertyValue {
    fn from(v: u8) -> Self {
        PropertyValue::Uint8(v)
    }
}

impl From<u16> for PropertyValue {
    fn from(v: u16) -> Self {
        PropertyValue::Uint16(v)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Uint32(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Uint64(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

/// One typed property slot. `value` is `None` when the host reports null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RawProperty", try_from = "RawProperty")]
pub struct Property {
    pub cim_type: CimType,
    pub value: Option<PropertyValue>,
}

/// Wire form of [`Property`]: type tag plus the document text of the value.
#[derive(Serialize, Deserialize)]
struct RawProperty {
    #[serde(rename = "type")]
    cim_type: CimType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl From<Property> for RawProperty {
    fn from(p: Property) -> Self {
        RawProperty {
            cim_type: p.cim_type,
            value: p.value.map(|v| v.to_text()),
        }
    }
}

impl TryFrom<RawProperty> for Property {
    type Error = BridgeError;

    fn try_from(raw: RawProperty) -> BridgeResult<Self> {
        let value = raw
            .value
            .map(|text| PropertyValue::parse("<snapshot>", raw.cim_type, &text))
            .transpose()?;
        Ok(Property {
            cim_type: raw.cim_type,
            value,
        })
    }
}

// ── Property bag ──────────────────────────────────────────────────

/// The properties of one management object.
///
/// Lookups are case-insensitive, matching the host. Setting a property the
/// schema does not declare fails with [`BridgeError::PropertyAbsent`];
/// callers are expected to probe with [`has`](Self::has) first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBag {
    properties: BTreeMap<String, Property>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self, name: &str) -> Option<&str> {
        if let Some((k, _)) = self.properties.get_key_value(name) {
            return Some(k.as_str());
        }
        self.properties
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    /// Declare (or redeclare) a property with a value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        let value = value.into();
        self.properties.insert(
            name.into(),
            Property {
                cim_type: value.cim_type(),
                value: Some(value),
            },
        );
    }

    /// Declare a property whose current value is null.
    pub fn declare(&mut self, name: impl Into<String>, cim_type: CimType) {
        self.properties.insert(
            name.into(),
            Property {
                cim_type,
                value: None,
            },
        );
    }

    /// Remove a property from the schema entirely.
    pub fn remove(&mut self, name: &str) -> Option<Property> {
        let key = self.key(name)?.to_string();
        self.properties.remove(&key)
    }

    /// Capability probe: does this host's schema carry the property?
    pub fn has(&self, name: &str) -> bool {
        self.key(name).is_some()
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.key(name).and_then(|k| self.properties.get(k))
    }

    /// Current value; `None` if absent or null.
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.property(name).and_then(|p| p.value.as_ref())
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(PropertyValue::as_u64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(PropertyValue::as_bool)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PropertyValue::as_str)
    }

    /// Assign a value, coercing it to the declared type.
    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) -> BridgeResult<()> {
        let key = self
            .key(name)
            .ok_or_else(|| BridgeError::PropertyAbsent(name.to_string()))?
            .to_string();
        let slot = self
            .properties
            .get_mut(&key)
            .ok_or_else(|| BridgeError::PropertyAbsent(name.to_string()))?;
        slot.value = Some(value.into().coerce(&key, slot.cim_type)?);
        Ok(())
    }

    pub fn set_null(&mut self, name: &str) -> BridgeResult<()> {
        let key = self
            .key(name)
            .ok_or_else(|| BridgeError::PropertyAbsent(name.to_string()))?
            .to_string();
        if let Some(slot) = self.properties.get_mut(&key) {
            slot.value = None;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for PropertyBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = PropertyBag::new();
        for (k, v) in iter {
            bag.insert(k, v);
        }
        bag
    }
}

// ── Objects ───────────────────────────────────────────────────────

/// Opaque host reference to a management object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Path of the instance of `kind` whose key property equals `key`.
    pub fn for_instance(kind: EntityKind, key_property: &str, key: &str) -> Self {
        Self(format!(
            "{}.{}=\"{}\"",
            kind.class_name(),
            key_property,
            key.replace('\\', "\\\\").replace('"', "\\\"")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A detached snapshot of a host object: kind, path and property bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementObject {
    pub kind: EntityKind,
    pub path: ObjectPath,
    pub properties: PropertyBag,
}

impl ManagementObject {
    pub fn new(kind: EntityKind, path: ObjectPath, properties: PropertyBag) -> Self {
        Self {
            kind,
            path,
            properties,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.properties.has(name)
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.properties.get_u64(name)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.properties.get_bool(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.properties.get_str(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) -> BridgeResult<()> {
        self.properties.set(name, value)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.get_str("InstanceID")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_names_round_trip() {
        for kind in [
            EntityKind::ComputerSystem,
            EntityKind::MemorySettings,
            EntityKind::Job,
        ] {
            assert_eq!(EntityKind::from_class_name(kind.class_name()), Some(kind));
        }
        assert_eq!(
            EntityKind::from_class_name("msvm_processorsettingdata"),
            Some(EntityKind::ProcessorSettings)
        );
        assert_eq!(EntityKind::from_class_name("Win32_Processor"), None);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut bag = PropertyBag::new();
        bag.insert("VirtualQuantity", 1024u64);
        assert!(bag.has("virtualquantity"));
        assert_eq!(bag.get_u64("VIRTUALQUANTITY"), Some(1024));
    }

    #[test]
    fn set_coerces_to_declared_width() {
        let mut bag = PropertyBag::new();
        bag.insert("Weight", 5000u32);
        bag.set("Weight", 8000u64).unwrap();
        assert_eq!(bag.get("Weight"), Some(&PropertyValue::Uint32(8000)));
    }

    #[test]
    fn set_rejects_out_of_range_narrowing() {
        let mut bag = PropertyBag::new();
        bag.insert("BackingPageSize", 0u8);
        let err = bag.set("BackingPageSize", 300u64).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidValue { .. }));
    }

    #[test]
    fn set_rejects_bool_into_integer() {
        let mut bag = PropertyBag::new();
        bag.insert("Limit", 100000u64);
        let err = bag.set("Limit", true).unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch { .. }));
    }

    #[test]
    fn set_absent_property_fails() {
        let mut bag = PropertyBag::new();
        let err = bag.set("EnableSocketTopology", true).unwrap_err();
        assert!(matches!(err, BridgeError::PropertyAbsent(_)));
    }

    #[test]
    fn null_slot_is_present_but_has_no_value() {
        let mut bag = PropertyBag::new();
        bag.declare("CpuGroupId", CimType::String);
        assert!(bag.has("CpuGroupId"));
        assert_eq!(bag.get("CpuGroupId"), None);
        bag.set("CpuGroupId", "00000000-0000-0000-0000-000000000000")
            .unwrap();
        assert!(bag.get_str("CpuGroupId").is_some());
    }

    #[test]
    fn parse_values() {
        assert_eq!(
            PropertyValue::parse("x", CimType::Boolean, "True").unwrap(),
            PropertyValue::Boolean(true)
        );
        assert_eq!(
            PropertyValue::parse("x", CimType::Uint16, "4096").unwrap(),
            PropertyValue::Uint16(4096)
        );
        assert!(PropertyValue::parse("x", CimType::Uint8, "256").is_err());
        assert!(PropertyValue::parse("x", CimType::Boolean, "yes").is_err());
    }

    #[test]
    fn bag_serializes_as_typed_text() {
        let mut bag = PropertyBag::new();
        bag.insert("DynamicMemoryEnabled", false);
        bag.declare("CpuGroupId", CimType::String);
        let json = serde_json::to_value(&bag).unwrap();
        assert_eq!(json["DynamicMemoryEnabled"]["type"], "boolean");
        assert_eq!(json["DynamicMemoryEnabled"]["value"], "FALSE");
        assert!(json["CpuGroupId"].get("value").is_none());

        let back: PropertyBag = serde_json::from_value(json).unwrap();
        assert_eq!(back, bag);
    }

    #[test]
    fn object_path_escapes_key() {
        let path = ObjectPath::for_instance(
            EntityKind::MemorySettings,
            "InstanceID",
            r"Microsoft:abc\4764",
        );
        assert_eq!(
            path.as_str(),
            r#"Msvm_MemorySettingData.InstanceID="Microsoft:abc\\4764""#
        );
    }
}
