//! Settings documents: the text form of one object's property bag.
//!
//! Modification methods take documents, not objects. A document lists
//! property nodes (name, CIM type, optional value). Some hosts omit a node
//! entirely when the property has never been set, so editors must be able
//! to synthesize a node before assigning it.
//!
//! ```json
//! {
//!   "ClassName": "Msvm_ProcessorSettingData",
//!   "Path": "Msvm_ProcessorSettingData.InstanceID=\"...\"",
//!   "Properties": [
//!     { "Name": "VirtualQuantity", "Type": "uint64", "Value": "4" },
//!     { "Name": "CpuGroupId", "Type": "string" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::types::{CimType, EntityKind, ManagementObject, ObjectPath, PropertyBag, PropertyValue};

/// One property node of a settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyNode {
    pub name: String,
    #[serde(rename = "Type")]
    pub cim_type: CimType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// A serialized management object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SettingsDocument {
    pub class_name: String,
    pub path: ObjectPath,
    pub properties: Vec<PropertyNode>,
}

impl SettingsDocument {
    pub fn from_object(object: &ManagementObject) -> Self {
        let properties = object
            .properties
            .iter()
            .map(|(name, property)| PropertyNode {
                name: name.to_string(),
                cim_type: property.cim_type,
                value: property.value.as_ref().map(PropertyValue::to_text),
            })
            .collect();
        Self {
            class_name: object.kind.class_name().to_string(),
            path: object.path.clone(),
            properties,
        }
    }

    pub fn parse(text: &str) -> BridgeResult<Self> {
        serde_json::from_str(text).map_err(|e| BridgeError::Document(e.to_string()))
    }

    pub fn to_text(&self) -> BridgeResult<String> {
        serde_json::to_string(self).map_err(|e| BridgeError::Document(e.to_string()))
    }

    pub fn kind(&self) -> BridgeResult<EntityKind> {
        EntityKind::from_class_name(&self.class_name)
            .ok_or_else(|| BridgeError::Document(format!("unknown class {}", self.class_name)))
    }

    pub fn node(&self, name: &str) -> Option<&PropertyNode> {
        self.properties
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
    }

    /// Return the node for `name`, appending an empty one if the document
    /// has none.
    pub fn ensure_node(&mut self, name: &str, cim_type: CimType) -> &mut PropertyNode {
        let index = match self
            .properties
            .iter()
            .position(|n| n.name.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                self.properties.push(PropertyNode {
                    name: name.to_string(),
                    cim_type,
                    value: None,
                });
                self.properties.len() - 1
            }
        };
        &mut self.properties[index]
    }

    /// Assign `value` to `name`, synthesizing the node when it is missing.
    pub fn set_value(&mut self, name: &str, value: impl Into<PropertyValue>) -> BridgeResult<()> {
        let value = value.into();
        let node = self.ensure_node(name, value.cim_type());
        let value = value.coerce(name, node.cim_type)?;
        node.value = Some(value.to_text());
        Ok(())
    }

    /// Rebuild the typed property bag described by this document.
    pub fn to_bag(&self) -> BridgeResult<PropertyBag> {
        let mut bag = PropertyBag::new();
        for node in &self.properties {
            match &node.value {
                Some(text) => {
                    bag.insert(
                        node.name.clone(),
                        PropertyValue::parse(&node.name, node.cim_type, text)?,
                    );
                }
                None => bag.declare(node.name.clone(), node.cim_type),
            }
        }
        Ok(bag)
    }
}
