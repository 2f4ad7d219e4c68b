//! JSON documents exchanged with the host compute service.
//!
//! Requests are `{PropertyType, Settings: {Operation, OperationDetails}}`.
//! Property queries name the property types to return; the response nests
//! each type's data under `Properties`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hvres_model::CpuGroupDescriptor;

/// Property type for CPU-group requests and queries.
pub const CPU_GROUP_PROPERTY: &str = "CpuGroup";

/// `PropertyCode` of a group's capacity cap.
pub const CPU_CAP_PROPERTY_CODE: u32 = 0x0001_0000;

/// A modification request for `ModifyServiceSettings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyRequest {
    pub property_type: String,
    pub settings: CpuGroupOperation,
}

impl ModifyRequest {
    pub fn cpu_group(operation: CpuGroupOperation) -> Self {
        Self {
            property_type: CPU_GROUP_PROPERTY.to_string(),
            settings: operation,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// CPU-group lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Operation", content = "OperationDetails")]
pub enum CpuGroupOperation {
    #[serde(rename_all = "PascalCase")]
    CreateGroup {
        group_id: Uuid,
        logical_processor_count: u32,
        logical_processors: Vec<u32>,
    },
    #[serde(rename_all = "PascalCase")]
    DeleteGroup { group_id: Uuid },
    #[serde(rename_all = "PascalCase")]
    SetProperty {
        group_id: Uuid,
        property_code: u32,
        property_value: u64,
    },
}

impl CpuGroupOperation {
    pub fn create(group: &CpuGroupDescriptor) -> Self {
        let logical_processors: Vec<u32> = group.logical_processors.iter().copied().collect();
        CpuGroupOperation::CreateGroup {
            group_id: group.group_id,
            logical_processor_count: logical_processors.len() as u32,
            logical_processors,
        }
    }

    pub fn delete(group_id: Uuid) -> Self {
        CpuGroupOperation::DeleteGroup { group_id }
    }

    pub fn set_cap(group_id: Uuid, cap: u16) -> Self {
        CpuGroupOperation::SetProperty {
            group_id,
            property_code: CPU_CAP_PROPERTY_CODE,
            property_value: u64::from(cap),
        }
    }

    pub fn group_id(&self) -> Uuid {
        match self {
            CpuGroupOperation::CreateGroup { group_id, .. }
            | CpuGroupOperation::DeleteGroup { group_id }
            | CpuGroupOperation::SetProperty { group_id, .. } => *group_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CpuGroupOperation::CreateGroup { .. } => "CreateGroup",
            CpuGroupOperation::DeleteGroup { .. } => "DeleteGroup",
            CpuGroupOperation::SetProperty { .. } => "SetProperty",
        }
    }
}

/// A query for `GetServiceProperties`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyQuery {
    pub property_types: Vec<String>,
}

impl PropertyQuery {
    pub fn cpu_groups() -> Self {
        Self {
            property_types: vec![CPU_GROUP_PROPERTY.to_string()],
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────
//
// Parsed leniently: hosts differ in which members they emit.

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceProperties {
    #[serde(default)]
    pub properties: Vec<PropertyEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyEntry {
    #[serde(default)]
    pub cpu_groups: Vec<CpuGroupEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CpuGroupEntry {
    pub group_id: Uuid,
    #[serde(default)]
    pub affinity: GroupAffinity,
    #[serde(default)]
    pub group_properties: Vec<GroupProperty>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupAffinity {
    #[serde(default)]
    pub logical_processor_count: u32,
    #[serde(default)]
    pub logical_processors: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupProperty {
    pub property_code: u32,
    pub property_value: u64,
}

/// A CPU group as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuGroupInfo {
    pub group_id: Uuid,
    pub logical_processors: Vec<u32>,
    /// `None` when the host reports no cap or one outside 0..=65535.
    pub cap: Option<u16>,
}

impl From<CpuGroupEntry> for CpuGroupInfo {
    fn from(entry: CpuGroupEntry) -> Self {
        let cap = entry
            .group_properties
            .iter()
            .find(|p| p.property_code == CPU_CAP_PROPERTY_CODE)
            .and_then(|p| u16::try_from(p.property_value).ok());
        Self {
            group_id: entry.group_id,
            logical_processors: entry.affinity.logical_processors,
            cap,
        }
    }
}

impl ServiceProperties {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Every CPU group in the document, in the order reported.
    pub fn into_cpu_groups(self) -> Vec<CpuGroupInfo> {
        self.properties
            .into_iter()
            .flat_map(|p| p.cpu_groups)
            .map(CpuGroupInfo::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_id() -> Uuid {
        Uuid::parse_str("0a1b2c3d-0000-4000-8000-000000000001").unwrap()
    }

    #[test]
    fn create_request_shape() {
        let group = CpuGroupDescriptor::new(group_id(), [3, 1, 2]);
        let json = ModifyRequest::cpu_group(CpuGroupOperation::create(&group))
            .to_json()
            .unwrap();
        assert_eq!(
            json,
            r#"{"PropertyType":"CpuGroup","Settings":{"Operation":"CreateGroup","OperationDetails":{"GroupId":"0a1b2c3d-0000-4000-8000-000000000001","LogicalProcessorCount":3,"LogicalProcessors":[1,2,3]}}}"#
        );
    }

    #[test]
    fn delete_request_shape() {
        let json = ModifyRequest::cpu_group(CpuGroupOperation::delete(group_id()))
            .to_json()
            .unwrap();
        assert_eq!(
            json,
            r#"{"PropertyType":"CpuGroup","Settings":{"Operation":"DeleteGroup","OperationDetails":{"GroupId":"0a1b2c3d-0000-4000-8000-000000000001"}}}"#
        );
    }

    #[test]
    fn cap_request_shape() {
        let json = ModifyRequest::cpu_group(CpuGroupOperation::set_cap(group_id(), 50))
            .to_json()
            .unwrap();
        assert_eq!(
            json,
            r#"{"PropertyType":"CpuGroup","Settings":{"Operation":"SetProperty","OperationDetails":{"GroupId":"0a1b2c3d-0000-4000-8000-000000000001","PropertyCode":65536,"PropertyValue":50}}}"#
        );
    }

    #[test]
    fn query_shape() {
        let json = serde_json::to_string(&PropertyQuery::cpu_groups()).unwrap();
        assert_eq!(json, r#"{"PropertyTypes":["CpuGroup"]}"#);
    }

    #[test]
    fn parses_host_group_listing() {
        let text = r#"{
            "Properties": [{
                "CpuGroups": [
                    {
                        "GroupId": "0A1B2C3D-0000-4000-8000-000000000001",
                        "Affinity": {"LogicalProcessorCount": 2, "LogicalProcessors": [4, 5]},
                        "GroupProperties": [{"PropertyCode": 65536, "PropertyValue": 200}]
                    },
                    {
                        "GroupId": "00000000-0000-0000-0000-0000000000aa",
                        "Affinity": {"LogicalProcessorCount": 1, "LogicalProcessors": [0]}
                    }
                ]
            }]
        }"#;
        let groups = ServiceProperties::parse(text).unwrap().into_cpu_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_id, group_id());
        assert_eq!(groups[0].logical_processors, vec![4, 5]);
        assert_eq!(groups[0].cap, Some(200));
        assert_eq!(groups[1].cap, None);
    }

    #[test]
    fn empty_document_has_no_groups() {
        let groups = ServiceProperties::parse("{}").unwrap().into_cpu_groups();
        assert!(groups.is_empty());
    }
}
