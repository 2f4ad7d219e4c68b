//! In-memory host compute service.
//!
//! `FakeHostCompute` keeps CPU groups in memory, answers the same JSON
//! requests the real service does, and counts every buffer it hands out and
//! every buffer the caller releases.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::api::{HostComputeApi, ModifyResponse, QueryResponse};
use crate::buffer::OwnedBuffer;
use crate::error::NativeResult;
use crate::protocol::{
    CPU_CAP_PROPERTY_CODE, CPU_GROUP_PROPERTY, CpuGroupEntry, CpuGroupOperation, GroupAffinity,
    GroupProperty, ModifyRequest, PropertyEntry, PropertyQuery, ServiceProperties,
};

/// `E_INVALIDARG`.
pub const HCS_E_INVALID_ARG: i32 = 0x8007_0057_u32 as i32;
/// `HRESULT_FROM_WIN32(ERROR_NOT_FOUND)`.
pub const HCS_E_NOT_FOUND: i32 = 0x8007_0490_u32 as i32;
/// `HRESULT_FROM_WIN32(ERROR_ALREADY_EXISTS)`.
pub const HCS_E_ALREADY_EXISTS: i32 = 0x8007_00B7_u32 as i32;

/// A buffer that bumps a shared counter when released.
#[derive(Debug)]
pub struct FakeBuffer {
    text: String,
    released: Arc<AtomicUsize>,
}

impl OwnedBuffer for FakeBuffer {
    fn to_string_lossy(&self) -> String {
        self.text.clone()
    }
}

impl Drop for FakeBuffer {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct GroupRecord {
    logical_processors: Vec<u32>,
    cap: Option<u64>,
}

#[derive(Default)]
struct FakeState {
    groups: BTreeMap<Uuid, GroupRecord>,
    /// `None` lets one call through.
    failures: VecDeque<Option<i32>>,
    requests: Vec<String>,
}

/// An in-memory [`HostComputeApi`].
#[derive(Default)]
pub struct FakeHostCompute {
    state: Mutex<FakeState>,
    allocated: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl FakeHostCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with `status`, without touching any group.
    pub fn fail_next(&self, status: i32) {
        self.state.lock().failures.push_back(Some(status));
    }

    /// Let the next call through before any queued failure applies.
    pub fn succeed_next(&self) {
        self.state.lock().failures.push_back(None);
    }

    /// Every request document received so far.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    pub fn group_ids(&self) -> Vec<Uuid> {
        self.state.lock().groups.keys().copied().collect()
    }

    /// Buffers handed to callers.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Buffers callers have released.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Write the group table to a JSON file.
    pub fn save(&self, path: &Path) -> NativeResult<()> {
        let text = serde_json::to_string_pretty(&self.state.lock().groups)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Load a group table written by [`save`](Self::save). A missing file
    /// yields a host with no groups.
    pub fn load(path: &Path) -> NativeResult<Self> {
        let fake = Self::new();
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            fake.state.lock().groups = serde_json::from_str(&text)?;
        }
        Ok(fake)
    }

    fn buffer(&self, text: String) -> FakeBuffer {
        self.allocated.fetch_add(1, Ordering::SeqCst);
        FakeBuffer {
            text,
            released: Arc::clone(&self.released),
        }
    }

    fn error_document(&self, status: i32, message: &str) -> FakeBuffer {
        let doc = serde_json::json!({ "Error": status, "ErrorMessage": message });
        self.buffer(doc.to_string())
    }

    fn apply(state: &mut FakeState, operation: CpuGroupOperation) -> Result<(), (i32, String)> {
        match operation {
            CpuGroupOperation::CreateGroup {
                group_id,
                logical_processor_count,
                logical_processors,
            } => {
                if logical_processors.is_empty()
                    || logical_processor_count as usize != logical_processors.len()
                {
                    return Err((HCS_E_INVALID_ARG, "invalid logical processor list".into()));
                }
                if state.groups.contains_key(&group_id) {
                    return Err((HCS_E_ALREADY_EXISTS, format!("group {group_id} already exists")));
                }
                state.groups.insert(
                    group_id,
                    GroupRecord {
                        logical_processors,
                        cap: None,
                    },
                );
            }
            CpuGroupOperation::DeleteGroup { group_id } => {
                if state.groups.remove(&group_id).is_none() {
                    return Err((HCS_E_NOT_FOUND, format!("group {group_id} not found")));
                }
            }
            CpuGroupOperation::SetProperty {
                group_id,
                property_code,
                property_value,
            } => {
                if property_code != CPU_CAP_PROPERTY_CODE {
                    return Err((HCS_E_INVALID_ARG, format!("unknown property {property_code}")));
                }
                let Some(group) = state.groups.get_mut(&group_id) else {
                    return Err((HCS_E_NOT_FOUND, format!("group {group_id} not found")));
                };
                group.cap = Some(property_value);
            }
        }
        Ok(())
    }
}

impl HostComputeApi for FakeHostCompute {
    type Buffer = FakeBuffer;

    fn modify_service_settings(&self, settings: &str) -> ModifyResponse<FakeBuffer> {
        let mut state = self.state.lock();
        state.requests.push(settings.to_string());

        if let Some(Some(status)) = state.failures.pop_front() {
            return ModifyResponse {
                status,
                result: Some(self.error_document(status, "scripted failure")),
            };
        }

        let outcome = serde_json::from_str::<ModifyRequest>(settings)
            .map_err(|e| (HCS_E_INVALID_ARG, e.to_string()))
            .and_then(|request| {
                if request.property_type != CPU_GROUP_PROPERTY {
                    return Err((HCS_E_INVALID_ARG, "unsupported property type".into()));
                }
                Self::apply(&mut state, request.settings)
            });

        match outcome {
            Ok(()) => ModifyResponse {
                status: 0,
                result: None,
            },
            Err((status, message)) => {
                debug!(status, %message, "fake host compute rejected request");
                ModifyResponse {
                    status,
                    result: Some(self.error_document(status, &message)),
                }
            }
        }
    }

    fn get_service_properties(&self, query: &str) -> QueryResponse<FakeBuffer> {
        let mut state = self.state.lock();
        state.requests.push(query.to_string());

        if let Some(Some(status)) = state.failures.pop_front() {
            return QueryResponse {
                status,
                properties: None,
                result: Some(self.error_document(status, "scripted failure")),
            };
        }

        let wants_groups = serde_json::from_str::<PropertyQuery>(query)
            .map(|q| q.property_types.iter().any(|t| t == CPU_GROUP_PROPERTY));
        let Ok(wants_groups) = wants_groups else {
            return QueryResponse {
                status: HCS_E_INVALID_ARG,
                properties: None,
                result: Some(self.error_document(HCS_E_INVALID_ARG, "malformed query")),
            };
        };

        let cpu_groups = if wants_groups {
            state
                .groups
                .iter()
                .map(|(id, group)| CpuGroupEntry {
                    group_id: *id,
                    affinity: GroupAffinity {
                        logical_processor_count: group.logical_processors.len() as u32,
                        logical_processors: group.logical_processors.clone(),
                    },
                    group_properties: group
                        .cap
                        .map(|value| GroupProperty {
                            property_code: CPU_CAP_PROPERTY_CODE,
                            property_value: value,
                        })
                        .into_iter()
                        .collect(),
                })
                .collect()
        } else {
            Vec::new()
        };
        let document = ServiceProperties {
            properties: vec![PropertyEntry { cpu_groups }],
        };

        match serde_json::to_string(&document) {
            Ok(text) => QueryResponse {
                status: 0,
                properties: Some(self.buffer(text)),
                result: None,
            },
            Err(e) => QueryResponse {
                status: HCS_E_INVALID_ARG,
                properties: None,
                result: Some(self.error_document(HCS_E_INVALID_ARG, &e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_failure_leaves_groups_alone() {
        let fake = FakeHostCompute::new();
        fake.fail_next(HCS_E_INVALID_ARG);
        let request = ModifyRequest::cpu_group(CpuGroupOperation::delete(Uuid::from_u128(1)))
            .to_json()
            .unwrap();

        let response = fake.modify_service_settings(&request);
        assert_eq!(response.status, HCS_E_INVALID_ARG);
        assert!(response.result.is_some());
        drop(response);
        assert_eq!(fake.allocated(), fake.released());
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let fake = FakeHostCompute::new();
        let group = hvres_model::CpuGroupDescriptor::new(Uuid::from_u128(1), [0]);
        let request = ModifyRequest::cpu_group(CpuGroupOperation::create(&group))
            .to_json()
            .unwrap();

        assert_eq!(fake.modify_service_settings(&request).status, 0);
        assert_eq!(
            fake.modify_service_settings(&request).status,
            HCS_E_ALREADY_EXISTS
        );
        assert_eq!(fake.group_ids(), vec![Uuid::from_u128(1)]);
    }

    #[test]
    fn malformed_request_is_invalid_arg() {
        let fake = FakeHostCompute::new();
        assert_eq!(fake.modify_service_settings("{").status, HCS_E_INVALID_ARG);
    }

    #[test]
    fn group_table_survives_save_and_load() {
        let fake = FakeHostCompute::new();
        let group = hvres_model::CpuGroupDescriptor::new(Uuid::from_u128(7), [2, 3]);
        let request = ModifyRequest::cpu_group(CpuGroupOperation::create(&group))
            .to_json()
            .unwrap();
        fake.modify_service_settings(&request);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        fake.save(&path).unwrap();

        let loaded = FakeHostCompute::load(&path).unwrap();
        assert_eq!(loaded.group_ids(), vec![Uuid::from_u128(7)]);
        assert!(FakeHostCompute::load(&dir.path().join("missing.json"))
            .unwrap()
            .group_ids()
            .is_empty());
    }
}
