//! CPU-group lifecycle over the host compute service.

use tracing::{debug, info, warn};
use uuid::Uuid;

use hvres_model::CpuGroupDescriptor;

use crate::api::HostComputeApi;
use crate::buffer::take_text;
use crate::error::{NativeError, NativeResult};
use crate::protocol::{CpuGroupInfo, CpuGroupOperation, ModifyRequest, PropertyQuery, ServiceProperties};

/// Synchronous request/response channel to the host compute service.
pub struct NativeServiceChannel<H> {
    api: H,
}

impl<H: HostComputeApi> NativeServiceChannel<H> {
    pub fn new(api: H) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &H {
        &self.api
    }

    pub fn create_group(&self, group: &CpuGroupDescriptor) -> NativeResult<()> {
        self.modify(CpuGroupOperation::create(group))
    }

    pub fn delete_group(&self, group_id: Uuid) -> NativeResult<()> {
        self.modify(CpuGroupOperation::delete(group_id))
    }

    pub fn set_group_cap(&self, group_id: Uuid, cap: u16) -> NativeResult<()> {
        self.modify(CpuGroupOperation::set_cap(group_id, cap))
    }

    /// All CPU groups on the host.
    pub fn list_groups(&self) -> NativeResult<Vec<CpuGroupInfo>> {
        let Some(text) = self.query(&PropertyQuery::cpu_groups())? else {
            return Ok(Vec::new());
        };
        let groups = ServiceProperties::parse(&text)?.into_cpu_groups();
        debug!(count = groups.len(), "cpu groups listed");
        Ok(groups)
    }

    /// Run a property query and return the raw properties document.
    pub fn query(&self, query: &PropertyQuery) -> NativeResult<Option<String>> {
        let request = serde_json::to_string(query)?;
        let response = self.api.get_service_properties(&request);
        // Both buffers are decoded and released here, whatever the status.
        let properties = take_text(response.properties);
        let error = take_text(response.result);

        if response.status != 0 {
            return Err(call_failed("GetServiceProperties", response.status, error));
        }
        Ok(properties)
    }

    fn modify(&self, operation: CpuGroupOperation) -> NativeResult<()> {
        let name = operation.name();
        let group_id = operation.group_id();
        let request = ModifyRequest::cpu_group(operation).to_json()?;

        let response = self.api.modify_service_settings(&request);
        let error = take_text(response.result);

        if response.status != 0 {
            return Err(call_failed(name, response.status, error));
        }
        info!(operation = name, %group_id, "cpu group updated");
        Ok(())
    }
}

fn call_failed(operation: &str, status: i32, error: Option<String>) -> NativeError {
    let payload = error.unwrap_or_default();
    warn!(operation, status = %format!("0x{status:08X}"), %payload, "native call failed");
    NativeError::CallFailed { status, payload }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeHostCompute, HCS_E_NOT_FOUND};

    fn make_channel() -> NativeServiceChannel<FakeHostCompute> {
        NativeServiceChannel::new(FakeHostCompute::new())
    }

    fn group(n: u128) -> CpuGroupDescriptor {
        CpuGroupDescriptor::new(Uuid::from_u128(n), [0, 1])
    }

    #[test]
    fn create_then_list() {
        let channel = make_channel();
        channel.create_group(&group(1)).unwrap();
        channel.set_group_cap(Uuid::from_u128(1), 150).unwrap();

        let groups = channel.list_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, Uuid::from_u128(1));
        assert_eq!(groups[0].logical_processors, vec![0, 1]);
        assert_eq!(groups[0].cap, Some(150));
    }

    #[test]
    fn delete_removes_group() {
        let channel = make_channel();
        channel.create_group(&group(1)).unwrap();
        channel.delete_group(Uuid::from_u128(1)).unwrap();
        assert!(channel.list_groups().unwrap().is_empty());
    }

    #[test]
    fn failure_carries_status_and_payload() {
        let channel = make_channel();
        let err = channel.delete_group(Uuid::from_u128(9)).unwrap_err();
        match err {
            NativeError::CallFailed { status, payload } => {
                assert_eq!(status, HCS_E_NOT_FOUND);
                assert!(payload.contains("ErrorMessage"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn status_is_formatted_as_hresult() {
        let err = NativeError::CallFailed {
            status: HCS_E_NOT_FOUND,
            payload: String::new(),
        };
        assert!(err.to_string().contains("0x80070490"));
    }

    #[test]
    fn buffers_released_on_success_and_failure() {
        let channel = make_channel();
        channel.create_group(&group(1)).unwrap();
        channel.list_groups().unwrap();
        channel.delete_group(Uuid::from_u128(2)).unwrap_err();

        channel.api().fail_next(HCS_E_NOT_FOUND);
        channel.list_groups().unwrap_err();

        let fake = channel.api();
        assert!(fake.allocated() > 0);
        assert_eq!(fake.allocated(), fake.released());
    }
}
