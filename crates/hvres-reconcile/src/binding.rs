//! Binding a VM to a CPU group.
//!
//! Unlike group lifecycle, binding goes through the management object
//! model: the VM's processor settings carry a `CpuGroupId` property, and
//! the nil id means unbound. Hosts that never had a group assigned may
//! leave the property out of the serialized document, so the node is
//! synthesized before the document is resubmitted.

use tracing::info;
use uuid::Uuid;

use hvres_bridge::{
    EntityKind, ManagementBridge, ManagementObject, ServiceMethod, SettingsDocument, SettingsQuery,
};
use hvres_engine::schema::CPU_GROUP_ID;

use crate::error::{ReconcileError, ReconcileResult};
use crate::job::{JobMonitor, JobOutcome};

pub struct CpuGroupBinder<'a, B: ?Sized> {
    bridge: &'a B,
    monitor: &'a JobMonitor,
}

impl<'a, B: ManagementBridge + ?Sized> CpuGroupBinder<'a, B> {
    pub fn new(bridge: &'a B, monitor: &'a JobMonitor) -> Self {
        Self { bridge, monitor }
    }

    /// Point the VM's processor settings at `group_id`.
    pub fn bind(&self, vm_id: Uuid, group_id: Uuid) -> ReconcileResult<JobOutcome> {
        let processor = self.processor_settings(vm_id)?;

        let mut document = SettingsDocument::parse(&self.bridge.serialize(&processor)?)?;
        document.set_value(CPU_GROUP_ID, group_id.hyphenated().to_string())?;

        let result = self.bridge.invoke_service_method(
            ServiceMethod::ModifyResourceSettings,
            vec![document.to_text()?],
        )?;
        let outcome = self.monitor.resolve(self.bridge, result)?;
        info!(%vm_id, %group_id, polls = outcome.polls, "cpu group binding applied");
        Ok(outcome)
    }

    pub fn unbind(&self, vm_id: Uuid) -> ReconcileResult<JobOutcome> {
        self.bind(vm_id, Uuid::nil())
    }

    /// The group the VM is bound to, or `None` when unbound.
    pub fn current_group(&self, vm_id: Uuid) -> ReconcileResult<Option<Uuid>> {
        let processor = self.processor_settings(vm_id)?;
        Ok(processor
            .get_str(CPU_GROUP_ID)
            .and_then(|text| Uuid::parse_str(text).ok())
            .filter(|id| !id.is_nil()))
    }

    fn processor_settings(&self, vm_id: Uuid) -> ReconcileResult<ManagementObject> {
        self.bridge
            .query(&SettingsQuery::processor_for_vm(&vm_id.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| ReconcileError::SettingsNotFound {
                vm: vm_id.to_string(),
                kind: EntityKind::ProcessorSettings,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use hvres_bridge::{SimulatedHost, VmFixture};

    fn make_monitor() -> JobMonitor {
        JobMonitor::new(Duration::from_millis(1), None)
    }

    fn group_of(host: &SimulatedHost, vm: Uuid) -> Option<String> {
        host.vm_settings(vm, EntityKind::ProcessorSettings)
            .unwrap()
            .get_str(CPU_GROUP_ID)
            .map(str::to_string)
    }

    #[test]
    fn bind_synthesizes_missing_property() {
        let host = SimulatedHost::new();
        let vm = host.add_vm(VmFixture::new("VM1"));
        assert_eq!(group_of(&host, vm), None);

        let monitor = make_monitor();
        let binder = CpuGroupBinder::new(&host, &monitor);
        let group = Uuid::from_u128(0x42);
        binder.bind(vm, group).unwrap();

        assert_eq!(group_of(&host, vm), Some(group.to_string()));
        assert_eq!(binder.current_group(vm).unwrap(), Some(group));
    }

    #[test]
    fn unbind_writes_nil_id() {
        let host = SimulatedHost::new();
        let vm = host.add_vm(VmFixture::new("VM1"));
        let monitor = make_monitor();
        let binder = CpuGroupBinder::new(&host, &monitor);

        binder.bind(vm, Uuid::from_u128(7)).unwrap();
        binder.unbind(vm).unwrap();

        assert_eq!(group_of(&host, vm), Some(Uuid::nil().to_string()));
        assert_eq!(binder.current_group(vm).unwrap(), None);
    }

    #[test]
    fn unknown_vm_has_no_processor_settings() {
        let host = SimulatedHost::new();
        let monitor = make_monitor();
        let binder = CpuGroupBinder::new(&host, &monitor);
        let err = binder.bind(Uuid::from_u128(1), Uuid::from_u128(2)).unwrap_err();
        assert!(matches!(err, ReconcileError::SettingsNotFound { .. }));
    }
}
