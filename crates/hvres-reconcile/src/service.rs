//! Reconciliation service — the public operations.
//!
//! Each operation is independent: it looks everything up afresh, computes
//! the full target state from the caller's configuration, submits it and
//! waits for the host to accept or reject it. Nothing is cached between
//! calls. The blocking work runs on tokio's blocking pool.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use hvres_bridge::{
    EntityKind, ManagementBridge, ManagementObject, ServiceMethod, SettingsQuery,
};
use hvres_engine::schema::{
    ELEMENT_NAME, ENABLED_STATE, NAME, NUMA_SPANNING_ENABLED, REALIZED_SYSTEM_TYPE,
    VIRTUAL_SYSTEM_TYPE,
};
use hvres_engine::{SettingsVariant, apply_memory, apply_processor, read_memory, read_processor};
use hvres_model::{CpuGroupDescriptor, MemoryConfiguration, ProcessorConfiguration, ServiceConfig};
use hvres_native::{CpuGroupInfo, HostComputeApi, NativeServiceChannel};

use crate::binding::CpuGroupBinder;
use crate::error::{ReconcileError, ReconcileResult};
use crate::job::{JobMonitor, JobOutcome};

/// `EnabledState` of a running VM.
pub const ENABLED_STATE_ENABLED: u64 = 2;

/// Reconciles VM hardware settings against the host.
///
/// Cheap to clone; clones share the same bridge and native channel.
pub struct ReconcileService<B, H> {
    core: Arc<ServiceCore<B, H>>,
}

impl<B, H> Clone for ReconcileService<B, H> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct ServiceCore<B, H> {
    bridge: B,
    native: NativeServiceChannel<H>,
    monitor: JobMonitor,
}

impl<B, H> ReconcileService<B, H>
where
    B: ManagementBridge + 'static,
    H: HostComputeApi + 'static,
{
    pub fn new(bridge: B, native: H, config: &ServiceConfig) -> Self {
        Self {
            core: Arc::new(ServiceCore {
                bridge,
                native: NativeServiceChannel::new(native),
                monitor: JobMonitor::from_config(config),
            }),
        }
    }

    pub fn bridge(&self) -> &B {
        &self.core.bridge
    }

    pub fn native(&self) -> &NativeServiceChannel<H> {
        &self.core.native
    }

    async fn run<T, F>(&self, f: F) -> ReconcileResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ServiceCore<B, H>) -> ReconcileResult<T> + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || f(&core)).await?
    }

    // ── Memory ─────────────────────────────────────────────────────

    /// Current memory configuration, or `None` if the VM or its memory
    /// settings do not exist.
    pub async fn get_memory(&self, vm_name: &str) -> ReconcileResult<Option<MemoryConfiguration>> {
        let vm_name = vm_name.to_string();
        self.run(move |core| {
            let memory = not_found_as_none(core.memory_settings(&vm_name))?;
            Ok(memory.map(|m| read_memory(&m.properties)))
        })
        .await
    }

    /// Apply `config` to the VM's memory. `running` selects the hot path.
    pub async fn set_memory(
        &self,
        vm_name: &str,
        config: MemoryConfiguration,
        running: bool,
    ) -> ReconcileResult<JobOutcome> {
        let vm_name = vm_name.to_string();
        self.run(move |core| core.set_memory(&vm_name, &config, running))
            .await
    }

    pub async fn is_running(&self, vm_name: &str) -> ReconcileResult<bool> {
        let vm_name = vm_name.to_string();
        self.run(move |core| {
            let vm = core.find_vm(&vm_name)?;
            Ok(vm.get_u64(ENABLED_STATE) == Some(ENABLED_STATE_ENABLED))
        })
        .await
    }

    // ── Processor ──────────────────────────────────────────────────

    pub async fn get_processor(
        &self,
        vm_name: &str,
    ) -> ReconcileResult<Option<ProcessorConfiguration>> {
        let vm_name = vm_name.to_string();
        self.run(move |core| {
            let target = not_found_as_none(core.processor_settings(&vm_name))?;
            Ok(target.map(|(p, _)| read_processor(&p.properties)))
        })
        .await
    }

    pub async fn set_processor(
        &self,
        vm_name: &str,
        config: ProcessorConfiguration,
    ) -> ReconcileResult<JobOutcome> {
        let vm_name = vm_name.to_string();
        self.run(move |core| core.set_processor(&vm_name, &config))
            .await
    }

    // ── CPU groups ─────────────────────────────────────────────────

    pub async fn list_cpu_groups(&self) -> ReconcileResult<Vec<CpuGroupInfo>> {
        self.run(|core| Ok(core.native.list_groups()?)).await
    }

    /// Create a group and apply its cap. A rejected cap removes the new
    /// group again so a failed call leaves no group behind.
    pub async fn create_cpu_group(&self, group: CpuGroupDescriptor) -> ReconcileResult<()> {
        self.run(move |core| {
            group.validate()?;
            core.native.create_group(&group)?;
            if let Some(cap) = group.cap {
                if let Err(e) = core.native.set_group_cap(group.group_id, cap) {
                    warn!(group_id = %group.group_id, cap, "cap rejected, removing new cpu group");
                    if let Err(cleanup) = core.native.delete_group(group.group_id) {
                        warn!(group_id = %group.group_id, error = %cleanup, "cpu group left behind");
                    }
                    return Err(e.into());
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_cpu_group(&self, group_id: Uuid) -> ReconcileResult<()> {
        self.run(move |core| Ok(core.native.delete_group(group_id)?))
            .await
    }

    pub async fn set_cpu_group_cap(&self, group_id: Uuid, cap: u16) -> ReconcileResult<()> {
        self.run(move |core| Ok(core.native.set_group_cap(group_id, cap)?))
            .await
    }

    pub async fn bind_cpu_group(&self, vm_name: &str, group_id: Uuid) -> ReconcileResult<JobOutcome> {
        let vm_name = vm_name.to_string();
        self.run(move |core| {
            let vm_id = core.vm_id(&vm_name)?;
            CpuGroupBinder::new(&core.bridge, &core.monitor).bind(vm_id, group_id)
        })
        .await
    }

    pub async fn unbind_cpu_group(&self, vm_name: &str) -> ReconcileResult<JobOutcome> {
        let vm_name = vm_name.to_string();
        self.run(move |core| {
            let vm_id = core.vm_id(&vm_name)?;
            CpuGroupBinder::new(&core.bridge, &core.monitor).unbind(vm_id)
        })
        .await
    }

    /// The CPU group the VM is bound to, or `None` when unbound.
    pub async fn get_vm_cpu_group(&self, vm_name: &str) -> ReconcileResult<Option<Uuid>> {
        let vm_name = vm_name.to_string();
        self.run(move |core| {
            let vm_id = core.vm_id(&vm_name)?;
            CpuGroupBinder::new(&core.bridge, &core.monitor).current_group(vm_id)
        })
        .await
    }

    // ── VM and host settings ───────────────────────────────────────

    pub async fn rename_vm(&self, vm_id: Uuid, new_name: &str) -> ReconcileResult<JobOutcome> {
        let new_name = new_name.to_string();
        self.run(move |core| core.rename_vm(vm_id, &new_name)).await
    }

    /// Host-wide NUMA spanning. Hosts that do not report it span.
    pub async fn get_numa_spanning(&self) -> ReconcileResult<bool> {
        self.run(|core| {
            let settings = core.service_settings()?;
            Ok(settings.get_bool(NUMA_SPANNING_ENABLED).unwrap_or(true))
        })
        .await
    }

    pub async fn set_numa_spanning(&self, enabled: bool) -> ReconcileResult<JobOutcome> {
        self.run(move |core| {
            let mut settings = core.service_settings()?;
            settings.set(NUMA_SPANNING_ENABLED, enabled)?;
            let outcome = core.submit(ServiceMethod::ModifyServiceSettings, &settings)?;
            info!(enabled, "numa spanning updated");
            Ok(outcome)
        })
        .await
    }
}

impl<B: ManagementBridge, H> ServiceCore<B, H> {
    fn find_vm(&self, vm_name: &str) -> ReconcileResult<ManagementObject> {
        self.bridge
            .query_by_name(EntityKind::ComputerSystem, vm_name)?
            .ok_or_else(|| ReconcileError::VmNotFound(vm_name.to_string()))
    }

    fn vm_id(&self, vm_name: &str) -> ReconcileResult<Uuid> {
        let vm = self.find_vm(vm_name)?;
        vm.get_str(NAME)
            .and_then(|name| Uuid::parse_str(name).ok())
            .ok_or_else(|| ReconcileError::Unexpected(format!("{vm_name} has no identifier")))
    }

    fn memory_settings(&self, vm_name: &str) -> ReconcileResult<ManagementObject> {
        let vm = self.find_vm(vm_name)?;
        let id = vm.get_str(NAME).unwrap_or_default();
        self.bridge
            .query(&SettingsQuery::memory_for_vm(id))?
            .into_iter()
            .next()
            .ok_or_else(|| ReconcileError::SettingsNotFound {
                vm: vm_name.to_string(),
                kind: EntityKind::MemorySettings,
            })
    }

    /// The system settings snapshot to work on: the realized one when the
    /// VM has it, else the first definition.
    fn system_settings(&self, vm: &ManagementObject) -> ReconcileResult<Option<ManagementObject>> {
        let mut systems = self.bridge.get_related(vm, EntityKind::SystemSettings)?;
        let realized = systems.iter().position(is_realized);
        Ok(match realized {
            Some(index) => Some(systems.swap_remove(index)),
            None => systems.into_iter().next(),
        })
    }

    fn processor_settings(
        &self,
        vm_name: &str,
    ) -> ReconcileResult<(ManagementObject, SettingsVariant)> {
        let not_found = || ReconcileError::SettingsNotFound {
            vm: vm_name.to_string(),
            kind: EntityKind::ProcessorSettings,
        };
        let vm = self.find_vm(vm_name)?;
        let system = self.system_settings(&vm)?.ok_or_else(not_found)?;
        let variant = if is_realized(&system) {
            SettingsVariant::Realized
        } else {
            SettingsVariant::Definition
        };
        let processor = self
            .bridge
            .get_related(&system, EntityKind::ProcessorSettings)?
            .into_iter()
            .next()
            .ok_or_else(not_found)?;
        Ok((processor, variant))
    }

    fn service_settings(&self) -> ReconcileResult<ManagementObject> {
        self.bridge
            .query(&SettingsQuery::all(EntityKind::ServiceSettings))?
            .into_iter()
            .next()
            .ok_or_else(|| ReconcileError::SettingsNotFound {
                vm: "host".to_string(),
                kind: EntityKind::ServiceSettings,
            })
    }

    fn submit(&self, method: ServiceMethod, object: &ManagementObject) -> ReconcileResult<JobOutcome> {
        let document = self.bridge.serialize(object)?;
        let result = self.bridge.invoke_service_method(method, vec![document])?;
        self.monitor.resolve(&self.bridge, result)
    }

    fn set_memory(
        &self,
        vm_name: &str,
        config: &MemoryConfiguration,
        running: bool,
    ) -> ReconcileResult<JobOutcome> {
        config.validate()?;
        let mut memory = self.memory_settings(vm_name)?;
        let changes = apply_memory(&mut memory.properties, config, running)?;
        if changes.dynamic_memory_enabled {
            config.validate_dynamic_bounds()?;
        }
        debug!(vm = %vm_name, ?changes, "memory target computed");

        let outcome = self.submit(ServiceMethod::ModifyResourceSettings, &memory)?;
        info!(
            vm = %vm_name,
            startup = changes.aligned_startup,
            dynamic = changes.dynamic_memory_enabled,
            running,
            polls = outcome.polls,
            "memory settings applied"
        );
        Ok(outcome)
    }

    fn set_processor(
        &self,
        vm_name: &str,
        config: &ProcessorConfiguration,
    ) -> ReconcileResult<JobOutcome> {
        config.validate()?;
        let (mut processor, variant) = self.processor_settings(vm_name)?;
        let changes = apply_processor(&mut processor.properties, config, variant)?;
        if changes.core_count_applied {
            config.validate_count()?;
        }

        let outcome = self.submit(ServiceMethod::ModifyResourceSettings, &processor)?;
        info!(
            vm = %vm_name,
            count = config.count,
            core_count_applied = changes.core_count_applied,
            polls = outcome.polls,
            "processor settings applied"
        );
        Ok(outcome)
    }

    fn rename_vm(&self, vm_id: Uuid, new_name: &str) -> ReconcileResult<JobOutcome> {
        let vm = self
            .bridge
            .query_by_guid(EntityKind::ComputerSystem, vm_id)?
            .ok_or_else(|| ReconcileError::VmNotFound(vm_id.to_string()))?;
        let mut system = self
            .system_settings(&vm)?
            .ok_or_else(|| ReconcileError::SettingsNotFound {
                vm: vm_id.to_string(),
                kind: EntityKind::SystemSettings,
            })?;
        system.set(ELEMENT_NAME, new_name)?;

        let outcome = self.submit(ServiceMethod::ModifySystemSettings, &system)?;
        info!(%vm_id, name = %new_name, "vm renamed");
        Ok(outcome)
    }
}

fn is_realized(system: &ManagementObject) -> bool {
    system.get_str(VIRTUAL_SYSTEM_TYPE) == Some(REALIZED_SYSTEM_TYPE)
}

/// Read paths report a missing VM or settings object as `None`.
fn not_found_as_none<T>(result: ReconcileResult<T>) -> ReconcileResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ReconcileError::VmNotFound(_) | ReconcileError::SettingsNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvres_bridge::{SimulatedHost, VmFixture};
    use hvres_native::FakeHostCompute;

    fn make_service() -> ReconcileService<SimulatedHost, FakeHostCompute> {
        let config = ServiceConfig {
            poll_interval_ms: 1,
            job_timeout_secs: Some(5),
        };
        ReconcileService::new(SimulatedHost::new(), FakeHostCompute::new(), &config)
    }

    #[tokio::test]
    async fn missing_vm_reads_as_none() {
        let service = make_service();
        assert_eq!(service.get_memory("nope").await.unwrap(), None);
        assert_eq!(service.get_processor("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_vm_fails_writes() {
        let service = make_service();
        let err = service
            .set_memory("nope", MemoryConfiguration::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::VmNotFound(ref name) if name == "nope"));
    }

    #[tokio::test]
    async fn running_state_follows_enabled_state() {
        let service = make_service();
        service.bridge().add_vm(VmFixture::new("on").running(true));
        service.bridge().add_vm(VmFixture::new("off"));

        assert!(service.is_running("on").await.unwrap());
        assert!(!service.is_running("off").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_before_submission() {
        let service = make_service();
        service.bridge().add_vm(VmFixture::new("VM1"));
        let config = MemoryConfiguration {
            dynamic_memory_enabled: true,
            minimum: 4096,
            maximum: 1024,
            ..Default::default()
        };

        let err = service.set_memory("VM1", config, false).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidConfiguration(_)));
        assert!(service.bridge().submissions().is_empty());
    }

    #[tokio::test]
    async fn clones_share_the_host() {
        let service = make_service();
        let clone = service.clone();
        service.bridge().add_vm(VmFixture::new("VM1"));
        assert!(clone.get_memory("VM1").await.unwrap().is_some());
    }
}
