//! In-memory management object model.
//!
//! `SimulatedHost` behaves like a virtualization host closely enough to
//! drive the reconciliation service end to end: it stores objects and their
//! associations, accepts settings documents through the modification
//! methods, enforces the host rules the engine has to respect, and can be
//! scripted to fail a submission or to run it as a job with a chosen
//! sequence of job states.
//!
//! Host rules enforced on submission:
//! - the realized processor settings of a VM reject a core-count change;
//! - a running VM's memory settings reject changes to page size,
//!   encryption policy and the dynamic-memory switch;
//! - with large or huge pages, startup memory and the per-NUMA-node block
//!   size must be multiples of the page alignment.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::bridge::{ManagementBridge, MethodResult, ServiceMethod, RETURN_COMPLETED, RETURN_JOB_STARTED};
use crate::document::SettingsDocument;
use crate::error::{BridgeError, BridgeResult};
use crate::query::{RESOURCE_TYPE_MEMORY, RESOURCE_TYPE_PROCESSOR, SettingsQuery};
use crate::types::{CimType, EntityKind, ManagementObject, ObjectPath, PropertyBag, PropertyValue};

/// `EnabledState` of a running VM.
pub const ENABLED_STATE_RUNNING: u16 = 2;

/// `EnabledState` of a VM that is off.
pub const ENABLED_STATE_OFF: u16 = 3;

pub const REALIZED_SYSTEM_TYPE: &str = "Microsoft:Hyper-V:System:Realized";
pub const DEFINITION_SYSTEM_TYPE: &str = "Microsoft:Hyper-V:System:Definition";

/// Generic failure.
pub const RETURN_FAILED: u32 = 32768;
pub const RETURN_INVALID_PARAMETER: u32 = 32773;
pub const RETURN_INVALID_STATE: u32 = 32775;

const JOB_STATE_STARTING: u16 = 3;
const JOB_STATE_RUNNING: u16 = 4;
const JOB_STATE_COMPLETED: u16 = 7;
const JOB_STATE_EXCEPTION: u16 = 10;

const MEMORY_RASD_SUFFIX: &str = "4764334D-E001-4176-82EE-5594EC9B530E";
const PROCESSOR_RASD_SUFFIX: &str = "B637F346-6A0E-4DEC-AF52-BD70CB80A21D";

/// How the next modification request is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Return this code and change nothing.
    Fail(u32),
    /// Start a job. Each fetch of the job advances it to the next state;
    /// the last state sticks. Changes apply when the job reaches Completed.
    Job {
        states: Vec<u16>,
        error_description: Option<String>,
    },
}

/// A recorded modification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub method: ServiceMethod,
    pub documents: Vec<String>,
}

/// Description of a VM to add to a [`SimulatedHost`].
#[derive(Debug, Clone)]
pub struct VmFixture {
    pub name: String,
    pub id: Uuid,
    pub running: bool,
    pub memory: PropertyBag,
    pub processor: PropertyBag,
}

impl VmFixture {
    pub fn new(name: &str) -> Self {
        let mut memory = PropertyBag::new();
        memory.insert("ResourceType", RESOURCE_TYPE_MEMORY);
        memory.insert("VirtualQuantity", 1024u64);
        memory.insert("Reservation", 1024u64);
        memory.insert("Limit", 1024u64);
        memory.insert("Weight", 5000u32);
        memory.insert("DynamicMemoryEnabled", false);
        memory.insert("TargetMemoryBuffer", 20u32);
        memory.insert("BackingPageSize", 0u8);
        memory.insert("MemoryEncryptionPolicy", 0u8);
        memory.insert("MaxMemoryBlocksPerNumaNode", 1_048_575u64);

        let mut processor = PropertyBag::new();
        processor.insert("ResourceType", RESOURCE_TYPE_PROCESSOR);
        processor.insert("VirtualQuantity", 1u64);
        processor.insert("Reservation", 0u64);
        processor.insert("Limit", 100_000u64);
        processor.insert("Weight", 100u32);
        processor.insert("HwThreadsPerCore", 0u64);
        for flag in [
            "ExposeVirtualizationExtensions",
            "EnableHostResourceProtection",
            "LimitProcessorFeatures",
            "LimitCPUID",
            "DisableSpeculationControls",
            "HideHypervisorPresent",
            "EnablePerfmonArchPmu",
            "AllowAcountMcount",
            "EnableSocketTopology",
        ] {
            processor.insert(flag, false);
        }

        Self {
            name: name.to_string(),
            id: Uuid::new_v4(),
            running: false,
            memory,
            processor,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }

    /// Drop a memory property, as an older host build would.
    pub fn without_memory_property(mut self, name: &str) -> Self {
        self.memory.remove(name);
        self
    }

    pub fn without_processor_property(mut self, name: &str) -> Self {
        self.processor.remove(name);
        self
    }

    pub fn with_memory_property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.memory.insert(name, value);
        self
    }

    pub fn with_processor_property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.processor.insert(name, value);
        self
    }
}

struct PendingJob {
    states: VecDeque<u16>,
    error_description: Option<String>,
    method: ServiceMethod,
    documents: Vec<String>,
    applied: bool,
}

/// The persistable part of the host: objects and associations.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HostSnapshot {
    objects: Vec<ManagementObject>,
    relations: Vec<(ObjectPath, ObjectPath)>,
}

#[derive(Default)]
struct HostState {
    objects: BTreeMap<ObjectPath, ManagementObject>,
    relations: Vec<(ObjectPath, ObjectPath)>,
    script: VecDeque<ScriptedOutcome>,
    jobs: HashMap<ObjectPath, PendingJob>,
    submissions: Vec<Submission>,
    next_job: u64,
}

/// An in-memory [`ManagementBridge`].
pub struct SimulatedHost {
    state: Mutex<HostState>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// A host with a management service and no VMs.
    pub fn new() -> Self {
        let host = Self {
            state: Mutex::new(HostState::default()),
        };
        host.install_service();
        host
    }

    fn install_service(&self) {
        let mut state = self.state.lock();

        let mut service = PropertyBag::new();
        service.insert("Name", "vmms");
        service.insert("ElementName", "Virtual Machine Management Service");
        let service_path = ObjectPath::for_instance(EntityKind::ManagementService, "Name", "vmms");

        let mut settings = PropertyBag::new();
        settings.insert("InstanceID", "Microsoft:ServiceSettings");
        settings.insert("NumaSpanningEnabled", true);
        let settings_path = ObjectPath::for_instance(
            EntityKind::ServiceSettings,
            "InstanceID",
            "Microsoft:ServiceSettings",
        );

        state.insert(ManagementObject::new(
            EntityKind::ManagementService,
            service_path.clone(),
            service,
        ));
        state.insert(ManagementObject::new(
            EntityKind::ServiceSettings,
            settings_path.clone(),
            settings,
        ));
        state.relations.push((service_path, settings_path));
    }

    /// Add a VM with one system settings snapshot (realized when running,
    /// definition otherwise) and its memory and processor settings.
    pub fn add_vm(&self, fixture: VmFixture) -> Uuid {
        let key = host_id(fixture.id);
        let mut state = self.state.lock();

        let mut system = PropertyBag::new();
        system.insert("Name", key.as_str());
        system.insert("ElementName", fixture.name.as_str());
        system.insert(
            "EnabledState",
            if fixture.running {
                ENABLED_STATE_RUNNING
            } else {
                ENABLED_STATE_OFF
            },
        );
        let vm_path = ObjectPath::for_instance(EntityKind::ComputerSystem, "Name", &key);
        state.insert(ManagementObject::new(
            EntityKind::ComputerSystem,
            vm_path.clone(),
            system,
        ));

        let system_type = if fixture.running {
            REALIZED_SYSTEM_TYPE
        } else {
            DEFINITION_SYSTEM_TYPE
        };
        let settings_id = format!("Microsoft:{key}");
        let mut settings = PropertyBag::new();
        settings.insert("InstanceID", settings_id.as_str());
        settings.insert("ElementName", fixture.name.as_str());
        settings.insert("VirtualSystemIdentifier", key.as_str());
        settings.insert("VirtualSystemType", system_type);
        let settings_path =
            ObjectPath::for_instance(EntityKind::SystemSettings, "InstanceID", &settings_id);
        state.insert(ManagementObject::new(
            EntityKind::SystemSettings,
            settings_path.clone(),
            settings,
        ));
        state.relations.push((vm_path, settings_path.clone()));

        let memory_id = format!("Microsoft:{key}\\{MEMORY_RASD_SUFFIX}");
        let mut memory = fixture.memory;
        memory.insert("InstanceID", memory_id.as_str());
        let memory_path =
            ObjectPath::for_instance(EntityKind::MemorySettings, "InstanceID", &memory_id);
        state.insert(ManagementObject::new(
            EntityKind::MemorySettings,
            memory_path.clone(),
            memory,
        ));
        state.relations.push((settings_path.clone(), memory_path));

        let processor_id = format!("Microsoft:{key}\\{PROCESSOR_RASD_SUFFIX}\\0");
        let mut processor = fixture.processor;
        processor.insert("InstanceID", processor_id.as_str());
        let processor_path =
            ObjectPath::for_instance(EntityKind::ProcessorSettings, "InstanceID", &processor_id);
        state.insert(ManagementObject::new(
            EntityKind::ProcessorSettings,
            processor_path.clone(),
            processor,
        ));
        state.relations.push((settings_path, processor_path));

        debug!(vm = %fixture.name, id = %key, running = fixture.running, "simulated vm added");
        fixture.id
    }

    /// Queue the outcome of the next modification request. Unscripted
    /// requests apply immediately and return 0.
    pub fn script(&self, outcome: ScriptedOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Every modification request received so far.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn object(&self, path: &ObjectPath) -> Option<ManagementObject> {
        self.state.lock().objects.get(path).cloned()
    }

    /// The settings object of `kind` belonging to VM `id`.
    pub fn vm_settings(&self, id: Uuid, kind: EntityKind) -> Option<ManagementObject> {
        let state = self.state.lock();
        let vm_path = ObjectPath::for_instance(EntityKind::ComputerSystem, "Name", &host_id(id));
        state
            .related(&vm_path, EntityKind::SystemSettings)
            .into_iter()
            .flat_map(|system| state.related(&system.path, kind))
            .next()
    }

    /// Mutate the settings object of `kind` belonging to VM `id` in place.
    pub fn update_vm_settings(
        &self,
        id: Uuid,
        kind: EntityKind,
        f: impl FnOnce(&mut PropertyBag),
    ) -> BridgeResult<()> {
        let path = self
            .vm_settings(id, kind)
            .map(|o| o.path)
            .ok_or_else(|| BridgeError::ObjectNotFound(format!("{kind} of {id}")))?;
        let mut state = self.state.lock();
        let object = state
            .objects
            .get_mut(&path)
            .ok_or_else(|| BridgeError::ObjectNotFound(path.to_string()))?;
        f(&mut object.properties);
        Ok(())
    }

    /// Write objects and associations to a JSON snapshot file.
    pub fn save(&self, path: &Path) -> BridgeResult<()> {
        let state = self.state.lock();
        let snapshot = HostSnapshot {
            objects: state
                .objects
                .values()
                .filter(|o| o.kind != EntityKind::Job)
                .cloned()
                .collect(),
            relations: state.relations.clone(),
        };
        let text = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| BridgeError::Backend(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| BridgeError::Backend(e.to_string()))?;
        debug!(?path, objects = snapshot.objects.len(), "host snapshot saved");
        Ok(())
    }

    /// Load a host from a JSON snapshot file.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| BridgeError::Backend(e.to_string()))?;
        let snapshot: HostSnapshot =
            serde_json::from_str(&text).map_err(|e| BridgeError::Backend(e.to_string()))?;
        let mut state = HostState {
            relations: snapshot.relations,
            ..Default::default()
        };
        for object in snapshot.objects {
            state.insert(object);
        }
        debug!(?path, objects = state.objects.len(), "host snapshot loaded");
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

impl HostState {
    fn insert(&mut self, object: ManagementObject) {
        self.objects.insert(object.path.clone(), object);
    }

    fn related(&self, path: &ObjectPath, kind: EntityKind) -> Vec<ManagementObject> {
        self.relations
            .iter()
            .filter_map(|(a, b)| {
                if a == path {
                    Some(b)
                } else if b == path {
                    Some(a)
                } else {
                    None
                }
            })
            .filter_map(|other| self.objects.get(other))
            .filter(|o| o.kind == kind)
            .cloned()
            .collect()
    }

    fn is_realized(&self, path: &ObjectPath) -> bool {
        self.related(path, EntityKind::SystemSettings)
            .iter()
            .any(|s| s.get_str("VirtualSystemType") == Some(REALIZED_SYSTEM_TYPE))
    }

    fn vm_running(&self, settings_instance_id: &str) -> bool {
        let Some(rest) = settings_instance_id.strip_prefix("Microsoft:") else {
            return false;
        };
        let key = rest.split('\\').next().unwrap_or_default();
        let vm_path = ObjectPath::for_instance(EntityKind::ComputerSystem, "Name", key);
        self.objects
            .get(&vm_path)
            .and_then(|vm| vm.get_u64("EnabledState"))
            == Some(u64::from(ENABLED_STATE_RUNNING))
    }

    /// Validate every document against host rules, then apply them all.
    /// Changes are staged on copies and only committed when every
    /// document applies cleanly.
    fn apply(&mut self, method: ServiceMethod, documents: &[String]) -> Result<(), u32> {
        let mut staged: BTreeMap<ObjectPath, ManagementObject> = BTreeMap::new();
        let mut renames = Vec::new();

        for text in documents {
            let doc = SettingsDocument::parse(text).map_err(|e| {
                debug!(error = %e, method = method.name(), "rejecting malformed document");
                RETURN_INVALID_PARAMETER
            })?;
            let mut object = match staged.remove(&doc.path) {
                Some(object) => object,
                None => self.objects.get(&doc.path).cloned().ok_or_else(|| {
                    debug!(path = %doc.path, "rejecting document for unknown object");
                    RETURN_INVALID_PARAMETER
                })?,
            };
            if doc.kind().ok() != Some(object.kind) {
                debug!(path = %doc.path, class = %doc.class_name, "rejecting document of the wrong class");
                return Err(RETURN_INVALID_PARAMETER);
            }
            let incoming = doc.to_bag().map_err(|_| RETURN_INVALID_PARAMETER)?;
            self.check_rules(&object, &incoming)?;

            for (name, property) in incoming.iter() {
                let result = match &property.value {
                    Some(value) if object.has(name) => object.properties.set(name, value.clone()),
                    None if object.has(name) => object.properties.set_null(name),
                    Some(value) => {
                        object.properties.insert(name, value.clone());
                        Ok(())
                    }
                    None => {
                        object.properties.declare(name, property.cim_type);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    debug!(path = %doc.path, error = %e, "rejecting mistyped property");
                    return Err(RETURN_INVALID_PARAMETER);
                }
            }
            if object.kind == EntityKind::SystemSettings {
                if let Some(name) = incoming.get_str("ElementName") {
                    renames.push((doc.path.clone(), name.to_string()));
                }
            }
            staged.insert(doc.path, object);
        }

        self.objects.extend(staged);

        // A VM's display name follows its system settings.
        for (settings_path, name) in renames {
            for vm in self.related(&settings_path, EntityKind::ComputerSystem) {
                if let Some(vm) = self.objects.get_mut(&vm.path) {
                    let _ = vm.properties.set("ElementName", name.as_str());
                }
            }
        }
        Ok(())
    }

    fn check_rules(&self, current: &ManagementObject, incoming: &PropertyBag) -> Result<(), u32> {
        let changed = |name: &str| {
            incoming.has(name) && incoming.get(name) != current.get(name)
        };

        match current.kind {
            EntityKind::ProcessorSettings => {
                if self.is_realized(&current.path) && changed("VirtualQuantity") {
                    debug!(path = %current.path, "live core-count change rejected");
                    return Err(RETURN_INVALID_STATE);
                }
            }
            EntityKind::MemorySettings => {
                let running = self.vm_running(current.instance_id().unwrap_or_default());
                if running
                    && ["BackingPageSize", "MemoryEncryptionPolicy", "DynamicMemoryEnabled"]
                        .into_iter()
                        .any(changed)
                {
                    debug!(path = %current.path, "structural memory change on running vm rejected");
                    return Err(RETURN_INVALID_STATE);
                }

                let alignment = match incoming.get_u64("BackingPageSize") {
                    Some(1) => 2,
                    Some(2) => 1024,
                    _ => 1,
                };
                if alignment > 1 {
                    for name in ["VirtualQuantity", "MaxMemoryBlocksPerNumaNode"] {
                        if incoming.get_u64(name).is_some_and(|v| v % alignment != 0) {
                            debug!(property = name, alignment, "unaligned memory size rejected");
                            return Err(RETURN_INVALID_PARAMETER);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Advance a job by one state, applying its changes on completion.
    fn advance_job(&mut self, path: &ObjectPath) {
        let Some(job) = self.jobs.get_mut(path) else {
            return;
        };
        let mut state = job.states.pop_front().unwrap_or(JOB_STATE_RUNNING);
        if job.states.is_empty() {
            job.states.push_back(state);
        }
        let mut description = job.error_description.clone();

        if state == JOB_STATE_COMPLETED && !job.applied {
            job.applied = true;
            let method = job.method;
            let documents = std::mem::take(&mut job.documents);
            if let Err(code) = self.apply(method, &documents) {
                state = JOB_STATE_EXCEPTION;
                description = Some(format!("modification rejected with code {code}"));
                if let Some(job) = self.jobs.get_mut(path) {
                    job.states = VecDeque::from([JOB_STATE_EXCEPTION]);
                    job.error_description = description.clone();
                }
            }
        }

        // Once a job reports a terminal state its record is final.
        if state != JOB_STATE_STARTING && state != JOB_STATE_RUNNING {
            self.jobs.remove(path);
        }

        if let Some(object) = self.objects.get_mut(path) {
            let _ = object.properties.set("JobState", state);
            match description {
                Some(text) => {
                    let _ = object.properties.set("ErrorDescription", text);
                }
                None => {
                    let _ = object.properties.set_null("ErrorDescription");
                }
            }
        }
    }
}

/// Host-style identifier text for a VM id.
fn host_id(id: Uuid) -> String {
    id.to_string().to_uppercase()
}

impl ManagementBridge for SimulatedHost {
    fn query_by_name(&self, kind: EntityKind, name: &str) -> BridgeResult<Option<ManagementObject>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .values()
            .find(|o| {
                o.kind == kind
                    && o.get_str("ElementName")
                        .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
            .cloned())
    }

    fn query_by_guid(&self, kind: EntityKind, id: Uuid) -> BridgeResult<Option<ManagementObject>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .values()
            .find(|o| {
                o.kind == kind
                    && o.get_str("Name")
                        .and_then(|n| Uuid::parse_str(n).ok())
                        .is_some_and(|n| n == id)
            })
            .cloned())
    }

    fn query(&self, query: &SettingsQuery) -> BridgeResult<Vec<ManagementObject>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .values()
            .filter(|o| query.matches(o))
            .cloned()
            .collect())
    }

    fn get_related(
        &self,
        object: &ManagementObject,
        kind: EntityKind,
    ) -> BridgeResult<Vec<ManagementObject>> {
        Ok(self.state.lock().related(&object.path, kind))
    }

    fn get_object(&self, path: &ObjectPath) -> BridgeResult<Option<ManagementObject>> {
        let mut state = self.state.lock();
        state.advance_job(path);
        Ok(state.objects.get(path).cloned())
    }

    fn invoke_service_method(
        &self,
        method: ServiceMethod,
        documents: Vec<String>,
    ) -> BridgeResult<MethodResult> {
        let mut state = self.state.lock();
        state.submissions.push(Submission {
            method,
            documents: documents.clone(),
        });

        match state.script.pop_front() {
            None => {
                let return_value = match state.apply(method, &documents) {
                    Ok(()) => RETURN_COMPLETED,
                    Err(code) => code,
                };
                Ok(MethodResult {
                    return_value,
                    job: None,
                })
            }
            Some(ScriptedOutcome::Fail(code)) => Ok(MethodResult {
                return_value: code,
                job: None,
            }),
            Some(ScriptedOutcome::Job {
                states,
                error_description,
            }) => {
                state.next_job += 1;
                let job_id = format!("job-{}", state.next_job);
                let path = ObjectPath::for_instance(EntityKind::Job, "InstanceID", &job_id);

                let mut job = PropertyBag::new();
                job.insert("InstanceID", job_id.as_str());
                job.insert("JobState", JOB_STATE_RUNNING);
                job.declare("ErrorDescription", CimType::String);
                state.insert(ManagementObject::new(EntityKind::Job, path.clone(), job));
                state.jobs.insert(
                    path.clone(),
                    PendingJob {
                        states: states.into(),
                        error_description,
                        method,
                        documents,
                        applied: false,
                    },
                );

                Ok(MethodResult {
                    return_value: RETURN_JOB_STARTED,
                    job: Some(path),
                })
            }
        }
    }
}
