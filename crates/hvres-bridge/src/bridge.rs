//! The `ManagementBridge` trait.

use std::sync::Arc;

use uuid::Uuid;

use crate::document::SettingsDocument;
use crate::error::BridgeResult;
use crate::query::SettingsQuery;
use crate::types::{EntityKind, ManagementObject, ObjectPath};

/// Return value of a modification method that finished synchronously.
pub const RETURN_COMPLETED: u32 = 0;

/// Return value of a modification method that started a job.
pub const RETURN_JOB_STARTED: u32 = 4096;

/// Modification methods on the management service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceMethod {
    /// Apply resource settings documents (memory, processor, ...).
    ModifyResourceSettings,
    /// Apply a VM's system settings document.
    ModifySystemSettings,
    /// Apply the host-wide service settings document.
    ModifyServiceSettings,
}

impl ServiceMethod {
    pub fn name(self) -> &'static str {
        match self {
            ServiceMethod::ModifyResourceSettings => "ModifyResourceSettings",
            ServiceMethod::ModifySystemSettings => "ModifySystemSettings",
            ServiceMethod::ModifyServiceSettings => "ModifyServiceSettings",
        }
    }
}

/// Raw outcome of a method invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResult {
    pub return_value: u32,
    /// Set when `return_value` is [`RETURN_JOB_STARTED`].
    pub job: Option<ObjectPath>,
}

impl MethodResult {
    pub fn completed() -> Self {
        Self {
            return_value: RETURN_COMPLETED,
            job: None,
        }
    }
}

/// Query and mutate the host's management object model.
///
/// Implementations must not cache: each call observes the host as it is.
pub trait ManagementBridge: Send + Sync {
    /// Look up an object by display name (`ElementName`).
    fn query_by_name(&self, kind: EntityKind, name: &str) -> BridgeResult<Option<ManagementObject>>;

    /// Look up an object by unique identifier (`Name`).
    fn query_by_guid(&self, kind: EntityKind, id: Uuid) -> BridgeResult<Option<ManagementObject>>;

    fn query(&self, query: &SettingsQuery) -> BridgeResult<Vec<ManagementObject>>;

    /// Objects of `kind` associated with `object`.
    fn get_related(
        &self,
        object: &ManagementObject,
        kind: EntityKind,
    ) -> BridgeResult<Vec<ManagementObject>>;

    /// Re-fetch an object by path. Used to refresh jobs.
    fn get_object(&self, path: &ObjectPath) -> BridgeResult<Option<ManagementObject>>;

    fn serialize(&self, object: &ManagementObject) -> BridgeResult<String> {
        SettingsDocument::from_object(object).to_text()
    }

    /// Invoke a modification method on the management service.
    fn invoke_service_method(
        &self,
        method: ServiceMethod,
        documents: Vec<String>,
    ) -> BridgeResult<MethodResult>;
}

impl<T: ManagementBridge + ?Sized> ManagementBridge for Arc<T> {
    fn query_by_name(&self, kind: EntityKind, name: &str) -> BridgeResult<Option<ManagementObject>> {
        (**self).query_by_name(kind, name)
    }

    fn query_by_guid(&self, kind: EntityKind, id: Uuid) -> BridgeResult<Option<ManagementObject>> {
        (**self).query_by_guid(kind, id)
    }

    fn query(&self, query: &SettingsQuery) -> BridgeResult<Vec<ManagementObject>> {
        (**self).query(query)
    }

    fn get_related(
        &self,
        object: &ManagementObject,
        kind: EntityKind,
    ) -> BridgeResult<Vec<ManagementObject>> {
        (**self).get_related(object, kind)
    }

    fn get_object(&self, path: &ObjectPath) -> BridgeResult<Option<ManagementObject>> {
        (**self).get_object(path)
    }

    fn serialize(&self, object: &ManagementObject) -> BridgeResult<String> {
        (**self).serialize(object)
    }

    fn invoke_service_method(
        &self,
        method: ServiceMethod,
        documents: Vec<String>,
    ) -> BridgeResult<MethodResult> {
        (**self).invoke_service_method(method, documents)
    }
}
