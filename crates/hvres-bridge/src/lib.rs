//! hvres-bridge — typed access to the host's management object model.
//!
//! The host owns every VM's hardware configuration. This crate is the only
//! way the rest of hvres talks to it: look objects up, walk relationships,
//! read and write properties, serialize an object into a settings document
//! and hand documents to a management service method.
//!
//! # Architecture
//!
//! ```text
//! ManagementBridge (trait)
//!   ├── query_by_name / query_by_guid / query(SettingsQuery)
//!   ├── get_related(object, EntityKind)
//!   ├── get_object(path)            (job refresh)
//!   ├── serialize(object) → SettingsDocument text
//!   └── invoke_service_method(method, documents) → MethodResult
//!
//! SimulatedHost — in-memory implementation with scripted outcomes
//! ```
//!
//! Nothing is cached: every call reflects the host as it is now. Objects
//! handed out are detached snapshots; mutating one changes nothing until it
//! is serialized and submitted.
//!
//! Host schemas differ between builds, so properties may simply be absent.
//! Callers probe with [`ManagementObject::has`] and skip what is missing.

pub mod bridge;
pub mod document;
pub mod error;
pub mod query;
pub mod simulated;
pub mod types;

pub use bridge::{ManagementBridge, MethodResult, ServiceMethod, RETURN_COMPLETED, RETURN_JOB_STARTED};
pub use document::{PropertyNode, SettingsDocument};
pub use error::{BridgeError, BridgeResult};
pub use query::{InstanceFilter, SettingsQuery};
pub use simulated::{ScriptedOutcome, SimulatedHost, Submission, VmFixture};
pub use types::*;
