//! hvres-model — desired-state records for VM hardware allocation.
//!
//! These are plain values. They say what the caller wants a VM to look
//! like; translating them into host properties is the engine's job.

pub mod config;
pub mod types;

pub use config::{DesiredState, ServiceConfig};
pub use types::*;
