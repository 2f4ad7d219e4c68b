//! hvres-reconcile — bring a VM's hardware allocation to a desired state.
//!
//! Every public operation on [`ReconcileService`] runs the same pipeline
//! on a blocking worker:
//!
//! # Architecture
//!
//! ```text
//! ReconcileService
//!   ├── ManagementBridge ── locate VM and settings object
//!   ├── hvres-engine ────── compute target property values
//!   ├── ManagementBridge ── serialize + invoke modification method
//!   ├── JobMonitor ──────── resolve 0 / 4096 + job / failure code
//!   ├── CpuGroupBinder ──── CpuGroupId on processor settings (bridge path)
//!   └── NativeServiceChannel ── CPU-group lifecycle (native path)
//! ```
//!
//! Failures come back as [`ReconcileError`]; nothing panics across the
//! public boundary. [`OperationOutcome`] flattens a result into the
//! `(success, message)` pair a display layer wants.

pub mod binding;
pub mod error;
pub mod job;
pub mod service;

pub use binding::CpuGroupBinder;
pub use error::{OperationOutcome, ReconcileError, ReconcileResult};
pub use job::{JobMonitor, JobOutcome, JobState};
pub use service::ReconcileService;
