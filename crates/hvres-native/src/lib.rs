//! hvres-native — CPU-group lifecycle through the host compute service.
//!
//! The host compute service exposes two service-level entry points that
//! take and return JSON. This crate builds the CPU-group requests, sends
//! them through a [`HostComputeApi`], and turns non-zero statuses into
//! [`NativeError::CallFailed`].
//!
//! # Architecture
//!
//! ```text
//! NativeServiceChannel
//!   ├── protocol (request / query / response documents)
//!   └── HostComputeApi
//!       ├── VmCompute (vmcompute.dll, Windows only)
//!       └── FakeHostCompute (in-memory)
//!           each response buffer is an OwnedBuffer, released on drop
//! ```

pub mod api;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod fake;
pub mod protocol;
#[cfg(windows)]
pub mod vmcompute;

pub use api::{HostComputeApi, ModifyResponse, QueryResponse};
pub use buffer::OwnedBuffer;
pub use channel::NativeServiceChannel;
pub use error::{NativeError, NativeResult};
pub use fake::FakeHostCompute;
pub use protocol::{CpuGroupInfo, CpuGroupOperation, ModifyRequest, PropertyQuery};
#[cfg(windows)]
pub use vmcompute::VmCompute;
