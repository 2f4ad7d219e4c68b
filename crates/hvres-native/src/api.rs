//! The host compute service entry points.

use crate::buffer::OwnedBuffer;

/// Outcome of `ModifyServiceSettings`.
#[derive(Debug)]
pub struct ModifyResponse<B> {
    /// HRESULT-style status; zero is success.
    pub status: i32,
    /// Error document, when the host produced one.
    pub result: Option<B>,
}

/// Outcome of `GetServiceProperties`.
#[derive(Debug)]
pub struct QueryResponse<B> {
    pub status: i32,
    pub properties: Option<B>,
    pub result: Option<B>,
}

/// The two service-level entry points of the host compute service.
///
/// Calls are synchronous. Returned buffers belong to the caller.
pub trait HostComputeApi: Send + Sync {
    type Buffer: OwnedBuffer;

    fn modify_service_settings(&self, settings: &str) -> ModifyResponse<Self::Buffer>;

    fn get_service_properties(&self, query: &str) -> QueryResponse<Self::Buffer>;
}

impl<T: HostComputeApi + ?Sized> HostComputeApi for std::sync::Arc<T> {
    type Buffer = T::Buffer;

    fn modify_service_settings(&self, settings: &str) -> ModifyResponse<Self::Buffer> {
        (**self).modify_service_settings(settings)
    }

    fn get_service_properties(&self, query: &str) -> QueryResponse<Self::Buffer> {
        (**self).get_service_properties(query)
    }
}
