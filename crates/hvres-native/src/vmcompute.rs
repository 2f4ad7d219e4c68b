//! `vmcompute.dll` backend.

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::api::{HostComputeApi, ModifyResponse, QueryResponse};
use crate::buffer::OwnedBuffer;

mod sys {
    use std::ffi::c_void;

    #[link(name = "vmcompute")]
    unsafe extern "system" {
        pub fn HcsModifyServiceSettings(settings: *const u16, result: *mut *mut u16) -> i32;

        pub fn HcsGetServiceProperties(
            property_query: *const u16,
            properties: *mut *mut u16,
            result: *mut *mut u16,
        ) -> i32;
    }

    #[link(name = "ole32")]
    unsafe extern "system" {
        pub fn CoTaskMemFree(pv: *mut c_void);
        pub fn CoInitializeEx(reserved: *mut c_void, co_init: u32) -> i32;
        pub fn CoUninitialize();
    }

    pub const COINIT_MULTITHREADED: u32 = 0;
}

/// A wide string allocated by the service with the COM task allocator.
pub struct CoTaskMemString {
    ptr: NonNull<u16>,
}

impl CoTaskMemString {
    /// Take ownership of `ptr`. Null yields `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a NUL-terminated UTF-16 string allocated with
    /// `CoTaskMemAlloc` that nothing else will free.
    unsafe fn from_raw(ptr: *mut u16) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }
}

impl OwnedBuffer for CoTaskMemString {
    fn to_string_lossy(&self) -> String {
        // SAFETY: the pointer is a live NUL-terminated string per `from_raw`.
        unsafe {
            let mut len = 0;
            while *self.ptr.as_ptr().add(len) != 0 {
                len += 1;
            }
            String::from_utf16_lossy(std::slice::from_raw_parts(self.ptr.as_ptr(), len))
        }
    }
}

impl Drop for CoTaskMemString {
    fn drop(&mut self) {
        // SAFETY: allocated by the COM task allocator and owned by us.
        unsafe { sys::CoTaskMemFree(self.ptr.as_ptr().cast::<c_void>()) }
    }
}

/// Keeps COM initialized on the current thread for the guard's lifetime.
struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    fn enter() -> Self {
        // SAFETY: plain COM initialization for this thread.
        let hr = unsafe { sys::CoInitializeEx(ptr::null_mut(), sys::COINIT_MULTITHREADED) };
        if hr < 0 {
            // Already initialized in another apartment; that one still works.
            debug!(hr = %format!("0x{hr:08X}"), "COM already initialized on this thread");
        }
        Self { initialized: hr >= 0 }
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            // SAFETY: balances the successful CoInitializeEx in `enter`.
            unsafe { sys::CoUninitialize() }
        }
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// The host compute service of the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct VmCompute;

impl HostComputeApi for VmCompute {
    type Buffer = CoTaskMemString;

    fn modify_service_settings(&self, settings: &str) -> ModifyResponse<CoTaskMemString> {
        let _com = ComGuard::enter();
        let settings = wide(settings);
        let mut result = ptr::null_mut();
        // SAFETY: `settings` is NUL-terminated and outlives the call; the
        // out pointer is either left null or receives an owned allocation.
        let status = unsafe { sys::HcsModifyServiceSettings(settings.as_ptr(), &mut result) };
        ModifyResponse {
            status,
            // SAFETY: ownership of the result buffer passes to us.
            result: unsafe { CoTaskMemString::from_raw(result) },
        }
    }

    fn get_service_properties(&self, query: &str) -> QueryResponse<CoTaskMemString> {
        let _com = ComGuard::enter();
        let query = wide(query);
        let mut properties = ptr::null_mut();
        let mut result = ptr::null_mut();
        // SAFETY: as above, for both out pointers.
        let status = unsafe {
            sys::HcsGetServiceProperties(query.as_ptr(), &mut properties, &mut result)
        };
        QueryResponse {
            status,
            // SAFETY: ownership of both buffers passes to us.
            properties: unsafe { CoTaskMemString::from_raw(properties) },
            result: unsafe { CoTaskMemString::from_raw(result) },
        }
    }
}
