//! Constants and `#[repr(C)]` layouts shared with the host engine.
//!
//! Everything in this module must stay layout-compatible with the host's
//! plugin header; field order and integer widths are part of the ABI.

use std::ffi::{c_char, c_void};

/// API version reported by `plugin_get_required_api_version`.
pub const REQUIRED_API_VERSION: &str = "1.0.0";

/// Default upper bound on the number of events returned by one `next_batch` call.
pub const MAX_NEXT_BATCH_EVENTS: usize = 512;

/// Parameter type code for NUL-terminated string fields.
pub const PT_CHARBUF: u32 = 9;

/// Parameter type code for unsigned 64-bit fields.
pub const PT_UINT64: u32 = 8;

/// Return codes understood by the host.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Success = 0,
    Failure = 1,
    Timeout = -1,
    Eof = 6,
    NotSupported = 9,
}

impl ReturnCode {
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Success),
            1 => Some(Self::Failure),
            -1 => Some(Self::Timeout),
            6 => Some(Self::Eof),
            9 => Some(Self::NotSupported),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Plugin kind reported by `plugin_get_type`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    Source = 1,
    Extractor = 2,
}

impl PluginType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Source),
            2 => Some(Self::Extractor),
            _ => None,
        }
    }
}

/// One event record inside an array returned from `plugin_next`/`plugin_next_batch`.
///
/// `data` points to a separately allocated payload; both the payload and the
/// array holding this record belong to the host once returned.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ss_plugin_event {
    pub evtnum: u64,
    pub data: *const u8,
    pub datalen: u32,
    pub ts: u64,
}

/// Host-provided wait primitive for the async extractor.
pub type WaitFn = unsafe extern "C" fn(wait_ctx: *mut c_void) -> bool;

/// Signatures of the exported entry points, used by hosts resolving symbols.
pub mod symbols {
    use super::*;

    pub type GetStrFn = unsafe extern "C" fn() -> *const c_char;
    pub type GetU32Fn = unsafe extern "C" fn() -> u32;
    pub type InitFn = unsafe extern "C" fn(config: *const c_char, rc: *mut i32) -> *mut c_void;
    pub type DestroyFn = unsafe extern "C" fn(state: *mut c_void);
    pub type GetLastErrorFn = unsafe extern "C" fn(state: *mut c_void) -> *const c_char;
    pub type OpenFn =
        unsafe extern "C" fn(state: *mut c_void, params: *const c_char, rc: *mut i32) -> *mut c_void;
    pub type CloseFn = unsafe extern "C" fn(state: *mut c_void, open: *mut c_void);
    pub type NextFn = unsafe extern "C" fn(
        state: *mut c_void,
        open: *mut c_void,
        evt: *mut *mut ss_plugin_event,
    ) -> i32;
    pub type NextBatchFn = unsafe extern "C" fn(
        state: *mut c_void,
        open: *mut c_void,
        nevts: *mut u32,
        evts: *mut *mut ss_plugin_event,
    ) -> i32;
    pub type EventToStringFn =
        unsafe extern "C" fn(state: *mut c_void, data: *const u8, datalen: u32) -> *const c_char;
    pub type RegisterAsyncFn = unsafe extern "C" fn(
        state: *mut c_void,
        info: *mut crate::extract::AsyncExtractorInfo,
    ) -> i32;
    pub type ExtractStrFn = unsafe extern "C" fn(
        state: *mut c_void,
        evtnum: u64,
        field: *const c_char,
        arg: *const c_char,
        data: *const u8,
        datalen: u32,
    ) -> *mut c_char;
    pub type ExtractU64Fn = unsafe extern "C" fn(
        state: *mut c_void,
        evtnum: u64,
        field: *const c_char,
        arg: *const c_char,
        data: *const u8,
        datalen: u32,
        field_present: *mut u32,
    ) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_round_trip() {
        for rc in [
            ReturnCode::Success,
            ReturnCode::Failure,
            ReturnCode::Timeout,
            ReturnCode::Eof,
            ReturnCode::NotSupported,
        ] {
            assert_eq!(ReturnCode::from_raw(rc.as_raw()), Some(rc));
        }
        assert_eq!(ReturnCode::from_raw(42), None);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_event_record_layout() {
        assert_eq!(std::mem::size_of::<ss_plugin_event>(), 32);
        assert_eq!(std::mem::align_of::<ss_plugin_event>(), 8);
    }
}
