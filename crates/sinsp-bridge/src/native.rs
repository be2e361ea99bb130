//! Allocations whose ownership is handed to the host.
//!
//! The host releases these with `free`, so they must come from the C
//! allocator rather than Rust's global allocator.

use std::ffi::{c_char, CStr};
use std::ptr::{self, NonNull};

use crate::error::{BridgeError, Result};

/// Allocate `size` bytes with `malloc`. Zero-sized requests get one byte so the
/// result is always a distinct, freeable pointer.
pub fn alloc(size: usize) -> Result<NonNull<u8>> {
    let raw = unsafe { libc::malloc(size.max(1)) } as *mut u8;
    NonNull::new(raw).ok_or(BridgeError::Allocation { size })
}

/// Copy `bytes` into a fresh `malloc`-ed buffer.
pub fn copy_bytes(bytes: &[u8]) -> Result<NonNull<u8>> {
    let dst = alloc(bytes.len())?;
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
    Ok(dst)
}

/// Copy `s` into a fresh NUL-terminated `malloc`-ed C string.
pub fn alloc_cstring(s: &str) -> Result<NonNull<c_char>> {
    if s.as_bytes().contains(&0) {
        return Err(BridgeError::Plugin(anyhow::anyhow!(
            "string value contains an interior NUL byte"
        )));
    }
    let dst = alloc(s.len() + 1)?;
    unsafe {
        ptr::copy_nonoverlapping(s.as_ptr(), dst.as_ptr(), s.len());
        *dst.as_ptr().add(s.len()) = 0;
    }
    Ok(dst.cast())
}

/// Release memory obtained from this module (or from any `malloc`).
///
/// # Safety
/// `ptr` must be null or a live `malloc` allocation not freed elsewhere.
pub unsafe fn free<T>(ptr: *mut T) {
    libc::free(ptr.cast());
}

/// Take ownership of a host-bound C string, copy it out and free it.
///
/// # Safety
/// `ptr` must be null or a NUL-terminated `malloc` allocation owned by the caller.
pub unsafe fn take_cstring(ptr: *mut c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let value = CStr::from_ptr(ptr).to_string_lossy().into_owned();
    free(ptr);
    Some(value)
}

/// Borrow a C string for the duration of a call. Null maps to `""`.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string valid for `'a`.
pub unsafe fn borrow_str<'a>(ptr: *const c_char) -> Result<&'a str> {
    if ptr.is_null() {
        return Ok("");
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| BridgeError::Plugin(anyhow::anyhow!("invalid UTF-8 from host: {e}")))
}

/// Borrow a byte buffer for the duration of a call. Null maps to an empty slice.
///
/// # Safety
/// `ptr` must be null or valid for reads of `len` bytes for `'a`.
pub unsafe fn borrow_bytes<'a>(ptr: *const u8, len: u32) -> &'a [u8] {
    if ptr.is_null() || len == 0 {
        return &[];
    }
    std::slice::from_raw_parts(ptr, len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstring_round_trip() {
        let p = alloc_cstring("ciao").unwrap();
        let back = unsafe { take_cstring(p.as_ptr()) };
        assert_eq!(back.as_deref(), Some("ciao"));
    }

    #[test]
    fn test_interior_nul_rejected() {
        assert!(alloc_cstring("a\0b").is_err());
    }

    #[test]
    fn test_copy_bytes_empty() {
        let p = copy_bytes(&[]).unwrap();
        unsafe { free(p.as_ptr()) };
    }

    #[test]
    fn test_borrow_null() {
        assert_eq!(unsafe { borrow_str(std::ptr::null()) }.unwrap(), "");
        assert!(unsafe { borrow_bytes(std::ptr::null(), 10) }.is_empty());
    }
}
