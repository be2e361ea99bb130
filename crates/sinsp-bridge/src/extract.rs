//! Asynchronous field extraction.
//!
//! The host fills an [`AsyncExtractorInfo`] on its own thread and wakes the
//! plugin through `cb_wait`. A dedicated plugin thread runs the extraction
//! callback, writes the result back into the same struct and calls `cb_wait`
//! again, which both reports completion and parks it until the next request.
//! When `cb_wait` returns `false` the worker exits for good.
//!
//! There is no queuing and no cancellation: the host must wait for one
//! completion before publishing the next request, and a callback that never
//! returns blocks the host's wait as well.

use std::ffi::{c_char, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::abi::{ReturnCode, WaitFn, PT_CHARBUF, PT_UINT64};
use crate::error::{BridgeError, Result};
use crate::native;

/// Shared request/response block owned by the host.
#[repr(C)]
#[derive(Debug)]
pub struct AsyncExtractorInfo {
    pub evtnum: u64,
    pub field: *const c_char,
    pub arg: *const c_char,
    pub data: *const u8,
    pub datalen: u32,
    pub ts: u64,
    pub ftype: u32,
    pub field_present: u32,
    pub res_str: *mut c_char,
    pub res_u64: u64,
    pub rc: i32,
    pub cb_wait: Option<WaitFn>,
    pub wait_ctx: *mut c_void,
}

impl AsyncExtractorInfo {
    /// An empty block wired to `cb_wait`/`wait_ctx`.
    pub fn new(cb_wait: WaitFn, wait_ctx: *mut c_void) -> Self {
        Self {
            evtnum: 0,
            field: ptr::null(),
            arg: ptr::null(),
            data: ptr::null(),
            datalen: 0,
            ts: 0,
            ftype: 0,
            field_present: 0,
            res_str: ptr::null_mut(),
            res_u64: 0,
            rc: ReturnCode::Success.as_raw(),
            cb_wait: Some(cb_wait),
            wait_ctx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Uint64,
}

impl FieldKind {
    pub fn from_ftype(ftype: u32) -> Option<Self> {
        match ftype {
            PT_CHARBUF => Some(Self::String),
            PT_UINT64 => Some(Self::Uint64),
            _ => None,
        }
    }

    pub fn ftype(self) -> u32 {
        match self {
            Self::String => PT_CHARBUF,
            Self::Uint64 => PT_UINT64,
        }
    }

    /// Name used in field descriptors.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Uint64 => "uint64",
        }
    }
}

/// One extraction request. Borrows host memory valid for a single cycle only.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub kind: FieldKind,
    pub field: &'a str,
    pub arg: &'a str,
    pub data: &'a [u8],
    pub evtnum: u64,
    pub ts: u64,
}

/// Value produced by one extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedValue {
    Str(String),
    U64(u64),
}

/// Outcome of one cycle before it is written back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub rc: ReturnCode,
    pub value: Option<ExtractedValue>,
}

impl ExtractionResult {
    pub fn present(&self) -> bool {
        self.value.is_some()
    }

    fn code(rc: ReturnCode) -> Self {
        Self { rc, value: None }
    }

    /// Write into the host block. The string, if any, is copied into a
    /// `malloc` buffer whose ownership passes to the host.
    fn write_to(self, info: &mut AsyncExtractorInfo) {
        info.res_str = ptr::null_mut();
        info.res_u64 = 0;
        info.field_present = 0;

        let rc = match self.value {
            Some(ExtractedValue::Str(s)) => match native::alloc_cstring(&s) {
                Ok(p) => {
                    info.res_str = p.as_ptr();
                    info.field_present = 1;
                    self.rc
                }
                Err(e) => {
                    warn!(error = %e, "dropping extracted string");
                    ReturnCode::Failure
                }
            },
            Some(ExtractedValue::U64(v)) => {
                info.res_u64 = v;
                info.field_present = 1;
                self.rc
            }
            None => self.rc,
        };
        info.rc = rc.as_raw();
    }
}

pub type StringExtractFn =
    Box<dyn Fn(&ExtractionRequest<'_>) -> Result<Option<String>> + Send + Sync>;
pub type U64ExtractFn = Box<dyn Fn(&ExtractionRequest<'_>) -> Result<Option<u64>> + Send + Sync>;

/// Extraction callbacks for one registration.
#[derive(Default)]
pub struct AsyncExtractor {
    string: Option<StringExtractFn>,
    uint64: Option<U64ExtractFn>,
}

impl AsyncExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_string<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExtractionRequest<'_>) -> Result<Option<String>> + Send + Sync + 'static,
    {
        self.string = Some(Box::new(f));
        self
    }

    pub fn with_u64<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExtractionRequest<'_>) -> Result<Option<u64>> + Send + Sync + 'static,
    {
        self.uint64 = Some(Box::new(f));
        self
    }

    /// Run the matching callback for one request.
    ///
    /// A missing callback is NOT_SUPPORTED; callback errors map to their
    /// return code; a panic becomes FAILURE.
    pub fn dispatch(&self, req: &ExtractionRequest<'_>) -> ExtractionResult {
        let called = catch_unwind(AssertUnwindSafe(|| match req.kind {
            FieldKind::String => self
                .string
                .as_ref()
                .map(|f| f(req).map(|v| v.map(ExtractedValue::Str))),
            FieldKind::Uint64 => self
                .uint64
                .as_ref()
                .map(|f| f(req).map(|v| v.map(ExtractedValue::U64))),
        }));

        match called {
            Ok(None) => ExtractionResult::code(ReturnCode::NotSupported),
            Ok(Some(Ok(value))) => ExtractionResult {
                rc: ReturnCode::Success,
                value,
            },
            Ok(Some(Err(e))) => {
                debug!(field = req.field, error = %e, "extraction failed");
                ExtractionResult::code(e.return_code())
            }
            Err(_) => {
                warn!(field = req.field, "extraction callback panicked");
                ExtractionResult::code(ReturnCode::Failure)
            }
        }
    }

    /// Decode the host block, dispatch and write the result back.
    ///
    /// # Safety
    /// `info` must be valid and exclusively ours for the current cycle, with
    /// `field`/`arg` null or NUL-terminated and `data` valid for `datalen` bytes.
    pub unsafe fn serve_one(&self, info: &mut AsyncExtractorInfo) {
        let result = match FieldKind::from_ftype(info.ftype) {
            None => ExtractionResult::code(ReturnCode::NotSupported),
            Some(kind) => match decode_request(kind, info) {
                Ok(req) => self.dispatch(&req),
                Err(e) => {
                    debug!(error = %e, "malformed extraction request");
                    ExtractionResult::code(ReturnCode::Failure)
                }
            },
        };
        result.write_to(info);
    }

    /// Start the worker for the host block at `info`.
    ///
    /// # Safety
    /// `info` must stay valid, and must only be touched by the host while the
    /// worker is parked inside `cb_wait`, until `cb_wait` has returned `false`.
    pub unsafe fn spawn(self, info: *mut AsyncExtractorInfo) -> Result<AsyncExtractorHandle> {
        let info = NonNull::new(info)
            .ok_or(BridgeError::ProtocolViolation("null async extractor info"))?;
        let cb_wait = info
            .as_ref()
            .cb_wait
            .ok_or(BridgeError::ProtocolViolation("async extractor info without cb_wait"))?;

        let state = Arc::new(AtomicU8::new(BridgeState::Waiting as u8));
        let worker_state = Arc::clone(&state);
        let block = InfoPtr(info);

        let join = thread::Builder::new()
            .name("sinsp-async-extract".into())
            .spawn(move || {
                let block = block;
                run(&self, block.0, cb_wait, &worker_state)
            })
            .map_err(|e| {
                BridgeError::Plugin(anyhow::Error::new(e).context("spawning extractor worker"))
            })?;

        Ok(AsyncExtractorHandle { join, state })
    }
}

unsafe fn decode_request<'a>(
    kind: FieldKind,
    info: &'a AsyncExtractorInfo,
) -> Result<ExtractionRequest<'a>> {
    Ok(ExtractionRequest {
        kind,
        field: native::borrow_str(info.field)?,
        arg: native::borrow_str(info.arg)?,
        data: native::borrow_bytes(info.data, info.datalen),
        evtnum: info.evtnum,
        ts: info.ts,
    })
}

struct InfoPtr(NonNull<AsyncExtractorInfo>);

// The host block is only touched by one side at a time, as sequenced by cb_wait.
unsafe impl Send for InfoPtr {}

fn run(
    extractor: &AsyncExtractor,
    info: NonNull<AsyncExtractorInfo>,
    cb_wait: WaitFn,
    state: &AtomicU8,
) -> u64 {
    let mut cycles = 0u64;
    debug!("async extractor started");
    loop {
        state.store(BridgeState::Waiting as u8, Ordering::Release);
        let wait_ctx = unsafe { info.as_ref().wait_ctx };
        if !unsafe { cb_wait(wait_ctx) } {
            break;
        }
        state.store(BridgeState::Dispatching as u8, Ordering::Release);
        unsafe { extractor.serve_one(&mut *info.as_ptr()) };
        cycles += 1;
        trace!(cycles, "extraction cycle complete");
    }
    state.store(BridgeState::Terminated as u8, Ordering::Release);
    debug!(cycles, "async extractor terminated");
    cycles
}

/// Lifecycle of one async registration.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Waiting = 0,
    Dispatching = 1,
    Terminated = 2,
}

impl BridgeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Waiting,
            1 => Self::Dispatching,
            _ => Self::Terminated,
        }
    }
}

/// Owner of a running extractor worker.
pub struct AsyncExtractorHandle {
    join: JoinHandle<u64>,
    state: Arc<AtomicU8>,
}

impl AsyncExtractorHandle {
    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker to exit; returns the number of cycles served.
    ///
    /// Only returns once the host has signalled shutdown through `cb_wait`.
    pub fn join(self) -> Result<u64> {
        self.join.join().map_err(|_| {
            BridgeError::Plugin(anyhow::anyhow!("async extractor worker panicked"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn extractor() -> AsyncExtractor {
        AsyncExtractor::new()
            .with_string(|req| Ok(Some(format!("{}:{}", req.field, req.arg))))
            .with_u64(|req| match req.field {
                "len" => Ok(Some(req.data.len() as u64)),
                "missing" => Ok(None),
                _ => Err(BridgeError::Unsupported(req.field.to_string())),
            })
    }

    fn request<'a>(kind: FieldKind, field: &'a str, data: &'a [u8]) -> ExtractionRequest<'a> {
        ExtractionRequest {
            kind,
            field,
            arg: "",
            data,
            evtnum: 1,
            ts: 0,
        }
    }

    #[test]
    fn test_dispatch_string() {
        let r = extractor().dispatch(&request(FieldKind::String, "f", b""));
        assert_eq!(r.rc, ReturnCode::Success);
        assert_eq!(r.value, Some(ExtractedValue::Str("f:".into())));
    }

    #[test]
    fn test_dispatch_u64_absent_and_unsupported() {
        let x = extractor();
        let r = x.dispatch(&request(FieldKind::Uint64, "len", b"abcd"));
        assert_eq!(r.value, Some(ExtractedValue::U64(4)));

        let r = x.dispatch(&request(FieldKind::Uint64, "missing", b""));
        assert_eq!(r.rc, ReturnCode::Success);
        assert!(!r.present());

        let r = x.dispatch(&request(FieldKind::Uint64, "nope", b""));
        assert_eq!(r.rc, ReturnCode::NotSupported);
    }

    #[test]
    fn test_missing_callback_not_supported() {
        let r = AsyncExtractor::new().dispatch(&request(FieldKind::String, "f", b""));
        assert_eq!(r.rc, ReturnCode::NotSupported);
    }

    #[test]
    fn test_panicking_callback_is_failure() {
        let x = AsyncExtractor::new().with_u64(|_| panic!("bad field"));
        let r = x.dispatch(&request(FieldKind::Uint64, "f", b""));
        assert_eq!(r.rc, ReturnCode::Failure);
    }

    unsafe extern "C" fn never_wait(_: *mut c_void) -> bool {
        false
    }

    #[test]
    fn test_serve_one_writes_host_block() {
        let field = CString::new("name").unwrap();
        let arg = CString::new("x").unwrap();
        let mut info = AsyncExtractorInfo::new(never_wait, ptr::null_mut());
        info.ftype = PT_CHARBUF;
        info.field = field.as_ptr();
        info.arg = arg.as_ptr();

        unsafe { extractor().serve_one(&mut info) };

        assert_eq!(info.rc, 0);
        assert_eq!(info.field_present, 1);
        let s = unsafe { native::take_cstring(info.res_str) };
        assert_eq!(s.as_deref(), Some("name:x"));
    }

    #[test]
    fn test_serve_one_unknown_ftype() {
        let mut info = AsyncExtractorInfo::new(never_wait, ptr::null_mut());
        info.ftype = 77;
        unsafe { extractor().serve_one(&mut info) };
        assert_eq!(info.rc, ReturnCode::NotSupported.as_raw());
        assert_eq!(info.field_present, 0);
    }

    #[test]
    fn test_worker_terminates_when_wait_returns_false() {
        let mut info = AsyncExtractorInfo::new(never_wait, ptr::null_mut());
        let handle = unsafe { extractor().spawn(&mut info) }.unwrap();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_spawn_rejects_null() {
        assert!(unsafe { extractor().spawn(ptr::null_mut()) }.is_err());
    }
}
