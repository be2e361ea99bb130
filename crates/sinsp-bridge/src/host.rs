//! Host-side counterparts of the boundary protocols.
//!
//! The real host is a native engine; these types play its part for the
//! harness binary and for tests that exercise a plugin end to end.

use std::cell::UnsafeCell;
use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::abi::ReturnCode;
use crate::error::{BridgeError, Result};
use crate::extract::{
    AsyncExtractorInfo, ExtractedValue, ExtractionRequest, ExtractionResult, FieldKind,
};
use crate::native;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Requested,
    InFlight,
    Completed,
    Shutdown,
}

struct HostShared {
    phase: Mutex<Phase>,
    signal: Condvar,
    info: UnsafeCell<AsyncExtractorInfo>,
}

// `info` is only touched by whichever side the phase hands it to.
unsafe impl Send for HostShared {}
unsafe impl Sync for HostShared {}

/// The host half of the async extraction rendezvous.
///
/// Owns the [`AsyncExtractorInfo`] block handed to
/// `plugin_register_async_extractor` and implements its `cb_wait`.
///
/// The block's `wait_ctx` holds a second reference to the shared state. A
/// registered worker drops it when `cb_wait` reports shutdown; otherwise the
/// channel takes it back itself, see [`registration_failed`](Self::registration_failed).
pub struct AsyncHostChannel {
    shared: Arc<HostShared>,
    /// Whether `info_ptr` has handed the block out.
    lent: AtomicBool,
    /// Whether the `wait_ctx` reference is still outstanding.
    wait_ref: bool,
}

impl AsyncHostChannel {
    pub fn new() -> Self {
        let shared = Arc::new(HostShared {
            phase: Mutex::new(Phase::Idle),
            signal: Condvar::new(),
            info: UnsafeCell::new(AsyncExtractorInfo::new(host_wait, ptr::null_mut())),
        });
        // The worker keeps its own reference through wait_ctx and drops it
        // when cb_wait reports shutdown.
        let wait_ctx = Arc::into_raw(Arc::clone(&shared)) as *mut c_void;
        unsafe { (*shared.info.get()).wait_ctx = wait_ctx };
        Self {
            shared,
            lent: AtomicBool::new(false),
            wait_ref: true,
        }
    }

    /// Pointer to pass to `plugin_register_async_extractor`.
    pub fn info_ptr(&self) -> *mut AsyncExtractorInfo {
        self.lent.store(true, Ordering::Relaxed);
        self.shared.info.get()
    }

    /// Take back the `wait_ctx` reference after registration was rejected.
    ///
    /// Only valid when no worker was started for the block: a worker that
    /// later calls `cb_wait` would touch freed state.
    pub fn registration_failed(&mut self) {
        self.shutdown();
        self.reclaim_wait_ref();
    }

    fn reclaim_wait_ref(&mut self) {
        if std::mem::replace(&mut self.wait_ref, false) {
            unsafe { Arc::decrement_strong_count(Arc::as_ptr(&self.shared)) };
        }
    }

    /// Publish one request and block until the plugin reports completion.
    pub fn submit(&mut self, req: &ExtractionRequest<'_>) -> Result<ExtractionResult> {
        let field = CString::new(req.field)
            .map_err(|_| BridgeError::Configuration("field name contains NUL".into()))?;
        let arg = CString::new(req.arg)
            .map_err(|_| BridgeError::Configuration("field argument contains NUL".into()))?;
        let datalen = u32::try_from(req.data.len())
            .map_err(|_| BridgeError::Configuration("event payload too large".into()))?;

        let mut phase = self.shared.phase.lock();
        match *phase {
            Phase::Idle => {}
            Phase::Shutdown => {
                return Err(BridgeError::ProtocolViolation("extractor channel shut down"))
            }
            _ => return Err(BridgeError::ProtocolViolation("request already in flight")),
        }

        unsafe {
            let info = &mut *self.shared.info.get();
            info.evtnum = req.evtnum;
            info.ts = req.ts;
            info.ftype = req.kind.ftype();
            info.field = field.as_ptr();
            info.arg = arg.as_ptr();
            info.data = req.data.as_ptr();
            info.datalen = datalen;
            info.res_str = ptr::null_mut();
            info.res_u64 = 0;
            info.field_present = 0;
            info.rc = ReturnCode::Failure.as_raw();
        }

        *phase = Phase::Requested;
        self.shared.signal.notify_all();
        while *phase != Phase::Completed {
            if *phase == Phase::Shutdown {
                return Err(BridgeError::ProtocolViolation("extractor shut down mid-cycle"));
            }
            self.shared.signal.wait(&mut phase);
        }
        *phase = Phase::Idle;

        let info = unsafe { &mut *self.shared.info.get() };
        info.field = ptr::null();
        info.arg = ptr::null();
        info.data = ptr::null();
        info.datalen = 0;

        let rc = ReturnCode::from_raw(info.rc).unwrap_or(ReturnCode::Failure);
        let res_str = std::mem::replace(&mut info.res_str, ptr::null_mut());
        let owned = unsafe { native::take_cstring(res_str) };

        let value = if info.field_present == 0 {
            None
        } else {
            match req.kind {
                FieldKind::String => owned.map(ExtractedValue::Str),
                FieldKind::Uint64 => Some(ExtractedValue::U64(info.res_u64)),
            }
        };
        Ok(ExtractionResult { rc, value })
    }

    /// Tell the plugin worker to exit. It leaves `cb_wait` with `false`.
    pub fn shutdown(&self) {
        *self.shared.phase.lock() = Phase::Shutdown;
        self.shared.signal.notify_all();
    }

    /// Whether the plugin worker has returned from its final `cb_wait`.
    ///
    /// For a channel no worker ever served, true only after
    /// [`registration_failed`](Self::registration_failed).
    pub fn is_released(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }

    /// Poll [`is_released`](Self::is_released) until it holds or `timeout` passes.
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_released() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Default for AsyncHostChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncHostChannel {
    fn drop(&mut self) {
        self.shutdown();
        if !self.lent.load(Ordering::Relaxed) {
            self.reclaim_wait_ref();
        }
    }
}

unsafe extern "C" fn host_wait(ctx: *mut c_void) -> bool {
    let shared = &*(ctx as *const HostShared);
    {
        let mut phase = shared.phase.lock();
        if *phase == Phase::InFlight {
            *phase = Phase::Completed;
            shared.signal.notify_all();
        }
        loop {
            match *phase {
                Phase::Requested => {
                    *phase = Phase::InFlight;
                    return true;
                }
                Phase::Shutdown => break,
                _ => shared.signal.wait(&mut phase),
            }
        }
    }
    Arc::decrement_strong_count(ctx as *const HostShared);
    false
}
