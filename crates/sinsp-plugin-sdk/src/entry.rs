//! Generic bodies of the exported C entry points.
//!
//! [`declare_plugin!`](crate::declare_plugin) expands to thin `extern "C"`
//! wrappers around these. Every body runs under `catch_unwind`; a panic is
//! logged and reported as FAILURE (or a null pointer) instead of unwinding
//! into the host.

use std::ffi::{c_char, c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use sinsp_bridge::native;
use sinsp_bridge::{
    init_logging, marshal, AsyncExtractor, BatchDispatchContext, BatchResult, BridgeError,
    ExtractionRequest, FieldKind, PointerRegistry, ReturnCode, StateContainer,
    MAX_NEXT_BATCH_EVENTS,
};
use tracing::{debug, error, info, warn};

pub use sinsp_bridge::abi::ss_plugin_event;
pub use sinsp_bridge::AsyncExtractorInfo;

use crate::instance::{to_cstring, PluginInstance};
use crate::{ExtractorPlugin, Plugin, SourcePlugin};

/// Failure message of the last `plugin_init` that returned no state.
static INIT_ERROR: Mutex<Option<CString>> = parking_lot::const_mutex(None);

fn guarded<T>(entry: &'static str, fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!(entry, "plugin panicked inside entry point");
        fallback
    })
}

unsafe fn set_rc(rc: *mut i32, code: ReturnCode) {
    if !rc.is_null() {
        *rc = code.as_raw();
    }
}

unsafe fn instance<P: Plugin>(state: *mut c_void) -> Result<Arc<PluginInstance<P>>, BridgeError> {
    StateContainer::from_raw_ref(state)?
        .context_as::<PluginInstance<P>>()
        .ok_or(BridgeError::ProtocolViolation("plugin state without instance"))
}

unsafe fn session_batch(open: *mut c_void) -> Result<Arc<BatchDispatchContext>, BridgeError> {
    StateContainer::from_raw_ref(open)?
        .batch_context()
        .ok_or(BridgeError::ProtocolViolation("open state without session"))
}

/// Log and remember `err`; EOF and TIMEOUT are ordinary outcomes and not recorded.
fn report<P: Plugin>(instance: &Arc<PluginInstance<P>>, err: BridgeError) -> i32 {
    let rc = err.return_code();
    match rc {
        ReturnCode::Eof | ReturnCode::Timeout => debug!(plugin = P::NAME, %err, "no event"),
        _ => {
            warn!(plugin = P::NAME, error = %err, "plugin call failed");
            instance.record_error(&err);
        }
    }
    rc.as_raw()
}

/// Cache a descriptive string for the life of the process.
pub fn cached(cell: &'static OnceLock<CString>, f: impl FnOnce() -> String) -> *const c_char {
    guarded("string getter", ptr::null(), || {
        cell.get_or_init(|| to_cstring(&f())).as_ptr()
    })
}

pub fn fields_json<P: ExtractorPlugin>() -> String {
    serde_json::to_string(&P::fields()).unwrap_or_else(|e| {
        error!(plugin = P::NAME, error = %e, "serializing field descriptors");
        "[]".to_string()
    })
}

pub fn extract_sources_json<P: ExtractorPlugin>() -> String {
    serde_json::to_string(&P::extract_event_sources()).unwrap_or_else(|e| {
        error!(plugin = P::NAME, error = %e, "serializing extract event sources");
        "[]".to_string()
    })
}

/// `plugin_init`: build the plugin and wrap it in a fresh state container.
///
/// # Safety
/// `config` must be null or NUL-terminated; `rc` must be null or writable.
pub unsafe fn init<P: Plugin>(config: *const c_char, rc: *mut i32) -> *mut c_void {
    init_logging();
    set_rc(rc, ReturnCode::Failure);

    guarded("plugin_init", ptr::null_mut(), || {
        let created = native::borrow_str(config)
            .map_err(anyhow::Error::from)
            .and_then(P::init);

        match created {
            Ok(plugin) => {
                let mut container = StateContainer::new(Arc::new(PointerRegistry::new()));
                container.set_context(Some(Arc::new(PluginInstance::new(plugin))));
                info!(plugin = P::NAME, version = P::VERSION, "plugin initialized");
                set_rc(rc, ReturnCode::Success);
                container.into_raw()
            }
            Err(e) => {
                let err = BridgeError::Configuration(format!("{e:#}"));
                error!(plugin = P::NAME, error = %err, "plugin init failed");
                *INIT_ERROR.lock() = Some(to_cstring(&err.to_string()));
                set_rc(rc, err.return_code());
                ptr::null_mut()
            }
        }
    })
}

/// `plugin_destroy`: shut the plugin down and free its state.
///
/// # Safety
/// `state` must come from [`init`] and no session of it may still be open.
pub unsafe fn destroy<P: Plugin>(state: *mut c_void) {
    guarded("plugin_destroy", (), || {
        let instance = match instance::<P>(state) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(plugin = P::NAME, error = %e, "destroy on invalid state");
                return;
            }
        };

        if let Err(e) = instance.plugin().shutdown() {
            warn!(plugin = P::NAME, error = %e, "plugin shutdown reported an error");
        }
        let parked = instance.reap_extractors();
        if parked > 0 {
            warn!(plugin = P::NAME, parked, "async extractors still waiting at destroy");
        }
        drop(instance);

        if let Err(e) = StateContainer::destroy(state) {
            warn!(plugin = P::NAME, error = %e, "freeing plugin state");
        }
        info!(plugin = P::NAME, "plugin destroyed");
    })
}

/// `plugin_get_last_error`. A null `state` reports the last failed init.
///
/// # Safety
/// `state` must be null or a live state from [`init`].
pub unsafe fn get_last_error<P: Plugin>(state: *mut c_void) -> *const c_char {
    guarded("plugin_get_last_error", ptr::null(), || {
        if state.is_null() {
            return INIT_ERROR
                .lock()
                .as_ref()
                .map_or(ptr::null(), |s| s.as_ptr());
        }
        instance::<P>(state).map_or(ptr::null(), |i| i.last_error_ptr())
    })
}

/// `plugin_open`: start a session and its dispatch worker.
///
/// # Safety
/// `state` must be a live state from [`init`]; `params` null or NUL-terminated;
/// `rc` null or writable.
pub unsafe fn open<P: SourcePlugin>(
    state: *mut c_void,
    params: *const c_char,
    rc: *mut i32,
) -> *mut c_void {
    set_rc(rc, ReturnCode::Failure);

    guarded("plugin_open", ptr::null_mut(), || {
        let container = match StateContainer::from_raw_ref(state) {
            Ok(c) => c,
            Err(e) => {
                error!(plugin = P::NAME, error = %e, "open on invalid state");
                return ptr::null_mut();
            }
        };
        let Some(instance) = container.context_as::<PluginInstance<P>>() else {
            error!(plugin = P::NAME, "open on state without instance");
            return ptr::null_mut();
        };

        let session = native::borrow_str(params)
            .map_err(anyhow::Error::from)
            .and_then(|params| instance.plugin().open(params));
        let session = match session {
            Ok(s) => Arc::new(Mutex::new(s)),
            Err(e) => {
                report(&instance, BridgeError::Plugin(e.context("opening session")));
                return ptr::null_mut();
            }
        };

        let mut open_state = StateContainer::new(Arc::clone(container.registry()));
        open_state.set_context(Some(session.clone()));
        let Some(batch) = open_state.batch_context() else {
            report(&instance, BridgeError::ProtocolViolation("session without dispatch context"));
            return ptr::null_mut();
        };

        let worker_instance = Arc::clone(&instance);
        let started = batch.start(move || worker_instance.plugin().next_event(&mut session.lock()));
        if let Err(e) = started {
            report(&instance, e);
            return ptr::null_mut();
        }

        debug!(plugin = P::NAME, "session opened");
        set_rc(rc, ReturnCode::Success);
        open_state.into_raw()
    })
}

/// `plugin_close`: stop the session worker, free the open state, then let the
/// plugin clean up the session.
///
/// # Safety
/// `open` must come from [`open`] on this `state`, with no call in flight on it.
pub unsafe fn close<P: SourcePlugin>(state: *mut c_void, open: *mut c_void) {
    guarded("plugin_close", (), || {
        let session = match StateContainer::from_raw_ref(open) {
            Ok(c) => c.context_as::<Mutex<P::Session>>(),
            Err(e) => {
                warn!(plugin = P::NAME, error = %e, "close on invalid open state");
                return;
            }
        };
        if let Err(e) = StateContainer::destroy(open) {
            warn!(plugin = P::NAME, error = %e, "freeing open state");
        }

        match (instance::<P>(state), session) {
            (Ok(instance), Some(session)) => instance.plugin().close(&mut session.lock()),
            (Err(e), _) => warn!(plugin = P::NAME, error = %e, "close on invalid state"),
            (_, None) => warn!(plugin = P::NAME, "open state carried no session"),
        }
        debug!(plugin = P::NAME, "session closed");
    })
}

/// `plugin_next`: one event, as a host-owned array of length one.
///
/// # Safety
/// `state`/`open` must be live; `evt` must be writable.
pub unsafe fn next<P: SourcePlugin>(
    state: *mut c_void,
    open: *mut c_void,
    evt: *mut *mut ss_plugin_event,
) -> i32 {
    if evt.is_null() {
        return ReturnCode::Failure.as_raw();
    }
    *evt = ptr::null_mut();

    guarded("plugin_next", ReturnCode::Failure.as_raw(), || {
        let instance = match instance::<P>(state) {
            Ok(i) => i,
            Err(e) => {
                error!(plugin = P::NAME, error = %e, "next on invalid state");
                return e.return_code().as_raw();
            }
        };

        let produced = session_batch(open)
            .and_then(|batch| batch.request_next())
            .and_then(|event| marshal(std::slice::from_ref(&event)));
        match produced {
            Ok(array) => {
                *evt = array.into_raw().0;
                ReturnCode::Success.as_raw()
            }
            Err(e) => report(&instance, e),
        }
    })
}

/// `plugin_next_batch`: up to the plugin's batch size of events.
///
/// # Safety
/// `state`/`open` must be live; `nevts` and `evts` must be writable.
pub unsafe fn next_batch<P: SourcePlugin>(
    state: *mut c_void,
    open: *mut c_void,
    nevts: *mut u32,
    evts: *mut *mut ss_plugin_event,
) -> i32 {
    if nevts.is_null() || evts.is_null() {
        return ReturnCode::Failure.as_raw();
    }
    *nevts = 0;
    *evts = ptr::null_mut();

    guarded("plugin_next_batch", ReturnCode::Failure.as_raw(), || {
        let instance = match instance::<P>(state) {
            Ok(i) => i,
            Err(e) => {
                error!(plugin = P::NAME, error = %e, "next_batch on invalid state");
                return e.return_code().as_raw();
            }
        };

        let max = instance.plugin().max_batch_events().min(MAX_NEXT_BATCH_EVENTS);
        let batch = match session_batch(open).and_then(|b| b.request_batch(max)) {
            Ok(batch) => batch,
            Err(e) => return report(&instance, e),
        };

        let BatchResult { events, rc, error } = batch;
        if !rc.is_success() {
            return match error {
                Some(e) => report(&instance, e),
                None => rc.as_raw(),
            };
        }
        if let Some(e) = error {
            debug!(plugin = P::NAME, produced = events.len(), %e, "batch ended early");
            report(&instance, e);
        }

        match marshal(&events) {
            Ok(array) => {
                let (records, len) = array.into_raw();
                *evts = records;
                *nevts = len;
                ReturnCode::Success.as_raw()
            }
            Err(e) => report(&instance, e),
        }
    })
}

/// `plugin_event_to_string`. The text lives in a per-thread buffer of the
/// plugin instance and stays valid until the same thread calls again.
///
/// # Safety
/// `state` must be live; `data` valid for `datalen` bytes or null.
pub unsafe fn event_to_string<P: SourcePlugin>(
    state: *mut c_void,
    data: *const u8,
    datalen: u32,
) -> *const c_char {
    guarded("plugin_event_to_string", ptr::null(), || {
        let Ok(container) = StateContainer::from_raw_ref(state) else {
            return ptr::null();
        };
        let Some(instance) = container.context_as::<PluginInstance<P>>() else {
            return ptr::null();
        };

        let text = instance
            .plugin()
            .event_to_string(native::borrow_bytes(data, datalen));
        instance.render(container.registry(), &text)
    })
}

/// `plugin_register_async_extractor`: start a worker serving the host block.
///
/// # Safety
/// `state` must be live. `info` must stay valid until its `cb_wait` returns
/// `false`, and the host must only touch it while the worker is parked.
pub unsafe fn register_async_extractor<P: ExtractorPlugin>(
    state: *mut c_void,
    info: *mut AsyncExtractorInfo,
) -> i32 {
    guarded(
        "plugin_register_async_extractor",
        ReturnCode::Failure.as_raw(),
        || {
            let instance = match instance::<P>(state) {
                Ok(i) => i,
                Err(e) => {
                    error!(plugin = P::NAME, error = %e, "register on invalid state");
                    return e.return_code().as_raw();
                }
            };

            let for_str = Arc::clone(&instance);
            let for_u64 = Arc::clone(&instance);
            let extractor = AsyncExtractor::new()
                .with_string(move |req| for_str.plugin().extract_str(req))
                .with_u64(move |req| for_u64.plugin().extract_u64(req));

            match extractor.spawn(info) {
                Ok(handle) => {
                    instance.track_extractor(handle);
                    info!(plugin = P::NAME, "async extractor registered");
                    ReturnCode::Success.as_raw()
                }
                Err(e) => report(&instance, e),
            }
        },
    )
}

unsafe fn sync_request<'a>(
    kind: FieldKind,
    evtnum: u64,
    field: *const c_char,
    arg: *const c_char,
    data: *const u8,
    datalen: u32,
) -> Result<ExtractionRequest<'a>, BridgeError> {
    Ok(ExtractionRequest {
        kind,
        field: native::borrow_str(field)?,
        arg: native::borrow_str(arg)?,
        data: native::borrow_bytes(data, datalen),
        evtnum,
        ts: 0,
    })
}

/// `plugin_extract_str`: synchronous string extraction.
///
/// Returns a `malloc`-ed string the host must free, or null when the field is
/// absent or the extraction failed (see `plugin_get_last_error`).
///
/// # Safety
/// `state` must be live; `field`/`arg` null or NUL-terminated; `data` valid
/// for `datalen` bytes or null.
pub unsafe fn extract_str<P: ExtractorPlugin>(
    state: *mut c_void,
    evtnum: u64,
    field: *const c_char,
    arg: *const c_char,
    data: *const u8,
    datalen: u32,
) -> *mut c_char {
    guarded("plugin_extract_str", ptr::null_mut(), || {
        let Ok(instance) = instance::<P>(state) else {
            return ptr::null_mut();
        };
        let value = sync_request(FieldKind::String, evtnum, field, arg, data, datalen)
            .and_then(|req| instance.plugin().extract_str(&req))
            .and_then(|v| v.map(|s| native::alloc_cstring(&s)).transpose());
        match value {
            Ok(Some(p)) => p.as_ptr(),
            Ok(None) => ptr::null_mut(),
            Err(e) => {
                report(&instance, e);
                ptr::null_mut()
            }
        }
    })
}

/// `plugin_extract_u64`: synchronous numeric extraction. `*field_present` is
/// 1 only when a value was produced.
///
/// # Safety
/// As for [`extract_str`], and `field_present` must be null or writable.
pub unsafe fn extract_u64<P: ExtractorPlugin>(
    state: *mut c_void,
    evtnum: u64,
    field: *const c_char,
    arg: *const c_char,
    data: *const u8,
    datalen: u32,
    field_present: *mut u32,
) -> u64 {
    if !field_present.is_null() {
        *field_present = 0;
    }

    guarded("plugin_extract_u64", 0, || {
        let Ok(instance) = instance::<P>(state) else {
            return 0;
        };
        let value = sync_request(FieldKind::Uint64, evtnum, field, arg, data, datalen)
            .and_then(|req| instance.plugin().extract_u64(&req));
        match value {
            Ok(Some(v)) => {
                if !field_present.is_null() {
                    *field_present = 1;
                }
                v
            }
            Ok(None) => 0,
            Err(e) => {
                report(&instance, e);
                0
            }
        }
    })
}
