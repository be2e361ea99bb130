use std::ffi::{c_char, CStr, CString};
use std::ptr;

use anyhow::{bail, Context};
use sinsp_bridge::{AsyncHostChannel, ExtractedValue, NativeEventArray};
use sinsp_plugin_sdk::*;

struct Ticker {
    prefix: String,
}

impl Plugin for Ticker {
    const NAME: &'static str = "ticker";
    const DESCRIPTION: &'static str = "counts down and emits one event per tick";
    const CONTACT: &'static str = "https://example.invalid/ticker";
    const VERSION: &'static str = "0.3.0";

    fn init(config: &str) -> Result<Self> {
        if config == "fail" {
            bail!("bad config");
        }
        let prefix = if config.is_empty() { "t" } else { config };
        Ok(Ticker {
            prefix: prefix.to_string(),
        })
    }
}

struct Countdown {
    remaining: u64,
    /// Fail instead of reaching EOF.
    breaks: bool,
}

impl SourcePlugin for Ticker {
    const ID: u32 = 999;
    const EVENT_SOURCE: &'static str = "ticker";
    type Session = Countdown;

    /// `"N"` ticks N times then reports EOF; `"N!"` fails after N ticks.
    fn open(&self, params: &str) -> Result<Countdown> {
        let (count, breaks) = match params.strip_suffix('!') {
            Some(count) => (count, true),
            None => (params, false),
        };
        Ok(Countdown {
            remaining: count.parse().context("params must be a tick count")?,
            breaks,
        })
    }

    fn next_event(&self, session: &mut Countdown) -> std::result::Result<PluginEvent, BridgeError> {
        if session.remaining == 0 {
            return Err(if session.breaks {
                BridgeError::Plugin(anyhow::anyhow!("tick source lost its clock"))
            } else {
                BridgeError::Eof
            });
        }
        session.remaining -= 1;
        Ok(PluginEvent::new(
            format!("{}{}", self.prefix, session.remaining),
            session.remaining,
        ))
    }

    fn event_to_string(&self, data: &[u8]) -> String {
        format!("tick={}", String::from_utf8_lossy(data))
    }
}

impl ExtractorPlugin for Ticker {
    fn fields() -> Vec<FieldEntry> {
        vec![
            FieldEntry::new(FieldKind::String, "ticker.payload", "raw payload"),
            FieldEntry::new(FieldKind::Uint64, "ticker.len", "payload length"),
        ]
    }

    fn extract_str(
        &self,
        req: &ExtractionRequest<'_>,
    ) -> std::result::Result<Option<String>, BridgeError> {
        match req.field {
            "ticker.payload" => Ok(Some(String::from_utf8_lossy(req.data).into_owned())),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }

    fn extract_u64(&self, req: &ExtractionRequest<'_>) -> std::result::Result<Option<u64>, BridgeError> {
        match req.field {
            "ticker.len" => Ok(Some(req.data.len() as u64)),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }
}

declare_plugin!(source + extractor: Ticker);

fn text(p: *const c_char) -> String {
    assert!(!p.is_null());
    unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
}

fn init_ok(config: &str) -> *mut std::ffi::c_void {
    let config = CString::new(config).unwrap();
    let mut rc = -99;
    let state = unsafe { plugin_init(config.as_ptr(), &mut rc) };
    assert_eq!(rc, 0);
    assert!(!state.is_null());
    state
}

fn open_ok(state: *mut std::ffi::c_void, params: &str) -> *mut std::ffi::c_void {
    let params = CString::new(params).unwrap();
    let mut rc = -99;
    let open = unsafe { plugin_open(state, params.as_ptr(), &mut rc) };
    assert_eq!(rc, 0);
    assert!(!open.is_null());
    open
}

#[test]
fn test_introspection() {
    assert_eq!(text(plugin_get_required_api_version()), "1.0.0");
    assert_eq!(text(plugin_get_name()), "ticker");
    assert_eq!(text(plugin_get_version()), "0.3.0");
    assert_eq!(text(plugin_get_event_source()), "ticker");
    assert_eq!(plugin_get_type(), PluginType::Source as u32);
    assert_eq!(plugin_get_id(), 999);
    // Cached: the same pointer every time.
    assert_eq!(plugin_get_name(), plugin_get_name());

    let fields: Vec<FieldEntry> = serde_json::from_str(&text(plugin_get_fields())).unwrap();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[1].name, "ticker.len");
    assert_eq!(text(plugin_get_extract_event_sources()), "[]");
}

#[test]
fn test_init_failure_reports_through_null_state() {
    let config = CString::new("fail").unwrap();
    let mut rc = -99;
    let state = unsafe { plugin_init(config.as_ptr(), &mut rc) };
    assert!(state.is_null());
    assert_eq!(rc, ReturnCode::Failure.as_raw());

    let msg = text(unsafe { plugin_get_last_error(ptr::null_mut()) });
    assert!(msg.contains("bad config"), "{msg}");
}

#[test]
fn test_session_batches_until_eof() {
    let state = init_ok("t");
    let open = open_ok(state, "3");

    let mut n = 0u32;
    let mut evts = ptr::null_mut();
    let rc = unsafe { plugin_next_batch(state, open, &mut n, &mut evts) };
    assert_eq!(rc, 0);
    assert_eq!(n, 3);

    let array = unsafe { NativeEventArray::from_raw(evts, n) };
    assert_eq!(array.payload(0).unwrap(), b"t2");
    assert_eq!(array.payload(2).unwrap(), b"t0");
    assert_eq!(array.records()[0].ts, 2);
    drop(array);

    let rc = unsafe { plugin_next_batch(state, open, &mut n, &mut evts) };
    assert_eq!(rc, ReturnCode::Eof.as_raw());
    assert_eq!(n, 0);
    assert!(evts.is_null());
    // EOF is not a failure worth recording.
    assert!(unsafe { plugin_get_last_error(state) }.is_null());

    unsafe {
        plugin_close(state, open);
        plugin_destroy(state);
    }
}

#[test]
fn test_failure_mid_batch_keeps_message() {
    let state = init_ok("t");
    let open = open_ok(state, "2!");

    let mut n = 0u32;
    let mut evts = ptr::null_mut();
    let rc = unsafe { plugin_next_batch(state, open, &mut n, &mut evts) };
    assert_eq!(rc, 0);
    assert_eq!(n, 2);
    drop(unsafe { NativeEventArray::from_raw(evts, n) });
    let msg = text(unsafe { plugin_get_last_error(state) });
    assert!(msg.contains("tick source lost its clock"), "{msg}");

    let rc = unsafe { plugin_next_batch(state, open, &mut n, &mut evts) };
    assert_eq!(rc, ReturnCode::Failure.as_raw());
    assert_eq!(n, 0);
    let msg = text(unsafe { plugin_get_last_error(state) });
    assert!(msg.contains("tick source lost its clock"), "{msg}");

    let mut evt = ptr::null_mut();
    assert_eq!(
        unsafe { plugin_next(state, open, &mut evt) },
        ReturnCode::Failure.as_raw()
    );
    let msg = text(unsafe { plugin_get_last_error(state) });
    assert!(msg.contains("tick source lost its clock"), "{msg}");

    unsafe {
        plugin_close(state, open);
        plugin_destroy(state);
    }
}

#[test]
fn test_single_next() {
    let state = init_ok("");
    let open = open_ok(state, "1");

    let mut evt = ptr::null_mut();
    assert_eq!(unsafe { plugin_next(state, open, &mut evt) }, 0);
    let array = unsafe { NativeEventArray::from_raw(evt, 1) };
    assert_eq!(array.payload(0).unwrap(), b"t0");
    drop(array);

    assert_eq!(
        unsafe { plugin_next(state, open, &mut evt) },
        ReturnCode::Eof.as_raw()
    );
    assert!(evt.is_null());

    unsafe {
        plugin_close(state, open);
        plugin_destroy(state);
    }
}

#[test]
fn test_open_failure_sets_last_error() {
    let state = init_ok("t");
    let params = CString::new("many").unwrap();
    let mut rc = -99;
    let open = unsafe { plugin_open(state, params.as_ptr(), &mut rc) };
    assert!(open.is_null());
    assert_eq!(rc, ReturnCode::Failure.as_raw());

    let msg = text(unsafe { plugin_get_last_error(state) });
    assert!(msg.contains("opening session"), "{msg}");
    unsafe { plugin_destroy(state) };
}

#[test]
fn test_event_to_string_uses_state_buffer() {
    let state = init_ok("t");
    let data = b"abc";
    let s = text(unsafe { plugin_event_to_string(state, data.as_ptr(), 3) });
    assert_eq!(s, "tick=abc");
    let s = text(unsafe { plugin_event_to_string(state, ptr::null(), 0) });
    assert_eq!(s, "tick=");
    unsafe { plugin_destroy(state) };
}

#[test]
fn test_event_to_string_concurrent_callers() {
    let state = init_ok("t");
    let shared = state as usize;

    let workers: Vec<_> = (0..4usize)
        .map(|worker| {
            std::thread::spawn(move || {
                let payload = "x".repeat(worker * 7 + 1);
                let expected = format!("tick={payload}");
                let mut mismatched = 0u32;
                for _ in 0..2_000 {
                    let p = unsafe {
                        plugin_event_to_string(
                            shared as *mut std::ffi::c_void,
                            payload.as_ptr(),
                            payload.len() as u32,
                        )
                    };
                    if text(p) != expected {
                        mismatched += 1;
                    }
                }
                mismatched
            })
        })
        .collect();

    let mismatched: u32 = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(mismatched, 0);
    unsafe { plugin_destroy(state) };
}

#[test]
fn test_sync_extraction() {
    let state = init_ok("t");
    let payload = b"hello";
    let len_field = CString::new("ticker.len").unwrap();
    let str_field = CString::new("ticker.payload").unwrap();
    let bogus = CString::new("ticker.bogus").unwrap();

    let mut present = 0u32;
    let v = unsafe {
        plugin_extract_u64(
            state,
            1,
            len_field.as_ptr(),
            ptr::null(),
            payload.as_ptr(),
            5,
            &mut present,
        )
    };
    assert_eq!((v, present), (5, 1));

    let s = unsafe {
        plugin_extract_str(state, 1, str_field.as_ptr(), ptr::null(), payload.as_ptr(), 5)
    };
    let s = unsafe { sinsp_bridge::native::take_cstring(s) };
    assert_eq!(s.as_deref(), Some("hello"));

    unsafe {
        plugin_extract_u64(
            state,
            1,
            bogus.as_ptr(),
            ptr::null(),
            payload.as_ptr(),
            5,
            &mut present,
        )
    };
    assert_eq!(present, 0);
    let msg = text(unsafe { plugin_get_last_error(state) });
    assert!(msg.contains("ticker.bogus"), "{msg}");

    unsafe { plugin_destroy(state) };
}

#[test]
fn test_async_extractor_round_trip() {
    let state = init_ok("t");
    let mut channel = AsyncHostChannel::new();
    assert_eq!(
        unsafe { plugin_register_async_extractor(state, channel.info_ptr()) },
        0
    );

    let req = ExtractionRequest {
        kind: FieldKind::String,
        field: "ticker.payload",
        arg: "",
        data: b"xyz",
        evtnum: 7,
        ts: 0,
    };
    let result = channel.submit(&req).unwrap();
    assert_eq!(result.value, Some(ExtractedValue::Str("xyz".into())));

    let result = channel
        .submit(&ExtractionRequest {
            kind: FieldKind::Uint64,
            field: "ticker.len",
            ..req
        })
        .unwrap();
    assert_eq!(result.value, Some(ExtractedValue::U64(3)));

    channel.shutdown();
    assert!(channel.wait_released(std::time::Duration::from_secs(5)));
    unsafe { plugin_destroy(state) };
}
