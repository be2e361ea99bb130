//! One host run: init, open, pull batches, extract every field of every
//! event, then close and tear everything down in reverse order.

use std::ffi::{c_void, CString};
use std::io::Write;
use std::ptr;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use sinsp_bridge::native;
use sinsp_bridge::{
    AsyncHostChannel, ExtractedValue, ExtractionRequest, ExtractionResult, FieldEntry, FieldKind,
    NativeEventArray, ReturnCode,
};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::loader::{plugin_str, ExtractorApi, PluginApi, SourceApi};

/// An extra extractor library and the config string for its `plugin_init`.
#[derive(Debug, Clone, Copy)]
pub struct ExtractorLibrary<'a> {
    pub api: &'a PluginApi,
    pub init_config: &'a str,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub events: u64,
    pub values: u64,
    pub absent: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub eof: bool,
}

struct LoadedPlugin<'a> {
    api: &'a PluginApi,
    state: *mut c_void,
    name: String,
}

impl<'a> LoadedPlugin<'a> {
    fn init(api: &'a PluginApi, config: &str) -> Result<Self> {
        let name = api.name();
        let config = CString::new(config).context("init config contains a NUL byte")?;
        let mut rc = ReturnCode::Failure.as_raw();
        let state = unsafe { (api.init)(config.as_ptr(), &mut rc) };

        if rc != ReturnCode::Success.as_raw() || state.is_null() {
            let reason = unsafe { plugin_str((api.get_last_error)(state)) }
                .unwrap_or_else(|| "no error reported".to_string());
            if !state.is_null() {
                unsafe { (api.destroy)(state) };
            }
            bail!("{name}: plugin_init failed (rc {rc}): {reason}");
        }

        info!(plugin = %name, "plugin initialized");
        Ok(Self { api, state, name })
    }

    fn last_error(&self) -> String {
        unsafe { plugin_str((self.api.get_last_error)(self.state)) }
            .unwrap_or_else(|| "no error reported".to_string())
    }

    /// Identity of the current last-error string: its address and text.
    fn error_mark(&self) -> (usize, Option<String>) {
        let raw = unsafe { (self.api.get_last_error)(self.state) };
        (raw as usize, unsafe { plugin_str(raw) })
    }
}

impl Drop for LoadedPlugin<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.destroy)(self.state) };
        debug!(plugin = %self.name, "plugin destroyed");
    }
}

struct HostEvent {
    data: Vec<u8>,
    ts: u64,
}

enum Batch {
    Events(Vec<HostEvent>),
    Timeout,
    Eof,
}

struct OpenSession<'p, 'a> {
    plugin: &'p LoadedPlugin<'a>,
    api: SourceApi,
    open: *mut c_void,
}

impl<'p, 'a> OpenSession<'p, 'a> {
    fn open(plugin: &'p LoadedPlugin<'a>, api: SourceApi, params: &str) -> Result<Self> {
        let params = CString::new(params).context("open params contain a NUL byte")?;
        let mut rc = ReturnCode::Failure.as_raw();
        let open = unsafe { (api.open)(plugin.state, params.as_ptr(), &mut rc) };
        if rc != ReturnCode::Success.as_raw() || open.is_null() {
            bail!(
                "{}: plugin_open failed (rc {rc}): {}",
                plugin.name,
                plugin.last_error()
            );
        }
        Ok(Self { plugin, api, open })
    }

    fn next_batch(&self) -> Result<Batch> {
        let mut nevts = 0u32;
        let mut evts = ptr::null_mut();
        let rc = unsafe { (self.api.next_batch)(self.plugin.state, self.open, &mut nevts, &mut evts) };

        match ReturnCode::from_raw(rc) {
            Some(ReturnCode::Success) => {
                // Takes ownership of the host-bound block; freed when dropped.
                let array = unsafe { NativeEventArray::from_raw(evts, nevts) };
                let events = array
                    .records()
                    .iter()
                    .enumerate()
                    .map(|(idx, record)| HostEvent {
                        data: array.payload(idx).unwrap_or_default().to_vec(),
                        ts: record.ts,
                    })
                    .collect();
                Ok(Batch::Events(events))
            }
            Some(ReturnCode::Timeout) => Ok(Batch::Timeout),
            Some(ReturnCode::Eof) => Ok(Batch::Eof),
            _ => bail!(
                "{}: plugin_next_batch failed (rc {rc}): {}",
                self.plugin.name,
                self.plugin.last_error()
            ),
        }
    }

    fn event_to_string(&self, data: &[u8]) -> Option<String> {
        let len = u32::try_from(data.len()).ok()?;
        unsafe { plugin_str((self.api.event_to_string)(self.plugin.state, data.as_ptr(), len)) }
    }
}

impl Drop for OpenSession<'_, '_> {
    fn drop(&mut self) {
        unsafe { (self.api.close)(self.plugin.state, self.open) };
        debug!(plugin = %self.plugin.name, "session closed");
    }
}

/// How values are pulled out of one extractor instance.
struct Extraction<'p, 'a> {
    plugin: &'p LoadedPlugin<'a>,
    api: ExtractorApi,
    channel: Option<AsyncHostChannel>,
}

impl<'p, 'a> Extraction<'p, 'a> {
    fn new(plugin: &'p LoadedPlugin<'a>, api: ExtractorApi, prefer_async: bool) -> Result<Self> {
        let sync = api.extract_str.is_some() && api.extract_u64.is_some();
        let channel = match api.register_async_extractor {
            Some(register) if prefer_async || !sync => {
                let mut channel = AsyncHostChannel::new();
                let rc = unsafe { register(plugin.state, channel.info_ptr()) };
                if rc != ReturnCode::Success.as_raw() {
                    channel.registration_failed();
                    bail!(
                        "{}: plugin_register_async_extractor failed (rc {rc}): {}",
                        plugin.name,
                        plugin.last_error()
                    );
                }
                info!(plugin = %plugin.name, "async extractor registered");
                Some(channel)
            }
            _ => None,
        };
        Ok(Self {
            plugin,
            api,
            channel,
        })
    }

    fn extract(&mut self, req: &ExtractionRequest<'_>) -> Result<ExtractionResult> {
        if let Some(channel) = self.channel.as_mut() {
            return Ok(channel.submit(req)?);
        }

        let field = CString::new(req.field).context("field name contains a NUL byte")?;
        let arg = CString::new(req.arg).context("field argument contains a NUL byte")?;
        let datalen = u32::try_from(req.data.len()).context("event payload too large")?;
        let state = self.plugin.state;
        // The sync entry points carry no return code; an absent value is a
        // failure when the plugin recorded a new last error meanwhile.
        let mark = self.plugin.error_mark();

        let value = match req.kind {
            FieldKind::String => {
                let extract = self.api.extract_str.context("plugin_extract_str not exported")?;
                let raw = unsafe {
                    extract(state, req.evtnum, field.as_ptr(), arg.as_ptr(), req.data.as_ptr(), datalen)
                };
                unsafe { native::take_cstring(raw) }.map(ExtractedValue::Str)
            }
            FieldKind::Uint64 => {
                let extract = self.api.extract_u64.context("plugin_extract_u64 not exported")?;
                let mut present = 0u32;
                let v = unsafe {
                    extract(
                        state,
                        req.evtnum,
                        field.as_ptr(),
                        arg.as_ptr(),
                        req.data.as_ptr(),
                        datalen,
                        &mut present,
                    )
                };
                (present != 0).then_some(ExtractedValue::U64(v))
            }
        };
        let rc = if value.is_none() && self.plugin.error_mark() != mark {
            ReturnCode::Failure
        } else {
            ReturnCode::Success
        };
        Ok(ExtractionResult { rc, value })
    }
}

impl Drop for Extraction<'_, '_> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
            if !channel.wait_released(Duration::from_secs(1)) {
                warn!(plugin = %self.plugin.name, "async extractor did not leave cb_wait");
            }
        }
    }
}

struct FieldBinding<'p, 'a> {
    fields: Vec<(FieldEntry, FieldKind)>,
    extraction: Extraction<'p, 'a>,
}

fn bind<'p, 'a>(
    plugin: &'p LoadedPlugin<'a>,
    event_source: &str,
    config: &RunConfig,
) -> Result<Option<FieldBinding<'p, 'a>>> {
    let Some(api) = plugin.api.extractor else {
        return Ok(None);
    };

    let sources = plugin.api.extract_event_sources()?;
    if !sources.is_empty() && !sources.iter().any(|s| s == event_source) {
        info!(
            plugin = %plugin.name,
            event_source,
            "extractor does not accept this event source, skipping"
        );
        return Ok(None);
    }

    let mut fields = Vec::new();
    for field in plugin.api.fields()? {
        let Some(kind) = field.kind() else {
            warn!(plugin = %plugin.name, field = %field.name, ty = %field.field_type, "unsupported field type");
            continue;
        };
        if field.arg_required && !config.run.field_args.contains_key(&field.name) {
            debug!(field = %field.name, "no argument configured for field, skipping");
            continue;
        }
        fields.push((field, kind));
    }

    let extraction = Extraction::new(plugin, api, config.run.async_extraction)?;
    Ok(Some(FieldBinding { fields, extraction }))
}

/// Drive `source` (and any extra extractors) through one full run, writing
/// one JSON line per extracted value to `out`.
pub fn run(
    source: &PluginApi,
    extractors: &[ExtractorLibrary<'_>],
    config: &RunConfig,
    out: &mut dyn Write,
) -> Result<RunSummary> {
    let source_api = source
        .source
        .with_context(|| format!("{} is not a source plugin", source.name()))?;
    let event_source = unsafe { plugin_str((source_api.get_event_source)()) }.unwrap_or_default();

    let source_plugin = LoadedPlugin::init(source, &config.source.init_config)?;
    let extra_plugins = extractors
        .iter()
        .map(|x| LoadedPlugin::init(x.api, x.init_config))
        .collect::<Result<Vec<_>>>()?;

    let mut bindings = Vec::new();
    for plugin in std::iter::once(&source_plugin).chain(extra_plugins.iter()) {
        if let Some(binding) = bind(plugin, &event_source, config)? {
            bindings.push(binding);
        }
    }

    let session = OpenSession::open(&source_plugin, source_api, &config.source.open_params)?;
    info!(plugin = %source_plugin.name, event_source = %event_source, "session opened");

    let limits = &config.run;
    let mut summary = RunSummary::default();
    let mut consecutive_timeouts = 0u32;

    'run: while summary.events < limits.max_events {
        let events = match session.next_batch()? {
            Batch::Events(events) => events,
            Batch::Eof => {
                summary.eof = true;
                break;
            }
            Batch::Timeout => {
                summary.timeouts += 1;
                consecutive_timeouts += 1;
                if consecutive_timeouts > limits.max_timeouts {
                    warn!(consecutive_timeouts, "giving up after repeated timeouts");
                    break;
                }
                thread::sleep(Duration::from_millis(limits.timeout_backoff_ms));
                continue;
            }
        };
        consecutive_timeouts = 0;

        for event in events {
            if summary.events >= limits.max_events {
                break 'run;
            }
            summary.events += 1;
            let evtnum = summary.events;

            if limits.print_events {
                let text = session.event_to_string(&event.data);
                writeln!(out, "{}", json!({ "evtnum": evtnum, "ts": event.ts, "event": text }))?;
            }

            for binding in bindings.iter_mut() {
                for (field, kind) in &binding.fields {
                    let arg = limits.field_args.get(&field.name).map_or("", String::as_str);
                    let req = ExtractionRequest {
                        kind: *kind,
                        field: &field.name,
                        arg,
                        data: &event.data,
                        evtnum,
                        ts: event.ts,
                    };
                    let plugin = binding.extraction.plugin;
                    let result = binding.extraction.extract(&req)?;

                    if !result.rc.is_success() {
                        summary.failed += 1;
                        warn!(
                            plugin = %plugin.name,
                            field = %field.name,
                            rc = result.rc.as_raw(),
                            error = %plugin.last_error(),
                            "extraction failed"
                        );
                        continue;
                    }
                    let value = match result.value {
                        Some(ExtractedValue::Str(s)) => json!(s),
                        Some(ExtractedValue::U64(v)) => json!(v),
                        None => {
                            summary.absent += 1;
                            continue;
                        }
                    };
                    summary.values += 1;
                    writeln!(
                        out,
                        "{}",
                        json!({
                            "evtnum": evtnum,
                            "ts": event.ts,
                            "plugin": plugin.name,
                            "field": field.name,
                            "value": value,
                        })
                    )?;
                }
            }
        }
    }

    drop(session);
    drop(bindings);
    info!(
        events = summary.events,
        values = summary.values,
        absent = summary.absent,
        failed = summary.failed,
        eof = summary.eof,
        "run complete"
    );
    Ok(summary)
}
