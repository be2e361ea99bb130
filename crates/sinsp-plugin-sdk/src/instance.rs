use std::collections::HashMap;
use std::ffi::{c_char, CString};
use std::fmt::Display;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use sinsp_bridge::{AsyncExtractorHandle, BridgeState, PointerRegistry, StateContainer};
use tracing::{debug, warn};

use crate::Plugin;

/// What the plugin-level state container carries as its context.
pub struct PluginInstance<P> {
    plugin: P,
    last_error: Mutex<Option<CString>>,
    extractors: Mutex<Vec<AsyncExtractorHandle>>,
    /// `event_to_string` output, one container per calling host thread.
    rendered: Mutex<HashMap<ThreadId, StateContainer>>,
}

impl<P: Plugin> PluginInstance<P> {
    pub fn new(plugin: P) -> Self {
        Self {
            plugin,
            last_error: Mutex::new(None),
            extractors: Mutex::new(Vec::new()),
            rendered: Mutex::new(HashMap::new()),
        }
    }

    pub fn plugin(&self) -> &P {
        &self.plugin
    }

    pub fn record_error(&self, err: impl Display) {
        *self.last_error.lock() = Some(to_cstring(&err.to_string()));
    }

    /// Message of the most recent failure, null if none.
    ///
    /// The pointer stays valid until the next recorded failure.
    pub fn last_error_ptr(&self) -> *const c_char {
        self.last_error
            .lock()
            .as_ref()
            .map_or(ptr::null(), |s| s.as_ptr())
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .as_ref()
            .map(|s| s.to_string_lossy().into_owned())
    }

    /// Store `text` NUL-terminated in the calling thread's render buffer.
    ///
    /// The pointer stays valid until the same thread renders again on this
    /// instance, whatever other threads do meanwhile.
    pub(crate) fn render(&self, registry: &Arc<PointerRegistry>, text: &str) -> *const c_char {
        let mut bytes: Vec<u8> = text.bytes().take_while(|&b| b != 0).collect();
        bytes.push(0);

        let mut rendered = self.rendered.lock();
        rendered
            .entry(thread::current().id())
            .or_insert_with(|| StateContainer::new(Arc::clone(registry)))
            .fill_buffer(&bytes)
            .cast()
    }

    pub(crate) fn track_extractor(&self, handle: AsyncExtractorHandle) {
        self.extractors.lock().push(handle);
    }

    /// Join extractor workers the host has released; returns how many are still parked.
    pub(crate) fn reap_extractors(&self) -> usize {
        let mut extractors = self.extractors.lock();
        let (finished, running): (Vec<_>, Vec<_>) = extractors
            .drain(..)
            .partition(|h| h.is_finished() || h.state() == BridgeState::Terminated);
        for handle in finished {
            match handle.join() {
                Ok(cycles) => debug!(cycles, "async extractor joined"),
                Err(e) => warn!(error = %e, "async extractor ended abnormally"),
            }
        }
        *extractors = running;
        extractors.len()
    }
}

/// Interior NULs are dropped so the message always fits in a C string.
pub(crate) fn to_cstring(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}
