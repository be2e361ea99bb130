//! sinsp Plugin SDK
//!
//! Plugin authors implement [`Plugin`] plus [`SourcePlugin`] and/or
//! [`ExtractorPlugin`], then export the C entry points with [`declare_plugin!`].
//! Everything that crosses the boundary (state containers, event arrays,
//! async extraction, per-session dispatch) is handled by `sinsp-bridge`.

pub mod entry;
mod instance;

pub use anyhow::Result;
pub use instance::PluginInstance;
pub use sinsp_bridge::{
    BridgeError, ExtractionRequest, FieldEntry, FieldKind, PluginEvent, PluginType, ReturnCode,
    MAX_NEXT_BATCH_EVENTS, REQUIRED_API_VERSION,
};

/// Identity and lifecycle shared by every plugin.
pub trait Plugin: Send + Sync + Sized + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    const CONTACT: &'static str;
    /// Plugin version (semver)
    const VERSION: &'static str;
    const REQUIRED_API_VERSION: &'static str = REQUIRED_API_VERSION;

    /// Build the plugin from the host's opaque config string.
    fn init(config: &str) -> Result<Self>;

    /// Called once from `plugin_destroy`, before the state is freed.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// A plugin producing events for one event source.
pub trait SourcePlugin: Plugin {
    const ID: u32;
    const EVENT_SOURCE: &'static str;

    /// Per-open session state. Lives behind a mutex shared with the session worker.
    type Session: Send + 'static;

    fn open(&self, params: &str) -> Result<Self::Session>;

    /// Called from `plugin_close` after the session worker has stopped.
    fn close(&self, _session: &mut Self::Session) {}

    /// Produce the next event. Runs on the session's dispatch thread.
    fn next_event(&self, session: &mut Self::Session) -> Result<PluginEvent, BridgeError>;

    fn event_to_string(&self, data: &[u8]) -> String {
        String::from_utf8_lossy(data).into_owned()
    }

    fn max_batch_events(&self) -> usize {
        MAX_NEXT_BATCH_EVENTS
    }
}

/// A plugin extracting field values from events.
pub trait ExtractorPlugin: Plugin {
    fn fields() -> Vec<FieldEntry>;

    /// Sources this plugin can extract from; empty means any compatible source.
    fn extract_event_sources() -> Vec<String> {
        Vec::new()
    }

    fn extract_str(&self, req: &ExtractionRequest<'_>) -> Result<Option<String>, BridgeError> {
        Err(BridgeError::Unsupported(req.field.to_string()))
    }

    fn extract_u64(&self, req: &ExtractionRequest<'_>) -> Result<Option<u64>, BridgeError> {
        Err(BridgeError::Unsupported(req.field.to_string()))
    }
}

/// Export the C entry points for a plugin type. Use in a `cdylib` crate:
/// ```ignore
/// use sinsp_plugin_sdk::*;
///
/// struct MyPlugin;
/// impl Plugin for MyPlugin { ... }
/// impl SourcePlugin for MyPlugin { ... }
///
/// declare_plugin!(source: MyPlugin);
/// ```
/// Forms: `source: T`, `extractor: T`, `source + extractor: T`.
#[macro_export]
macro_rules! declare_plugin {
    (source: $plugin:ty) => {
        $crate::declare_plugin!(@common $plugin, $crate::PluginType::Source);
        $crate::declare_plugin!(@source $plugin);
    };
    (extractor: $plugin:ty) => {
        $crate::declare_plugin!(@common $plugin, $crate::PluginType::Extractor);
        $crate::declare_plugin!(@extractor $plugin);
    };
    (source + extractor: $plugin:ty) => {
        $crate::declare_plugin!(@common $plugin, $crate::PluginType::Source);
        $crate::declare_plugin!(@source $plugin);
        $crate::declare_plugin!(@extractor $plugin);
    };

    (@common $plugin:ty, $kind:expr) => {
        #[no_mangle]
        pub extern "C" fn plugin_get_required_api_version() -> *const ::std::ffi::c_char {
            static CELL: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            $crate::entry::cached(&CELL, || {
                <$plugin as $crate::Plugin>::REQUIRED_API_VERSION.to_string()
            })
        }

        #[no_mangle]
        pub extern "C" fn plugin_get_type() -> u32 {
            $kind as u32
        }

        #[no_mangle]
        pub extern "C" fn plugin_get_name() -> *const ::std::ffi::c_char {
            static CELL: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            $crate::entry::cached(&CELL, || <$plugin as $crate::Plugin>::NAME.to_string())
        }

        #[no_mangle]
        pub extern "C" fn plugin_get_description() -> *const ::std::ffi::c_char {
            static CELL: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            $crate::entry::cached(&CELL, || <$plugin as $crate::Plugin>::DESCRIPTION.to_string())
        }

        #[no_mangle]
        pub extern "C" fn plugin_get_contact() -> *const ::std::ffi::c_char {
            static CELL: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            $crate::entry::cached(&CELL, || <$plugin as $crate::Plugin>::CONTACT.to_string())
        }

        #[no_mangle]
        pub extern "C" fn plugin_get_version() -> *const ::std::ffi::c_char {
            static CELL: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            $crate::entry::cached(&CELL, || <$plugin as $crate::Plugin>::VERSION.to_string())
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_init(
            config: *const ::std::ffi::c_char,
            rc: *mut i32,
        ) -> *mut ::std::ffi::c_void {
            $crate::entry::init::<$plugin>(config, rc)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_destroy(state: *mut ::std::ffi::c_void) {
            $crate::entry::destroy::<$plugin>(state)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_get_last_error(
            state: *mut ::std::ffi::c_void,
        ) -> *const ::std::ffi::c_char {
            $crate::entry::get_last_error::<$plugin>(state)
        }
    };

    (@source $plugin:ty) => {
        #[no_mangle]
        pub extern "C" fn plugin_get_id() -> u32 {
            <$plugin as $crate::SourcePlugin>::ID
        }

        #[no_mangle]
        pub extern "C" fn plugin_get_event_source() -> *const ::std::ffi::c_char {
            static CELL: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            $crate::entry::cached(&CELL, || {
                <$plugin as $crate::SourcePlugin>::EVENT_SOURCE.to_string()
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_open(
            state: *mut ::std::ffi::c_void,
            params: *const ::std::ffi::c_char,
            rc: *mut i32,
        ) -> *mut ::std::ffi::c_void {
            $crate::entry::open::<$plugin>(state, params, rc)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_close(
            state: *mut ::std::ffi::c_void,
            open: *mut ::std::ffi::c_void,
        ) {
            $crate::entry::close::<$plugin>(state, open)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_next(
            state: *mut ::std::ffi::c_void,
            open: *mut ::std::ffi::c_void,
            evt: *mut *mut $crate::entry::ss_plugin_event,
        ) -> i32 {
            $crate::entry::next::<$plugin>(state, open, evt)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_next_batch(
            state: *mut ::std::ffi::c_void,
            open: *mut ::std::ffi::c_void,
            nevts: *mut u32,
            evts: *mut *mut $crate::entry::ss_plugin_event,
        ) -> i32 {
            $crate::entry::next_batch::<$plugin>(state, open, nevts, evts)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_event_to_string(
            state: *mut ::std::ffi::c_void,
            data: *const u8,
            datalen: u32,
        ) -> *const ::std::ffi::c_char {
            $crate::entry::event_to_string::<$plugin>(state, data, datalen)
        }
    };

    (@extractor $plugin:ty) => {
        #[no_mangle]
        pub extern "C" fn plugin_get_fields() -> *const ::std::ffi::c_char {
            static CELL: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            $crate::entry::cached(&CELL, $crate::entry::fields_json::<$plugin>)
        }

        #[no_mangle]
        pub extern "C" fn plugin_get_extract_event_sources() -> *const ::std::ffi::c_char {
            static CELL: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            $crate::entry::cached(&CELL, $crate::entry::extract_sources_json::<$plugin>)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_register_async_extractor(
            state: *mut ::std::ffi::c_void,
            info: *mut $crate::entry::AsyncExtractorInfo,
        ) -> i32 {
            $crate::entry::register_async_extractor::<$plugin>(state, info)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_extract_str(
            state: *mut ::std::ffi::c_void,
            evtnum: u64,
            field: *const ::std::ffi::c_char,
            arg: *const ::std::ffi::c_char,
            data: *const u8,
            datalen: u32,
        ) -> *mut ::std::ffi::c_char {
            $crate::entry::extract_str::<$plugin>(state, evtnum, field, arg, data, datalen)
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_extract_u64(
            state: *mut ::std::ffi::c_void,
            evtnum: u64,
            field: *const ::std::ffi::c_char,
            arg: *const ::std::ffi::c_char,
            data: *const u8,
            datalen: u32,
            field_present: *mut u32,
        ) -> u64 {
            $crate::entry::extract_u64::<$plugin>(
                state,
                evtnum,
                field,
                arg,
                data,
                datalen,
                field_present,
            )
        }
    };
}
