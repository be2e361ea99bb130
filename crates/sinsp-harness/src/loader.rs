//! Resolving a plugin's entry points from a shared library via libloading.

use std::ffi::{c_char, CStr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use libloading::Library;
use serde::Serialize;
use sinsp_bridge::abi::symbols::*;
use sinsp_bridge::{FieldEntry, PluginType, REQUIRED_API_VERSION};

/// Entry points every plugin exports.
#[derive(Debug, Clone, Copy)]
pub struct PluginApi {
    pub get_required_api_version: GetStrFn,
    pub get_type: GetU32Fn,
    pub get_name: GetStrFn,
    pub get_description: GetStrFn,
    pub get_contact: GetStrFn,
    pub get_version: GetStrFn,
    pub init: InitFn,
    pub destroy: DestroyFn,
    pub get_last_error: GetLastErrorFn,
    pub source: Option<SourceApi>,
    pub extractor: Option<ExtractorApi>,
}

/// Entry points of a source plugin.
#[derive(Debug, Clone, Copy)]
pub struct SourceApi {
    pub get_id: GetU32Fn,
    pub get_event_source: GetStrFn,
    pub open: OpenFn,
    pub close: CloseFn,
    pub next: NextFn,
    pub next_batch: NextBatchFn,
    pub event_to_string: EventToStringFn,
}

/// Entry points of an extractor. At least one extraction path is present.
#[derive(Debug, Clone, Copy)]
pub struct ExtractorApi {
    pub get_fields: GetStrFn,
    pub get_extract_event_sources: Option<GetStrFn>,
    pub register_async_extractor: Option<RegisterAsyncFn>,
    pub extract_str: Option<ExtractStrFn>,
    pub extract_u64: Option<ExtractU64Fn>,
}

/// Copy a plugin-owned string out. Null maps to `None`.
///
/// # Safety
/// `ptr` must be null or a NUL-terminated string valid for the call.
pub unsafe fn plugin_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

/// Accept any plugin whose required API shares our major version.
pub fn check_api_version(required: &str) -> Result<()> {
    let major = |v: &str| v.split('.').next().and_then(|m| m.parse::<u32>().ok());
    match (major(required), major(REQUIRED_API_VERSION)) {
        (Some(wanted), Some(ours)) if wanted == ours => Ok(()),
        _ => bail!("plugin requires API version {required}, host implements {REQUIRED_API_VERSION}"),
    }
}

impl PluginApi {
    pub fn plugin_type(&self) -> Option<PluginType> {
        PluginType::from_raw(unsafe { (self.get_type)() })
    }

    pub fn name(&self) -> String {
        unsafe { plugin_str((self.get_name)()) }.unwrap_or_default()
    }

    pub fn required_api_version(&self) -> String {
        unsafe { plugin_str((self.get_required_api_version)()) }.unwrap_or_default()
    }

    /// Check the required API version and that the exported entry points
    /// match the declared plugin type.
    pub fn validate(&self) -> Result<()> {
        check_api_version(&self.required_api_version())?;
        match self.plugin_type() {
            Some(PluginType::Source) if self.source.is_none() => {
                bail!("{} declares a source plugin but lacks source entry points", self.name())
            }
            Some(PluginType::Extractor) if self.extractor.is_none() => {
                bail!("{} declares an extractor but lacks plugin_get_fields", self.name())
            }
            Some(_) => Ok(()),
            None => bail!("{} reports an unknown plugin type", self.name()),
        }
    }

    /// Field descriptors, empty for plugins that extract nothing.
    pub fn fields(&self) -> Result<Vec<FieldEntry>> {
        let Some(extractor) = self.extractor else {
            return Ok(Vec::new());
        };
        let json = unsafe { plugin_str((extractor.get_fields)()) }
            .context("plugin_get_fields returned null")?;
        serde_json::from_str(&json).context("parsing plugin_get_fields JSON")
    }

    /// Event sources this extractor accepts; empty means any.
    pub fn extract_event_sources(&self) -> Result<Vec<String>> {
        let Some(get) = self.extractor.and_then(|x| x.get_extract_event_sources) else {
            return Ok(Vec::new());
        };
        match unsafe { plugin_str(get()) } {
            Some(json) => {
                serde_json::from_str(&json).context("parsing plugin_get_extract_event_sources JSON")
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn describe(&self) -> Result<PluginInfo> {
        unsafe {
            Ok(PluginInfo {
                name: self.name(),
                description: plugin_str((self.get_description)()).unwrap_or_default(),
                contact: plugin_str((self.get_contact)()).unwrap_or_default(),
                version: plugin_str((self.get_version)()).unwrap_or_default(),
                required_api_version: self.required_api_version(),
                plugin_type: (self.get_type)(),
                id: self.source.map(|s| (s.get_id)()),
                event_source: self.source.and_then(|s| plugin_str((s.get_event_source)())),
                extract_event_sources: self.extract_event_sources()?,
                fields: self.fields()?,
            })
        }
    }
}

/// Identity and capabilities reported by `inspect`.
#[derive(Debug, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub contact: String,
    pub version: String,
    pub required_api_version: String,
    pub plugin_type: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_source: Option<String>,
    pub extract_event_sources: Vec<String>,
    pub fields: Vec<FieldEntry>,
}

/// A loaded plugin library and its resolved entry points.
///
/// The function pointers in `api` are only valid while `_library` is alive.
pub struct PluginLibrary {
    api: PluginApi,
    path: PathBuf,
    _library: Library,
}

impl std::fmt::Debug for PluginLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLibrary")
            .field("path", &self.path)
            .finish()
    }
}

impl PluginLibrary {
    /// Load a plugin from a shared library path (.so/.dylib) and resolve its symbols.
    pub fn load(path: &Path) -> Result<Self> {
        let library = unsafe { Library::new(path) }
            .with_context(|| format!("Failed to load library: {}", path.display()))?;
        let api = unsafe { resolve(&library) }
            .with_context(|| format!("Failed to resolve plugin symbols in {}", path.display()))?;
        api.validate()?;

        tracing::info!(
            path = %path.display(),
            plugin = %api.name(),
            "plugin library loaded"
        );
        Ok(Self {
            api,
            path: path.to_path_buf(),
            _library: library,
        })
    }

    pub fn api(&self) -> &PluginApi {
        &self.api
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

unsafe fn required<T: Copy>(lib: &Library, name: &str) -> Result<T> {
    let symbol = lib
        .get::<T>(name.as_bytes())
        .with_context(|| format!("Symbol {name} not found"))?;
    Ok(*symbol)
}

unsafe fn optional<T: Copy>(lib: &Library, name: &str) -> Option<T> {
    lib.get::<T>(name.as_bytes()).ok().map(|s| *s)
}

unsafe fn resolve(lib: &Library) -> Result<PluginApi> {
    let source = match optional::<OpenFn>(lib, "plugin_open") {
        Some(open) => Some(SourceApi {
            get_id: required(lib, "plugin_get_id")?,
            get_event_source: required(lib, "plugin_get_event_source")?,
            open,
            close: required(lib, "plugin_close")?,
            next: required(lib, "plugin_next")?,
            next_batch: required(lib, "plugin_next_batch")?,
            event_to_string: required(lib, "plugin_event_to_string")?,
        }),
        None => None,
    };

    let extractor = match optional::<GetStrFn>(lib, "plugin_get_fields") {
        Some(get_fields) => {
            let api = ExtractorApi {
                get_fields,
                get_extract_event_sources: optional(lib, "plugin_get_extract_event_sources"),
                register_async_extractor: optional(lib, "plugin_register_async_extractor"),
                extract_str: optional(lib, "plugin_extract_str"),
                extract_u64: optional(lib, "plugin_extract_u64"),
            };
            let sync = api.extract_str.is_some() && api.extract_u64.is_some();
            if api.register_async_extractor.is_none() && !sync {
                bail!("extractor exports neither plugin_register_async_extractor nor plugin_extract_str/u64");
            }
            Some(api)
        }
        None => None,
    };

    Ok(PluginApi {
        get_required_api_version: required(lib, "plugin_get_required_api_version")?,
        get_type: required(lib, "plugin_get_type")?,
        get_name: required(lib, "plugin_get_name")?,
        get_description: required(lib, "plugin_get_description")?,
        get_contact: required(lib, "plugin_get_contact")?,
        get_version: required(lib, "plugin_get_version")?,
        init: required(lib, "plugin_init")?,
        destroy: required(lib, "plugin_destroy")?,
        get_last_error: required(lib, "plugin_get_last_error")?,
        source,
        extractor,
    })
}
