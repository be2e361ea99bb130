use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default)]
    pub source: SourceConfig,

    /// Additional extractor libraries, `[[extractor]]` tables in TOML.
    #[serde(default, rename = "extractor")]
    pub extractors: Vec<ExtractorConfig>,

    #[serde(default)]
    pub run: RunLimits,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Passed verbatim to `plugin_init`.
    #[serde(default)]
    pub init_config: String,

    /// Passed verbatim to `plugin_open`.
    #[serde(default)]
    pub open_params: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractorConfig {
    pub library: PathBuf,

    #[serde(default)]
    pub init_config: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunLimits {
    #[serde(default = "default_max_events")]
    pub max_events: u64,

    /// Consecutive TIMEOUT results tolerated before giving up.
    #[serde(default = "default_max_timeouts")]
    pub max_timeouts: u32,

    #[serde(default = "default_timeout_backoff_ms")]
    pub timeout_backoff_ms: u64,

    /// Prefer the async extraction bridge when the plugin exports it.
    #[serde(default = "default_async_extraction")]
    pub async_extraction: bool,

    /// Arguments for fields that require one, keyed by field name.
    #[serde(default)]
    pub field_args: HashMap<String, String>,

    /// Also print one line per event with its `event_to_string` rendering.
    #[serde(default)]
    pub print_events: bool,
}

fn default_max_events() -> u64 {
    100
}

fn default_max_timeouts() -> u32 {
    50
}

fn default_timeout_backoff_ms() -> u64 {
    10
}

fn default_async_extraction() -> bool {
    true
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_timeouts: default_max_timeouts(),
            timeout_backoff_ms: default_timeout_backoff_ms(),
            async_extraction: default_async_extraction(),
            field_args: HashMap::new(),
            print_events: false,
        }
    }
}

/// Load config from file or use defaults
pub fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    if let Some(path) = path {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RunConfig = toml::from_str(&content).context("Failed to parse TOML config")?;

        Ok(config)
    } else {
        Ok(RunConfig::default())
    }
}
