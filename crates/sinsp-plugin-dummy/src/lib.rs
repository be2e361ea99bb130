//! Dummy source plugin.
//!
//! Emits `dummy<N>` payloads from a counter and extracts a few fields from
//! them. Config (JSON, all keys optional):
//! `{"start": 0, "max_events": 100, "batch_size": 16}`.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::Deserialize;
use sinsp_plugin_sdk::{
    declare_plugin, BridgeError, ExtractionRequest, ExtractorPlugin, FieldEntry, FieldKind,
    Plugin, PluginEvent, SourcePlugin, MAX_NEXT_BATCH_EVENTS,
};
use tracing::{debug, info};

const PAYLOAD_PREFIX: &str = "dummy";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DummyConfig {
    #[serde(default)]
    pub start: u64,
    /// Events per session before EOF; unlimited when absent.
    #[serde(default)]
    pub max_events: Option<u64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    MAX_NEXT_BATCH_EVENTS
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            start: 0,
            max_events: None,
            batch_size: default_batch_size(),
        }
    }
}

impl DummyConfig {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(raw).context("parsing dummy plugin config")?;
        if config.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        Ok(config)
    }
}

pub struct DummyPlugin {
    config: DummyConfig,
}

/// Per-open counter.
#[derive(Debug)]
pub struct DummySession {
    counter: u64,
    emitted: u64,
}

impl DummyPlugin {
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }
}

impl Plugin for DummyPlugin {
    const NAME: &'static str = "dummy";
    const DESCRIPTION: &'static str = "do almost nothing";
    const CONTACT: &'static str = "sinsp plugin SDK maintainers";
    const VERSION: &'static str = "1.0.0";

    fn init(config: &str) -> anyhow::Result<Self> {
        let config = DummyConfig::parse(config)?;
        info!(plugin = Self::NAME, ?config, "dummy plugin configured");
        Ok(Self { config })
    }
}

impl SourcePlugin for DummyPlugin {
    const ID: u32 = 111;
    const EVENT_SOURCE: &'static str = "dummy_event";
    type Session = DummySession;

    fn open(&self, params: &str) -> anyhow::Result<DummySession> {
        debug!(plugin = Self::NAME, params, "opening session");
        Ok(DummySession {
            counter: self.config.start,
            emitted: 0,
        })
    }

    fn close(&self, session: &mut DummySession) {
        debug!(plugin = Self::NAME, emitted = session.emitted, "session closed");
    }

    fn next_event(&self, session: &mut DummySession) -> Result<PluginEvent, BridgeError> {
        if self
            .config
            .max_events
            .is_some_and(|max| session.emitted >= max)
        {
            return Err(BridgeError::Eof);
        }

        let payload = format!("{PAYLOAD_PREFIX}{}", session.counter);
        session.counter += 1;
        session.emitted += 1;
        Ok(PluginEvent::new(payload, now_nanos()))
    }

    fn event_to_string(&self, data: &[u8]) -> String {
        format!(
            "evt-to-string(len={}): {}",
            data.len(),
            String::from_utf8_lossy(data)
        )
    }

    fn max_batch_events(&self) -> usize {
        self.config.batch_size
    }
}

impl ExtractorPlugin for DummyPlugin {
    fn fields() -> Vec<FieldEntry> {
        vec![
            FieldEntry::new(FieldKind::Uint64, "dummy.count", "counter value of the event")
                .display("Count"),
            FieldEntry::new(FieldKind::String, "dummy.value", "raw event payload"),
            FieldEntry::new(
                FieldKind::String,
                "dummy.prefix",
                "payload prefixed with the field argument",
            )
            .arg_required(),
        ]
    }

    fn extract_event_sources() -> Vec<String> {
        vec![Self::EVENT_SOURCE.to_string()]
    }

    fn extract_str(&self, req: &ExtractionRequest<'_>) -> Result<Option<String>, BridgeError> {
        let payload = String::from_utf8_lossy(req.data);
        match req.field {
            "dummy.value" => Ok(Some(payload.into_owned())),
            "dummy.prefix" if req.arg.is_empty() => Err(BridgeError::Configuration(
                "dummy.prefix requires an argument".into(),
            )),
            "dummy.prefix" => Ok(Some(format!("{}:{payload}", req.arg))),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }

    fn extract_u64(&self, req: &ExtractionRequest<'_>) -> Result<Option<u64>, BridgeError> {
        match req.field {
            "dummy.count" => Ok(parse_count(req.data)),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }
}

/// Counter encoded in a `dummy<N>` payload; `None` for anything else.
fn parse_count(data: &[u8]) -> Option<u64> {
    std::str::from_utf8(data)
        .ok()?
        .strip_prefix(PAYLOAD_PREFIX)?
        .parse()
        .ok()
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

declare_plugin!(source + extractor: DummyPlugin);
