//! Extractor-only plugin served through the async extraction bridge.
//!
//! It keeps no state of its own; every value is computed from the event
//! payload the host hands over in the request.

use sinsp_plugin_sdk::{
    declare_plugin, BridgeError, ExtractionRequest, ExtractorPlugin, FieldEntry, FieldKind,
    Plugin,
};
use tracing::debug;

pub struct AsyncPlugin;

impl Plugin for AsyncPlugin {
    const NAME: &'static str = "async";
    const DESCRIPTION: &'static str = "async extractor example";
    const CONTACT: &'static str = "sinsp plugin SDK maintainers";
    const VERSION: &'static str = "0.0.1";

    fn init(config: &str) -> anyhow::Result<Self> {
        debug!(plugin = Self::NAME, config, "config ignored");
        Ok(AsyncPlugin)
    }
}

impl ExtractorPlugin for AsyncPlugin {
    fn fields() -> Vec<FieldEntry> {
        vec![
            FieldEntry::new(FieldKind::String, "async.field", "event payload as text"),
            FieldEntry::new(FieldKind::Uint64, "async.len", "event payload length in bytes"),
        ]
    }

    fn extract_event_sources() -> Vec<String> {
        vec!["dummy_event".to_string()]
    }

    fn extract_str(&self, req: &ExtractionRequest<'_>) -> Result<Option<String>, BridgeError> {
        match req.field {
            "async.field" if req.data.is_empty() => Ok(None),
            "async.field" => Ok(Some(String::from_utf8_lossy(req.data).into_owned())),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }

    fn extract_u64(&self, req: &ExtractionRequest<'_>) -> Result<Option<u64>, BridgeError> {
        match req.field {
            "async.len" => Ok(Some(req.data.len() as u64)),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }
}

declare_plugin!(extractor: AsyncPlugin);

#[cfg(test)]
mod tests {
    use super::*;
    use sinsp_plugin_sdk::PluginType;
    use std::ffi::CStr;

    fn req<'a>(kind: FieldKind, field: &'a str, data: &'a [u8]) -> ExtractionRequest<'a> {
        ExtractionRequest {
            kind,
            field,
            arg: "",
            data,
            evtnum: 3,
            ts: 0,
        }
    }

    #[test]
    fn test_extracts_from_payload() {
        let p = AsyncPlugin;
        assert_eq!(
            p.extract_str(&req(FieldKind::String, "async.field", b"dummy9"))
                .unwrap()
                .as_deref(),
            Some("dummy9")
        );
        assert_eq!(
            p.extract_u64(&req(FieldKind::Uint64, "async.len", b"dummy9"))
                .unwrap(),
            Some(6)
        );
    }

    #[test]
    fn test_empty_payload_is_absent() {
        assert_eq!(
            AsyncPlugin
                .extract_str(&req(FieldKind::String, "async.field", b""))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_unknown_field_unsupported() {
        let err = AsyncPlugin
            .extract_u64(&req(FieldKind::Uint64, "async.field", b"x"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unsupported(_)));
    }

    #[test]
    fn test_exported_as_extractor() {
        assert_eq!(plugin_get_type(), PluginType::Extractor as u32);
        let sources = unsafe { CStr::from_ptr(plugin_get_extract_event_sources()) };
        assert_eq!(sources.to_str().unwrap(), r#"["dummy_event"]"#);
    }
}
