//! Drives the dummy plugin through the runner in-process, with its entry
//! points linked directly instead of loaded from a shared library.

use std::collections::HashMap;

use serde_json::Value;
use sinsp_bridge::abi::symbols::GetStrFn;
use sinsp_harness::config::RunConfig;
use sinsp_harness::loader::{ExtractorApi, PluginApi, SourceApi};
use sinsp_harness::runner::run;
use sinsp_plugin_dummy as dummy;

fn dummy_api() -> PluginApi {
    PluginApi {
        get_required_api_version: dummy::plugin_get_required_api_version,
        get_type: dummy::plugin_get_type,
        get_name: dummy::plugin_get_name,
        get_description: dummy::plugin_get_description,
        get_contact: dummy::plugin_get_contact,
        get_version: dummy::plugin_get_version,
        init: dummy::plugin_init,
        destroy: dummy::plugin_destroy,
        get_last_error: dummy::plugin_get_last_error,
        source: Some(SourceApi {
            get_id: dummy::plugin_get_id,
            get_event_source: dummy::plugin_get_event_source,
            open: dummy::plugin_open,
            close: dummy::plugin_close,
            next: dummy::plugin_next,
            next_batch: dummy::plugin_next_batch,
            event_to_string: dummy::plugin_event_to_string,
        }),
        extractor: Some(ExtractorApi {
            get_fields: dummy::plugin_get_fields,
            get_extract_event_sources: Some(dummy::plugin_get_extract_event_sources as GetStrFn),
            register_async_extractor: Some(dummy::plugin_register_async_extractor),
            extract_str: Some(dummy::plugin_extract_str),
            extract_u64: Some(dummy::plugin_extract_u64),
        }),
    }
}

fn lines(out: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(out)
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn test_describe_dummy() {
    let api = dummy_api();
    api.validate().unwrap();
    let info = api.describe().unwrap();
    assert_eq!(info.name, "dummy");
    assert_eq!(info.id, Some(111));
    assert_eq!(info.event_source.as_deref(), Some("dummy_event"));
    assert_eq!(info.fields.len(), 3);
}

#[test]
fn test_async_run_until_eof() {
    let api = dummy_api();
    let mut config = RunConfig::default();
    config.source.init_config = r#"{"max_events": 4, "batch_size": 3}"#.into();
    config.run.field_args = HashMap::from([("dummy.prefix".to_string(), "p".to_string())]);
    config.run.print_events = true;

    let mut out = Vec::new();
    let summary = run(&api, &[], &config, &mut out).unwrap();
    assert_eq!(summary.events, 4);
    assert!(summary.eof);
    assert_eq!(summary.values, 12);
    assert_eq!(summary.failed, 0);

    let lines = lines(&out);
    assert_eq!(lines.len(), 16);
    assert_eq!(lines[0]["event"], "evt-to-string(len=6): dummy0");
    assert_eq!(lines[1]["field"], "dummy.count");
    assert_eq!(lines[1]["value"], 0);
    assert_eq!(lines[2]["value"], "dummy0");
    assert_eq!(lines[3]["value"], "p:dummy0");

    let last = lines.last().unwrap();
    assert_eq!(last["evtnum"], 4);
    assert_eq!(last["value"], "p:dummy3");
}

#[test]
fn test_sync_run_stops_at_max_events() {
    let api = dummy_api();
    let mut config = RunConfig::default();
    config.source.init_config = r#"{"start": 10, "batch_size": 2}"#.into();
    config.run.max_events = 5;
    config.run.async_extraction = false;

    let mut out = Vec::new();
    let summary = run(&api, &[], &config, &mut out).unwrap();
    assert_eq!(summary.events, 5);
    assert!(!summary.eof);
    // dummy.prefix needs an argument and none is configured.
    assert_eq!(summary.values, 10);

    let counts: Vec<u64> = lines(&out)
        .iter()
        .filter(|l| l["field"] == "dummy.count")
        .map(|l| l["value"].as_u64().unwrap())
        .collect();
    assert_eq!(counts, vec![10, 11, 12, 13, 14]);
}

#[test]
fn test_extraction_errors_count_as_failed_in_both_modes() {
    let api = dummy_api();
    for async_extraction in [true, false] {
        let mut config = RunConfig::default();
        config.source.init_config = r#"{"max_events": 3}"#.into();
        // Configured but empty, so every dummy.prefix extraction errors.
        config.run.field_args = HashMap::from([("dummy.prefix".to_string(), String::new())]);
        config.run.async_extraction = async_extraction;

        let summary = run(&api, &[], &config, &mut Vec::new()).unwrap();
        assert_eq!(summary.events, 3, "async={async_extraction}");
        assert_eq!(summary.values, 6, "async={async_extraction}");
        assert_eq!(summary.failed, 3, "async={async_extraction}");
        assert_eq!(summary.absent, 0, "async={async_extraction}");
    }
}

#[test]
fn test_init_failure_is_reported() {
    let api = dummy_api();
    let mut config = RunConfig::default();
    config.source.init_config = "{broken".into();

    let err = run(&api, &[], &config, &mut Vec::new()).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("plugin_init failed"), "{msg}");
    assert!(msg.contains("configuration error"), "{msg}");
}
