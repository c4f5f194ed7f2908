//! E2E tests for persistent configuration
//!
//! Tests config round-trip, defaults, backward compatibility, and that a
//! loaded config drives a real pipeline run.

use cdms_monitor::config::MonitorConfig;
use cdms_monitor::source::BackpressurePolicy;
use cdms_monitor::{Pipeline, SourceKind};
use std::time::Duration;

/// A config written by one session is read back unchanged by the next
#[test]
fn test_config_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cdms-monitor").join("config.json");

    let mut config = MonitorConfig::default();
    config.source = SourceKind::PhysicalRapidBlock;
    config.acquisition.n_samples = 65_536;
    config.acquisition.synthetic.f0_range = (30_000.0, 90_000.0);
    config.pipeline.backpressure = BackpressurePolicy::Block;
    config.pipeline.analyzer.threshold_factor = 8.0;
    config.save(&path).unwrap();

    let loaded = MonitorConfig::load_from(&path);
    assert_eq!(loaded, config);
}

/// Enum fields are stored in snake_case
#[test]
fn test_config_json_layout() {
    let mut config = MonitorConfig::default();
    config.source = SourceKind::PhysicalStreaming;
    let json = serde_json::to_value(&config).unwrap();

    assert_eq!(json["source"], "physical_streaming");
    assert_eq!(json["pipeline"]["backpressure"], "drop_oldest");
    assert_eq!(json["acquisition"]["fs_hz"], 2_400_000.0);
}

/// Older files without newer sections still load
#[test]
fn test_partial_file_loads_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"acquisition": {"period_ms": 100}}"#).unwrap();

    let config = MonitorConfig::load_from(&path);
    assert_eq!(config.source, SourceKind::Synthetic);
    assert_eq!(config.acquisition.period_ms, 100);
    assert_eq!(config.acquisition.n_samples, 262_144);
    assert_eq!(config.pipeline.block_queue_depth, 4);
    assert_eq!(config.pipeline.analyzer.threshold_factor, 6.0);
}

/// A missing file yields defaults rather than an error
#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = MonitorConfig::load_from(&dir.path().join("absent.json"));
    assert_eq!(config, MonitorConfig::default());
}

/// A loaded config starts a working synthetic run
#[test]
fn test_loaded_config_drives_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{
            "acquisition": {
                "n_samples": 16384,
                "period_ms": 10,
                "block_limit": 6,
                "synthetic": {"seed": 21}
            },
            "pipeline": {"backpressure": "block"}
        }"#,
    )
    .unwrap();

    let config = MonitorConfig::load_from(&path);
    assert_eq!(config.acquisition.block_limit, Some(6));
    assert!(config.acquisition.validate().is_ok());

    let mut pipeline = Pipeline::new(config.pipeline.clone());
    pipeline.start(config.source, config.acquisition).unwrap();
    let summary = pipeline.finish(Duration::from_secs(10)).unwrap();

    assert_eq!(summary.blocks, 6);
    assert_eq!(pipeline.snapshot().total_events, 6);
}
