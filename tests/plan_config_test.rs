//! Configuration and scan plan loading, plus a plan run end to end.

mod common;

use std::io::Write;
use std::sync::Arc;

use common::mock_io;
use daq_scan::channel::{ChannelRegistry, ChannelWriter};
use daq_scan::config::{LogFormat, NamingRuleKind, ScanConfig};
use daq_scan::mock::MockChannels;
use daq_scan::DaqError;
use daq_scan::plan::ScanPlan;
use daq_scan::scan::{self, CancelToken, EventSink, Outcome};
use serial_test::serial;
use tempfile::NamedTempFile;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
#[serial]
fn test_load_config_file() {
    let file = write_temp(
        r#"
[application]
name = "cryostat scans"
log_level = "debug"
log_format = "json"

[engine]
event_capacity = 256
naming_rule = "known_labels"
known_labels = ["my_dev_2"]
reject_unknown_channels = true
"#,
    );

    let config = ScanConfig::load_from(file.path()).unwrap();
    assert_eq!(config.application.name, "cryostat scans");
    assert_eq!(config.application.log_format, LogFormat::Json);
    assert_eq!(config.engine.event_capacity, 256);
    assert_eq!(config.engine.naming_rule, NamingRuleKind::KnownLabels);
    assert!(config.engine.reject_unknown_channels);
}

#[tokio::test]
#[serial]
async fn test_configured_labels_drive_registry() {
    let file = write_temp(
        r#"
[engine]
naming_rule = "known_labels"
known_labels = ["my_dev_2"]
"#,
    );
    let config = ScanConfig::load_from(file.path()).unwrap();

    let rack = Arc::new(MockChannels::new());
    let mut registry = ChannelRegistry::from_config(&config.engine);
    let label = registry.label_for("my_dev_2_power").unwrap();
    assert_eq!(label, "my_dev_2");
    registry.register(label, rack.equipment(label));
    registry.write(1.25, "my_dev_2_power").await.unwrap();
    assert_eq!(rack.setpoint("my_dev_2_power").await, Some(1.25));

    // Default rule splits at the second underscore, so the label is unknown.
    let mut fallback = ChannelRegistry::from_config(&ScanConfig::default().engine);
    fallback.register("my_dev_2", rack.equipment("my_dev_2"));
    let err = fallback.write(1.0, "my_dev_2_power").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DaqError>(),
        Some(DaqError::UnknownChannel(_))
    ));
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ScanConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, ScanConfig::default());
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_temp("[engine]\nevent_capacity = 256\n");
    std::env::set_var("DAQ_SCAN_ENGINE__EVENT_CAPACITY", "7");
    let config = ScanConfig::load_from(file.path());
    std::env::remove_var("DAQ_SCAN_ENGINE__EVENT_CAPACITY");

    assert_eq!(config.unwrap().engine.event_capacity, 7);
}

#[test]
#[serial]
fn test_invalid_config_is_rejected() {
    let file = write_temp("[application]\nlog_level = \"loud\"\n");
    let err = ScanConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("log_level"));
}

const PLAN: &str = r#"
name = "gate sweep"

[[levels]]
getters = ["lockin_0_x"]
setting_method = "A+B"

[[levels.setters]]
channel = "dc_0_gate"
linear = { start = 0.0, end = 2.0, points = 3 }

[[levels.setters]]
channel = "dc_0_bias"
explicit = [0.5]

[[levels]]
before = "magnet_0_field->0.0"

[[levels.setters]]
channel = "magnet_0_field"
explicit = [1.0, 2.0]
"#;

#[tokio::test]
async fn test_plan_file_runs_end_to_end() {
    let file = write_temp(PLAN);
    let plan = ScanPlan::load_from(file.path()).unwrap();
    assert_eq!(plan.name, "gate sweep");
    let levels = plan.into_levels(&Default::default()).unwrap();

    let mock = Arc::new(MockChannels::new().with_reading(|_, setpoints| {
        setpoints["magnet_0_field"] * 10.0 + setpoints["dc_0_gate"]
    }));
    let mut state = scan::initialize(levels).unwrap();
    assert_eq!(state.total_points(), 6);

    let outcome = scan::run(
        &mut state,
        &mock_io(&mock),
        &CancelToken::new(),
        &EventSink::new(64),
    )
    .await
    .unwrap();
    assert_eq!(outcome, Outcome::Finished);

    let tensor = state.tensor(0).unwrap();
    assert_eq!(tensor.shape(), &[1, 2, 3]);
    let flat: Vec<f64> = tensor.iter().copied().collect();
    assert_eq!(flat, vec![10.0, 11.0, 12.0, 20.0, 21.0, 22.0]);

    // Bias only has a setpoint on the first step of each inner sweep.
    let bias_writes = mock
        .writes()
        .await
        .into_iter()
        .filter(|(c, _)| c == "dc_0_bias")
        .count();
    assert_eq!(bias_writes, 2);
}

#[test]
fn test_malformed_plan_text() {
    let err = ScanPlan::from_toml_str("levels = 3").unwrap_err();
    assert!(err.to_string().contains("Invalid scan plan"));

    let plan = ScanPlan::from_toml_str(
        r#"
[[levels]]
before = "oops"
"#,
    )
    .unwrap();
    assert!(plan.into_levels(&Default::default()).is_err());
}
