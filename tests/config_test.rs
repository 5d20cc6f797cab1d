//! Integration tests for configuration loading

use region_match::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-site"

[mqtt]
host = "test-host"
port = 1884
client_id = "rm-test"
username = "user"
password = "secret"

[topics]
observations = "fleet/+/position"
regions = "fleet/regions"

[attributes]
id = "deviceId"
latitude = "lat"
longitude = "lon"
timestamp = "ts"
event_type = "kind"
region_name = "zone"

[engine]
workers = 8
queue_depth = 250
housekeeping_interval_secs = 3
device_idle_timeout_secs = 600

[metrics]
interval_secs = 15
prometheus_port = 9091

[egress]
file = "/tmp/events.jsonl"

[mqtt_egress]
enabled = false
events_topic = "out/events"

[broker]
enabled = true
port = 18830
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_client_id(), "rm-test");
    assert_eq!(config.mqtt_username(), Some("user"));
    assert_eq!(config.observations_topic(), "fleet/+/position");
    assert_eq!(config.regions_topic(), "fleet/regions");
    assert_eq!(config.attributes().id, "deviceId");
    assert_eq!(config.attributes().event_type, "kind");
    assert_eq!(config.engine_workers(), 8);
    assert_eq!(config.engine_queue_depth(), 250);
    assert_eq!(config.housekeeping_interval_secs(), 3);
    assert_eq!(config.device_idle_timeout(), Some(Duration::from_secs(600)));
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.prometheus_port(), 9091);
    assert_eq!(config.egress_file(), Some("/tmp/events.jsonl"));
    assert!(!config.mqtt_egress_enabled());
    assert_eq!(config.mqtt_egress_events_topic(), "out/events");
    assert_eq!(config.mqtt_egress_metrics_topic(), "regionmatch/metrics");
    assert!(config.broker_enabled());
    assert_eq!(config.broker_port(), 18830);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[engine]\nworkers = 0\n").unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();
    // Zero workers would leave observations unhandled
    assert_eq!(config.engine_workers(), 1);
    assert_eq!(config.attributes().timestamp, "timeStamp");
    assert_eq!(config.device_idle_timeout(), None);
    assert!(config.egress_file().is_none());
}

#[test]
fn test_invalid_toml_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[engine\nworkers = ").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.observations_topic(), "regionmatch/devices");
    assert!(!config.broker_enabled());
}

#[test]
fn test_dev_config_parses() {
    let config = Config::from_file("config/dev.toml").unwrap();
    assert_eq!(config.site_id(), "dev");
    assert!(config.broker_enabled());
    assert_eq!(config.egress_file(), Some("data/events.jsonl"));
}
