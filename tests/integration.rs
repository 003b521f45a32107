//! Integration tests for the ambient surface of the bridge: service info, config files,
//! telemetry settings and error rendering.

use std::path::PathBuf;

use mqtt_trace_bridge::broker::QoS;
use mqtt_trace_bridge::config::{Config, Settings};
use mqtt_trace_bridge::telemetry::{LogSettings, MetricSettings, TelemetrySettings, TraceSettings};

// ============================================================================
// ServiceInfo Tests
// ============================================================================

#[test]
fn test_service_info_macro() {
    let info = mqtt_trace_bridge::service_info!();

    assert_eq!(info.name, "mqtt-trace-bridge");
    assert_eq!(info.name_in_metrics, "mqtt_trace_bridge");
    assert!(!info.version.is_empty());
    assert!(!info.description.is_empty());
}

#[test]
fn test_service_info_default() {
    let info = mqtt_trace_bridge::ServiceInfo::default();

    assert_eq!(info.name, "");
    assert_eq!(info.name_in_metrics, "");
    assert_eq!(info.version, "");
}

// ============================================================================
// Config Generation Tests
// ============================================================================

#[test]
fn test_config_generation() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("bridge.toml");

    mqtt_trace_bridge::config::create_config_file::<Settings>(&config_path)
        .expect("Failed to create config file");

    let content = std::fs::read_to_string(&config_path).expect("Failed to read config file");
    assert!(content.contains("[bridge]"), "Missing [bridge] section");
    assert!(content.contains("[telemetry"), "Missing telemetry section");
    assert!(content.contains("inbound_topic"));
    assert!(content.contains("channel_capacity"));
    assert!(
        content.contains("Topic filter subscribed to for inbound messages"),
        "Missing doc comment for inbound_topic"
    );
}

#[test]
fn test_config_generation_unwritable_path() {
    let err = mqtt_trace_bridge::config::create_config_file::<Settings>(
        "/nonexistent/dir/bridge.toml",
    )
    .unwrap_err();

    assert!(matches!(err, mqtt_trace_bridge::Error::ConfigFileWrite { .. }));
}

// ============================================================================
// Config Loading Tests
// ============================================================================

#[test]
fn test_config_loading() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("bridge.toml");
    std::fs::write(
        &config_path,
        r#"
[bridge]
inbound_topic = "plant/+/status"
inbound_qos = "at_least_once"
default_topic = "plant/replies"
outbound_qos = "exactly_once"
channel_capacity = 16

[telemetry.trace]

[telemetry.log]
console_level = "debug"
otel_level = "warn"

[telemetry.metric]
"#,
    )
    .unwrap();

    let config: Config<Settings> =
        Config::new(Some(&config_path), None::<&str>).expect("Failed to load config");

    let bridge = &config.config.bridge;
    assert_eq!(bridge.inbound_topic, "plant/+/status");
    assert_eq!(bridge.inbound_qos, QoS::AtLeastOnce);
    assert_eq!(bridge.default_topic, "plant/replies");
    assert_eq!(bridge.outbound_qos, QoS::ExactlyOnce);
    assert_eq!(bridge.channel_capacity, Some(16));
    assert_eq!(config.config.telemetry.log.console_level, "debug");
    assert_eq!(config.config.telemetry.log.otel_level, "warn");
}

#[test]
fn test_config_loading_invalid_toml() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("broken.toml");
    std::fs::write(&config_path, "this is not valid toml {{{{").unwrap();

    let err = Settings::load(Some(&config_path), None::<&str>).unwrap_err();

    assert!(matches!(err, mqtt_trace_bridge::Error::ConfigLoad { .. }));
}

// ============================================================================
// TelemetrySettings Tests
// ============================================================================

#[test]
fn test_telemetry_settings_serialization() {
    let settings = TelemetrySettings {
        trace: TraceSettings {
            endpoint: Some("http://localhost:4317".to_string()),
        },
        log: LogSettings {
            console_level: "debug".to_string(),
            otel_level: "warn".to_string(),
            endpoint: None,
        },
        metric: MetricSettings { endpoint: None },
    };

    let toml_str = toml::to_string(&settings).expect("Failed to serialize TelemetrySettings");
    assert!(toml_str.contains("endpoint"));
    assert!(toml_str.contains("console_level"));

    let back: TelemetrySettings = toml::from_str(&toml_str).unwrap();
    let endpoint = back.trace.endpoint.as_deref();
    assert_eq!(endpoint, Some("http://localhost:4317"));
    assert!(back.metric.endpoint.is_none());
}

#[test]
fn test_bridge_settings_qos_names() {
    let settings: Settings = toml::from_str(
        r#"
[bridge]
inbound_topic = "a"
inbound_qos = "exactly_once"
default_topic = "b"
outbound_qos = "at_most_once"

[telemetry.trace]
[telemetry.log]
console_level = "info"
otel_level = "info"
[telemetry.metric]
"#,
    )
    .unwrap();

    assert_eq!(settings.bridge.inbound_qos.level(), 2);
    assert_eq!(settings.bridge.outbound_qos.level(), 0);
    assert_eq!(settings.bridge.channel_capacity, None);
}

// ============================================================================
// Error Type Tests
// ============================================================================

#[test]
fn test_error_display() {
    let write_error = mqtt_trace_bridge::Error::ConfigFileWrite {
        path: PathBuf::from("/test/path"),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "test error"),
    };
    assert!(write_error.to_string().contains("/test/path"));

    let missing = mqtt_trace_bridge::Error::ConfigFileMissing {
        path: PathBuf::from("/etc/bridge.toml"),
    };
    assert!(missing.to_string().contains("/etc/bridge.toml"));
}

#[test]
fn test_decode_error_display() {
    let err = mqtt_trace_bridge::codec::decode("00-abc").unwrap_err();
    assert_eq!(
        err.to_string(),
        "traceparent exists, but it has illegal format: 00-abc"
    );

    let err = mqtt_trace_bridge::codec::decode("01-abc-def-01").unwrap_err();
    assert_eq!(
        err.to_string(),
        "traceparent exists, but it has unknown version: 01-abc-def-01"
    );
}
