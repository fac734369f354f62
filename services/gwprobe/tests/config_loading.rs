//! Layered configuration loading from files and the environment
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use errors::ErrorCategory;
use gwprobe::config::AppConfig;
use gwprobe::runtime::WrapPolicy;
use tempfile::{Builder, NamedTempFile};

// Environment overrides are process-wide
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_yaml_file_overrides_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    let file = config_file(
        ".yaml",
        r#"
service:
  log_level: debug
consumer:
  strict_consistency: true
  wrap_policy: suppress
  reconnect:
    max_attempts: 5
modbus:
  host: 192.168.1.20
  port: 1502
  unit_id: 3
s7:
  db_number: 12
"#,
    );

    let config = AppConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.service.log_level, "debug");
    assert!(config.consumer.strict_consistency);
    assert_eq!(config.consumer.wrap_policy, WrapPolicy::Suppress);
    assert_eq!(config.consumer.reconnect.max_attempts, 5);
    assert_eq!(config.consumer.reconnect.initial_delay_ms, 500);
    assert_eq!(config.modbus.host, "192.168.1.20");
    assert_eq!(config.modbus.port, 1502);
    assert_eq!(config.modbus.unit_id, 3);
    assert_eq!(config.modbus.poll_interval_ms, 500);
    assert_eq!(config.s7.db_number, 12);
    assert_eq!(config.s7.rack, 0);
}

#[test]
fn test_toml_and_json_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    let toml = config_file(
        ".toml",
        r#"
[opcua]
endpoint_url = "opc.tcp://gateway:4840"
namespace_index = 3
"#,
    );
    let config = AppConfig::load(Some(toml.path())).unwrap();
    assert_eq!(config.opcua.endpoint_url, "opc.tcp://gateway:4840");
    assert_eq!(config.opcua.namespace_index, 3);

    let json = config_file(".json", r#"{"s7": {"slot": 2, "poll_interval_ms": 250}}"#);
    let config = AppConfig::load(Some(json.path())).unwrap();
    assert_eq!(config.s7.slot, 2);
    assert_eq!(config.s7.poll_interval_ms, 250);
}

#[test]
fn test_no_file_gives_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    assert_eq!(AppConfig::load(None).unwrap(), AppConfig::default());
}

#[test]
fn test_missing_file_is_configuration_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    let path = PathBuf::from("/nonexistent/gwprobe.yaml");
    let err = AppConfig::load(Some(&path)).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_unsupported_extension_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    let file = config_file(".ini", "[modbus]\nport=1502\n");
    let err = AppConfig::load(Some(file.path())).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    let zero_poll = config_file(".yaml", "modbus:\n  poll_interval_ms: 0\n");
    let err = AppConfig::load(Some(zero_poll.path())).unwrap_err();
    assert!(err.to_string().contains("modbus.poll_interval_ms"));

    let bad_type = config_file(".yaml", "modbus:\n  port: not-a-port\n");
    let err = AppConfig::load(Some(bad_type.path())).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_environment_overrides_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    let file = config_file(".yaml", "modbus:\n  port: 1502\n  host: plc-a\n");

    std::env::set_var("GWPROBE_MODBUS__PORT", "1602");
    std::env::set_var("GWPROBE_CONSUMER__STRICT_CONSISTENCY", "true");
    let result = AppConfig::load(Some(file.path()));
    std::env::remove_var("GWPROBE_MODBUS__PORT");
    std::env::remove_var("GWPROBE_CONSUMER__STRICT_CONSISTENCY");

    let config = result.unwrap();
    assert_eq!(config.modbus.port, 1602);
    assert_eq!(config.modbus.host, "plc-a");
    assert!(config.consumer.strict_consistency);
}
