//! Application configuration
//!
//! Layered with figment: built-in defaults, then an optional YAML/TOML/JSON
//! file, then `GWPROBE_` environment variables (`__` separates sections,
//! e.g. `GWPROBE_MODBUS__PORT=1502`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use errors::{GatewayError, GatewayResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::BYTE_BLOCK_LEN;
use crate::runtime::change_detector::{DetectorOptions, WrapPolicy};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "GWPROBE_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub consumer: ConsumerConfig,
    pub modbus: ModbusConfig,
    pub opcua: OpcUaConfig,
    pub s7: S7Config,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
    /// Daily-rolling log files go here; console only when unset
    pub log_dir: Option<PathBuf>,
    pub json_logs: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "gwprobe".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub strict_consistency: bool,
    pub wrap_policy: WrapPolicy,
    pub reconnect: ReconnectConfig,
}

impl ConsumerConfig {
    pub fn detector(&self) -> DetectorOptions {
        DetectorOptions {
            strict_consistency: self.strict_consistency,
            wrap_policy: self.wrap_policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 0 retries forever
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub start_address: u16,
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Listen address of the mock server
    pub bind: String,
    /// Holding registers the mock server exposes
    pub register_count: usize,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            start_address: 0,
            poll_interval_ms: 500,
            connect_timeout_ms: 3_000,
            read_timeout_ms: 1_000,
            bind: "0.0.0.0:502".to_string(),
            register_count: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcUaConfig {
    pub endpoint_url: String,
    pub namespace_index: u16,
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for OpcUaConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "opc.tcp://127.0.0.1:4840".to_string(),
            namespace_index: 2,
            poll_interval_ms: 100,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S7Config {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub db_number: u16,
    /// Size of the DB the mock server registers
    pub db_size: usize,
    /// Byte offset of the reading inside the DB
    pub start: u32,
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub bind: String,
}

impl Default for S7Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
            db_number: 10,
            db_size: BYTE_BLOCK_LEN,
            start: 0,
            poll_interval_ms: 100,
            connect_timeout_ms: 3_000,
            read_timeout_ms: 1_000,
            bind: "0.0.0.0:102".to_string(),
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl ModbusConfig {
    pub fn poll_interval(&self) -> Duration {
        millis(self.poll_interval_ms)
    }
}

impl OpcUaConfig {
    pub fn poll_interval(&self) -> Duration {
        millis(self.poll_interval_ms)
    }
}

impl S7Config {
    pub fn poll_interval(&self) -> Duration {
        millis(self.poll_interval_ms)
    }
}

impl AppConfig {
    /// Load defaults, then `path` if given, then the environment
    ///
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> GatewayResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(GatewayError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            figment = match extension {
                "json" => figment.merge(Json::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                _ => {
                    return Err(GatewayError::config(format!(
                        "Unsupported config format: {}",
                        path.display()
                    )))
                },
            };
            debug!("Loading configuration from {}", path.display());
        }

        let config: AppConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        let intervals = [
            ("modbus.poll_interval_ms", self.modbus.poll_interval_ms),
            ("opcua.poll_interval_ms", self.opcua.poll_interval_ms),
            ("s7.poll_interval_ms", self.s7.poll_interval_ms),
            ("modbus.read_timeout_ms", self.modbus.read_timeout_ms),
            ("opcua.read_timeout_ms", self.opcua.read_timeout_ms),
            ("s7.read_timeout_ms", self.s7.read_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(GatewayError::config(format!("{} must be > 0", name)));
            }
        }

        if self.s7.db_size < BYTE_BLOCK_LEN {
            return Err(GatewayError::config(format!(
                "s7.db_size {} is smaller than one reading ({} bytes)",
                self.s7.db_size, BYTE_BLOCK_LEN
            )));
        }
        if self.modbus.register_count == 0 {
            return Err(GatewayError::config("modbus.register_count must be > 0"));
        }

        let reconnect = &self.consumer.reconnect;
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            return Err(GatewayError::config(format!(
                "consumer.reconnect.backoff_multiplier must be >= 1.0, got {}",
                reconnect.backoff_multiplier
            )));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(GatewayError::config(
                "consumer.reconnect.max_delay_ms is below initial_delay_ms",
            ));
        }

        common::logging::default_directive(&self.service.name, &self.service.log_level)
            .map_err(|e| GatewayError::config(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.modbus.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.opcua.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.s7.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.s7.db_number, 10);
        assert_eq!(config.consumer.wrap_policy, WrapPolicy::Accept);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = AppConfig::default();
        config.s7.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("s7.poll_interval_ms"));
    }

    #[test]
    fn test_small_db_rejected() {
        let mut config = AppConfig::default();
        config.s7.db_size = 15;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_backoff_rejected() {
        let mut config = AppConfig::default();
        config.consumer.reconnect.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        config.consumer.reconnect.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = AppConfig::default();
        config.service.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detector_options_follow_consumer_section() {
        let consumer = ConsumerConfig {
            strict_consistency: true,
            wrap_policy: WrapPolicy::Suppress,
            ..Default::default()
        };
        let options = consumer.detector();
        assert!(options.strict_consistency);
        assert_eq!(options.wrap_policy, WrapPolicy::Suppress);
    }
}
