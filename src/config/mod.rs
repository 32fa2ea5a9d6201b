use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No configuration found, tried {0}")]
    NotFound(String),
    #[error("Unable to read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("Unable to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Environment variable pointing to the configuration file
pub const CONFIG_ENV: &str = "P2M_CONFIG";
const CONFIG_PATHS: [&str; 2] = ["config/p2m.yaml", "p2m.yaml"];

fn mqtt_port_default() -> u16 { 1883 }
fn mqtt_client_name_default() -> String { "power2mqtt".to_string() }
fn mqtt_base_topic_default() -> String { "power2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default = "mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default = "mqtt_base_topic_default")]
    pub base_topic: String,
}

#[derive(Deserialize, Serialize, Clone, PartialEq, Debug)]
pub enum ModbusProtoConfig {
    TCP,
    RTUoverTCP,
}

fn serial_baud_default() -> u32 { 2400 }
fn modbus_port_default() -> u16 { 502 }
fn modbus_proto_default() -> ModbusProtoConfig { ModbusProtoConfig::TCP }
fn modbus_slave_id_default() -> u8 { 1 }

#[derive(Deserialize, Serialize, Clone, PartialEq, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial {
        port: String,
        #[serde(default = "serial_baud_default")]
        baud: u32,
        #[serde(default)]
        crc: bool,
    },
    TcpLine {
        host: String,
        port: u16,
        #[serde(default)]
        crc: bool,
    },
    ModbusTcp {
        host: String,
        #[serde(default = "modbus_port_default")]
        port: u16,
        #[serde(default = "modbus_slave_id_default")]
        slave_id: u8,
        #[serde(default = "modbus_proto_default")]
        proto: ModbusProtoConfig,
    },
    /// Replays fixed values, keyed by locator
    Dummy {
        #[serde(default)]
        values: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            TransportConfig::Serial { .. } => "serial",
            TransportConfig::TcpLine { .. } => "tcp_line",
            TransportConfig::ModbusTcp { .. } => "modbus_tcp",
            TransportConfig::Dummy { .. } => "dummy",
        }
    }
}

fn poll_interval_default() -> u64 { 2 }
fn full_poll_every_default() -> u32 { 1 }
fn timeout_default() -> u64 { 3 }
fn max_failures_default() -> u32 { 3 }
fn comm_lost_token_default() -> String { "OFF".to_string() }
fn max_index_default() -> u32 { 64 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DriverConfig {
    /// Name of the device, also the MQTT topic below the base topic
    pub name: String,
    /// Definition file name without `.yaml`
    pub definition: String,
    pub transport: TransportConfig,
    /// Seconds between two passes
    #[serde(default = "poll_interval_default")]
    pub poll_interval: u64,
    /// Every n-th pass walks all items, the others only quick ones
    #[serde(default = "full_poll_every_default")]
    pub full_poll_every: u32,
    /// Seconds a single transport operation may take
    #[serde(default = "timeout_default")]
    pub timeout: u64,
    /// Consecutive failed passes before communication counts as lost
    #[serde(default = "max_failures_default")]
    pub max_failures: u32,
    /// Overrides the identify retries of the definition
    #[serde(default)]
    pub identify_retries: Option<u32>,
    #[serde(default)]
    pub identify_delay_ms: Option<u64>,
    /// When set LB is decided on `battery.charge` alone
    #[serde(default)]
    pub low_battery_charge: Option<f64>,
    #[serde(default = "comm_lost_token_default")]
    pub comm_lost_token: String,
    #[serde(default = "max_index_default")]
    pub max_index: u32,
    /// Values published when the device does not provide them
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// Values published instead of what the device reports
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub driver: DriverConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut candidates: Vec<String> = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            candidates.push(path);
        }
        candidates.extend(CONFIG_PATHS.iter().map(|p| p.to_string()));

        for path in candidates.iter() {
            let mut file = match File::open(path) {
                Ok(f) => f,
                Err(_) => continue,
            };

            let mut contents = String::new();
            file.read_to_string(&mut contents)
                .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
            info!("Using configuration {path}");
            return Config::from_str(&contents).map_err(|e| match e {
                ConfigError::Parse { message, .. } => ConfigError::Parse { path: path.clone(), message },
                other => other,
            });
        }

        Err(ConfigError::NotFound(candidates.join(", ")))
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.driver;
        if d.name.is_empty() || d.name.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid(format!("driver name {:?} can not be used as a topic", d.name)));
        }
        if d.poll_interval == 0 {
            return Err(ConfigError::Invalid("poll_interval must be at least one second".to_string()));
        }
        if d.full_poll_every == 0 {
            return Err(ConfigError::Invalid("full_poll_every must be at least 1".to_string()));
        }
        if d.max_failures == 0 {
            return Err(ConfigError::Invalid("max_failures must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
mqtt:
  host: broker.local
driver:
  name: rack-ups
  definition: megatec-q1
  transport:
    type: serial
    port: /dev/ttyUSB0
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_str(MINIMAL).unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.base_topic, "power2mqtt");
        assert_eq!(config.driver.poll_interval, 2);
        assert_eq!(config.driver.full_poll_every, 1);
        assert_eq!(config.driver.max_failures, 3);
        assert_eq!(config.driver.comm_lost_token, "OFF");
        assert_eq!(config.driver.low_battery_charge, None);
        assert_eq!(
            config.driver.transport,
            TransportConfig::Serial { port: "/dev/ttyUSB0".to_string(), baud: 2400, crc: false }
        );
    }

    #[test]
    fn test_transport_variants() {
        let yaml = MINIMAL.replace(
            "    type: serial\n    port: /dev/ttyUSB0\n",
            "    type: modbus_tcp\n    host: 10.0.0.5\n    proto: RTUoverTCP\n",
        );
        let config = Config::from_str(&yaml).unwrap();
        assert_eq!(config.driver.transport.type_name(), "modbus_tcp");
        assert!(matches!(
            config.driver.transport,
            TransportConfig::ModbusTcp { port: 502, slave_id: 1, proto: ModbusProtoConfig::RTUoverTCP, .. }
        ));

        let yaml = MINIMAL.replace(
            "    type: serial\n    port: /dev/ttyUSB0\n",
            "    type: dummy\n    values:\n      Q1: \"(230.0)\"\n",
        );
        let config = Config::from_str(&yaml).unwrap();
        match config.driver.transport {
            TransportConfig::Dummy { values } => assert_eq!(values["Q1"], "(230.0)"),
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn test_invalid_configs() {
        let yaml = MINIMAL.replace("name: rack-ups", "name: rack/ups");
        assert!(matches!(Config::from_str(&yaml), Err(ConfigError::Invalid(_))));
        let yaml = MINIMAL.replace("definition: megatec-q1", "definition: megatec-q1\n  poll_interval: 0");
        assert!(matches!(Config::from_str(&yaml), Err(ConfigError::Invalid(_))));
        assert!(matches!(Config::from_str("mqtt: ["), Err(ConfigError::Parse { .. })));
    }
}
