//! Monitoring drivers for UPS, PDU and ATS hardware
//!
//! A driver polls one device through a transport, normalizes what it reads
//! into well known variables and status tokens and publishes the result to
//! MQTT.

pub mod config;
pub mod definitions;
pub mod driver;
pub mod engine;
pub mod models;
pub mod mqtt;
pub mod store;
pub mod transport;

// Re-export common types for easier access
pub use config::{Config, DriverConfig, MqttConfig};
pub use definitions::{load_definition, DriverDefinition};
pub use driver::{Driver, DriverOptions, DriverRequest, DriverState};
pub use engine::DriverError;
pub use models::{CommState, DeviceKind, DeviceProtocol};
pub use mqtt::{MqttManager, Transmission, CALLBACKS};
pub use store::{DeviceState, StateStore};
pub use transport::{DataSource, Transport};
