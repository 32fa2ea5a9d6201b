//! Data sources the walker reads raw values from.
//!
//! A locator is opaque to the engine, each transport documents its own syntax.

use std::time::Duration;

use crate::config::TransportConfig;
use crate::engine::DriverError;
use crate::models::DeviceProtocol;

#[cfg(feature = "serial")]
pub mod line;
pub mod memory;
#[cfg(feature = "modbus")]
pub mod modbus;

pub use memory::MemorySource;

/// Read/write primitives of one device connection
#[allow(async_fn_in_trait)]
pub trait DataSource {
    /// Open the connection, called once at driver start
    async fn connect(&mut self) -> Result<(), DriverError>;
    async fn fetch(&mut self, locator: &str) -> Result<String, DriverError>;
    async fn send(&mut self, locator: &str, value: &str) -> Result<(), DriverError>;
    /// Called before every walk, sources that cache responses drop them here
    fn begin_pass(&mut self) {}
    fn describe(&self) -> String;
}

/// Every transport this build knows about
pub enum Transport {
    #[cfg(feature = "serial")]
    Line(line::LineSource),
    #[cfg(feature = "modbus")]
    Modbus(modbus::ModbusSource),
    Memory(MemorySource),
}

impl Transport {
    pub fn from_config(config: &TransportConfig, timeout: Duration) -> Result<Self, DriverError> {
        match config {
            #[cfg(feature = "serial")]
            TransportConfig::Serial { port, baud, crc } => {
                Ok(Transport::Line(line::LineSource::serial(port, *baud, *crc, timeout)))
            }
            #[cfg(feature = "serial")]
            TransportConfig::TcpLine { host, port, crc } => {
                Ok(Transport::Line(line::LineSource::tcp(host, *port, *crc, timeout)))
            }
            #[cfg(feature = "modbus")]
            TransportConfig::ModbusTcp { host, port, slave_id, proto } => {
                Ok(Transport::Modbus(modbus::ModbusSource::new(host, *port, *slave_id, proto.clone(), timeout)))
            }
            TransportConfig::Dummy { values } => {
                Ok(Transport::Memory(MemorySource::with_values(values.iter().map(|(k, v)| (k.as_str(), v.as_str())))))
            }
            #[allow(unreachable_patterns)]
            other => Err(DriverError::TransportUnreachable(format!(
                "transport {} is not compiled into this build",
                other.type_name()
            ))),
        }
    }
}

/// A definition only makes sense on the transport it was written for, the
/// dummy transport replays anything
pub fn check_protocol(config: &TransportConfig, protocol: DeviceProtocol) -> Result<(), DriverError> {
    let matches = match config {
        TransportConfig::Serial { .. } | TransportConfig::TcpLine { .. } => protocol == DeviceProtocol::SerialLine,
        TransportConfig::ModbusTcp { .. } => protocol == DeviceProtocol::Modbus,
        TransportConfig::Dummy { .. } => true,
    };
    if !matches {
        return Err(DriverError::Definition(format!(
            "{} definition can not be used with a {} transport",
            protocol.to_string(),
            config.type_name()
        )));
    }
    Ok(())
}

impl DataSource for Transport {
    async fn connect(&mut self) -> Result<(), DriverError> {
        match self {
            #[cfg(feature = "serial")]
            Transport::Line(s) => s.connect().await,
            #[cfg(feature = "modbus")]
            Transport::Modbus(s) => s.connect().await,
            Transport::Memory(s) => s.connect().await,
        }
    }

    async fn fetch(&mut self, locator: &str) -> Result<String, DriverError> {
        match self {
            #[cfg(feature = "serial")]
            Transport::Line(s) => s.fetch(locator).await,
            #[cfg(feature = "modbus")]
            Transport::Modbus(s) => s.fetch(locator).await,
            Transport::Memory(s) => s.fetch(locator).await,
        }
    }

    async fn send(&mut self, locator: &str, value: &str) -> Result<(), DriverError> {
        match self {
            #[cfg(feature = "serial")]
            Transport::Line(s) => s.send(locator, value).await,
            #[cfg(feature = "modbus")]
            Transport::Modbus(s) => s.send(locator, value).await,
            Transport::Memory(s) => s.send(locator, value).await,
        }
    }

    fn begin_pass(&mut self) {
        match self {
            #[cfg(feature = "serial")]
            Transport::Line(s) => s.begin_pass(),
            #[cfg(feature = "modbus")]
            Transport::Modbus(s) => s.begin_pass(),
            Transport::Memory(s) => s.begin_pass(),
        }
    }

    fn describe(&self) -> String {
        match self {
            #[cfg(feature = "serial")]
            Transport::Line(s) => s.describe(),
            #[cfg(feature = "modbus")]
            Transport::Modbus(s) => s.describe(),
            Transport::Memory(s) => s.describe(),
        }
    }
}
