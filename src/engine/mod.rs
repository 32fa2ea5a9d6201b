//! Status normalization engine shared by every driver.
//!
//! The walker fetches raw values through a [`crate::transport::DataSource`],
//! converts them with the transform and lookup helpers and folds status
//! tokens into the accumulators before the driver commits a pass.

use thiserror::Error;

pub mod item;
pub mod lookup;
pub mod status;
pub mod transform;
pub mod walker;

pub use item::{ActiveTable, ItemFlag, ItemFlags, ItemKind, TelemetryItem};
pub use lookup::{LookupEntry, LookupKey, LookupMode, LookupTable};
pub use status::{AccumulatorState, StatusAccumulator};
pub use walker::{PassMode, PollResult};

/// Error taxonomy of the driver framework
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Transport timed out: {0}")]
    TransportTimeout(String),
    #[error("Transport I/O error: {0}")]
    TransportIo(String),
    #[error("Malformed response: {0}")]
    ProtocolFraming(String),
    #[error("Device not known: {0}")]
    UnknownDevice(String),
    #[error("Transport unreachable: {0}")]
    TransportUnreachable(String),
    #[error("Bad value: {0}")]
    BadValue(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid format string: {0}")]
    InvalidFormat(String),
    #[error("Invalid driver definition: {0}")]
    Definition(String),
}

impl DriverError {
    /// Timeouts and I/O errors are retried on the next interval
    pub fn is_transport(&self) -> bool {
        matches!(self, DriverError::TransportTimeout(_) | DriverError::TransportIo(_))
    }

    /// Only an unreachable transport ends the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::TransportUnreachable(_))
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => DriverError::TransportTimeout(e.to_string()),
            _ => DriverError::TransportIo(e.to_string()),
        }
    }
}
