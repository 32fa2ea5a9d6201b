use serde::{Deserialize, Serialize};

/// Class of power hardware a driver talks to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Ups,
    Pdu,
    Ats,
}

impl DeviceKind {
    pub fn to_string(&self) -> String {
        match self {
            DeviceKind::Ups => "ups".to_string(),
            DeviceKind::Pdu => "pdu".to_string(),
            DeviceKind::Ats => "ats".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProtocol {
    #[default]
    SerialLine,
    Modbus,
    Dummy,
}

impl DeviceProtocol {
    pub fn to_string(&self) -> String {
        match self {
            DeviceProtocol::SerialLine => "Serial line".to_string(),
            DeviceProtocol::Modbus => "Modbus".to_string(),
            DeviceProtocol::Dummy => "Dummy".to_string(),
        }
    }
}

/// Health of the link to the device as published next to its state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommState {
    #[default]
    Ok,
    /// Recent passes failed, values may be outdated
    Stale,
    /// Failures exceeded the configured threshold
    Lost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_serde() {
        for kind in [DeviceKind::Ups, DeviceKind::Pdu, DeviceKind::Ats] {
            assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::Value::String(kind.to_string()));
        }
        assert_eq!(DeviceProtocol::SerialLine.to_string(), "Serial line");
        assert_eq!(serde_json::to_value(DeviceProtocol::SerialLine).unwrap(), "serial_line");
        assert_eq!(serde_json::to_value(CommState::Lost).unwrap(), "lost");
    }
}
