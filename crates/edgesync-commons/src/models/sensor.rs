use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

/// Industrial protocol handled by an external protocol adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Can,
    Opcua,
    Mqtt,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Modbus => "modbus",
            Protocol::Can => "can",
            Protocol::Opcua => "opcua",
            Protocol::Mqtt => "mqtt",
        }
    }

    pub fn parse(value: &str) -> Option<Protocol> {
        match value {
            "modbus" => Some(Protocol::Modbus),
            "can" => Some(Protocol::Can),
            "opcua" => Some(Protocol::Opcua),
            "mqtt" => Some(Protocol::Mqtt),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensor descriptor. The UUID is the stable identity; the name is mutable
/// metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub connection: serde_json::Value,
    #[serde(default)]
    pub data_points: Vec<serde_json::Value>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    1000
}

/// Per-protocol output socket configuration consumed by the adapters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorOutput {
    pub protocol: Protocol,
    pub socket_path: String,
    #[serde(default = "default_data_format")]
    pub data_format: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub include_timestamp: bool,
    #[serde(default)]
    pub include_device_name: bool,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<serde_json::Value>,
}

fn default_data_format() -> String {
    "json".to_string()
}
