use std::collections::BTreeMap;

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;

use crate::models::device_state::App;

/// One report cycle's payload for a single device. On the wire it is keyed
/// by the device UUID: `{ "<uuid>": { ...this... } }`.
///
/// Identity fields and metrics are optional on any given report; the cloud
/// tolerates their absence (bandwidth optimization).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateReport {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps: Option<BTreeMap<i64, App>>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(flatten)]
    pub metrics: SystemMetrics,
}

impl DeviceStateReport {
    /// Wire form: the report wrapped under its device UUID.
    pub fn to_wire(&self, device_uuid: &str) -> Value {
        let mut wire = serde_json::Map::new();
        wire.insert(
            device_uuid.to_string(),
            serde_json::to_value(self).unwrap_or(Value::Null),
        );
        Value::Object(wire)
    }
}

/// Sampled system metrics. Every field is optional so a partial sample
/// still produces a valid report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f32>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total: Option<u64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_usage: Option<u64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_total: Option<u64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temp: Option<f32>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_processes: Option<Vec<TopProcess>>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_interfaces: Option<Vec<NetworkInterfaceInfo>>,
}

impl SystemMetrics {
    pub fn is_empty(&self) -> bool {
        self == &SystemMetrics::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopProcess {
    pub pid: u32,
    pub name: String,
    pub cpu_usage: f32,
    pub memory: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterfaceInfo {
    pub name: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
}

/// A report parked in the offline queue, remembered with its enqueue time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedReport {
    pub report: DeviceStateReport,
    pub queued_at: DateTime<Utc>,
}
