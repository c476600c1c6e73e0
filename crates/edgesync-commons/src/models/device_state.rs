use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};

use crate::models::sensor::Sensor;

/// Declarative device shape exchanged with the cloud: the `apps` sub-tree
/// keyed by application id and the `config` sub-tree carrying sensors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(default)]
    pub apps: BTreeMap<i64, App>,
    #[serde(default)]
    pub config: DeviceConfig,
}

/// A target state as handed out by the cloud, stamped with a monotonically
/// increasing version.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub state: DeviceState,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct App {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default)]
    pub service_id: i64,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<i64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    /// Runtime-only field filled in from the container runtime; excluded
    /// from service equality.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Runtime-only field; excluded from service equality.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub config: ServiceConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The `config` sub-tree. `sensors` is the distinguished entry; anything
/// else the cloud sends rides along untouched in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub sensors: Vec<Sensor>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Service {
    /// Service identity as used by the per-service diff: equality over the
    /// configuration fields only, with `container_id` and `status` ignored.
    pub fn config_equals(&self, other: &Service) -> bool {
        self.service_id == other.service_id
            && self.service_name == other.service_name
            && self.image_name == other.image_name
            && self.config == other.config
    }
}
