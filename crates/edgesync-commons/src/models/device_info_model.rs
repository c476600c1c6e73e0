use serde::{
    Deserialize,
    Serialize,
};

/// Device identity and credentials as handed to the cloud sync engine.
/// Re-read on every outgoing request so key rotations need no restart.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub uuid: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_api_key: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub provisioned: bool,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_tls_config: Option<ApiTlsConfig>,
}

/// TLS trust material provisioned for the cloud API endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiTlsConfig {
    pub ca_cert: String,
    #[serde(default = "default_verify")]
    pub verify_certificate: bool,
}

fn default_verify() -> bool {
    true
}
