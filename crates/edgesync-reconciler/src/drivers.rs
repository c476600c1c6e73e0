use std::collections::BTreeMap;

use async_trait::async_trait;
use edgesync_commons::models::device_state::{
    App,
    Service,
};
use edgesync_commons::models::sensor::Sensor;
use uuid::Uuid;

/// Per-service action computed by the container diff.
#[derive(Clone, Debug, PartialEq)]
pub enum ContainerAction {
    Create {
        app_id: i64,
        app_name: String,
        service: Service,
    },
    Recreate {
        app_id: i64,
        app_name: String,
        service: Service,
    },
    Remove {
        app_id: i64,
        service: Service,
    },
}

impl ContainerAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ContainerAction::Create { .. } => "create",
            ContainerAction::Recreate { .. } => "recreate",
            ContainerAction::Remove { .. } => "remove",
        }
    }

    pub fn service_id(&self) -> i64 {
        match self {
            ContainerAction::Create { service, .. }
            | ContainerAction::Recreate { service, .. }
            | ContainerAction::Remove { service, .. } => service.service_id,
        }
    }
}

/// External container runtime. The agent never talks to a runtime socket
/// directly; everything goes through this seam.
#[async_trait]
pub trait ContainerRuntimeDriver: Send + Sync {
    /// Observed `apps` tree, with runtime fields populated.
    async fn get_current_state(&self) -> anyhow::Result<BTreeMap<i64, App>>;

    /// Apply one create/recreate/remove action.
    async fn apply_action(&self, action: &ContainerAction) -> anyhow::Result<()>;
}

/// External protocol adapter manager (modbus/can/opcua/mqtt).
#[async_trait]
pub trait ProtocolAdapterDriver: Send + Sync {
    async fn apply_sensor_config(&self, sensor: &Sensor) -> anyhow::Result<()>;

    async fn remove_sensor_config(&self, uuid: Uuid) -> anyhow::Result<()>;

    /// Connection status per protocol, keyed by sensor UUID.
    async fn get_all_device_statuses(
        &self,
    ) -> anyhow::Result<BTreeMap<String, BTreeMap<Uuid, String>>>;
}
