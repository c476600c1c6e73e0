use std::collections::BTreeMap;
use std::sync::Arc;

use edgesync_commons::models::device_state::DeviceConfig;
use edgesync_commons::models::sensor::{
    Protocol,
    Sensor,
    SensorOutput,
};
use edgesync_commons::utils::sensor_store::{
    delete_sensor_with_pool,
    get_sensor_output_with_pool,
    list_sensors_with_pool,
    upsert_sensor_output_with_pool,
    upsert_sensor_with_pool,
};
use log::{
    debug,
    error,
    info,
};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::drivers::ProtocolAdapterDriver;
use crate::error::ReconcileError;
use crate::events::{
    EventBus,
    ReconcilerEvent,
};

/// Owns the `config` sub-tree: reconciles target sensors against the
/// protocol adapters, keyed by sensor UUID, and mirrors the applied set
/// into the durable `sensors` table.
pub struct ConfigManager {
    adapter: Arc<dyn ProtocolAdapterDriver>,
    pool: Arc<SqlitePool>,
    events: EventBus,
    target: RwLock<Option<DeviceConfig>>,
}

impl ConfigManager {
    pub fn new(
        adapter: Arc<dyn ProtocolAdapterDriver>, pool: Arc<SqlitePool>, events: EventBus,
    ) -> Self {
        Self {
            adapter,
            pool,
            events,
            target: RwLock::new(None),
        }
    }

    pub async fn set_target(&self, config: DeviceConfig) {
        let mut target = self.target.write().await;
        *target = Some(config);
    }

    /// Set-based reconcile: add/update first, removals last, so a sensor
    /// whose UUID changed is added under the new id before the old id
    /// disappears. Adapter failures are logged per sensor and retried on
    /// the next cycle.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        let target = match self.target.read().await.clone() {
            Some(config) => config,
            None => {
                debug!("No target config yet; skipping sensor reconcile");
                return Ok(());
            }
        };

        let current = list_sensors_with_pool(&self.pool).await?;
        let current_by_uuid: BTreeMap<Uuid, &Sensor> =
            current.iter().map(|s| (s.uuid, s)).collect();
        let target_uuids: BTreeMap<Uuid, ()> =
            target.sensors.iter().map(|s| (s.uuid, ())).collect();

        let mut applied = 0usize;
        let mut failed = 0usize;

        for sensor in &target.sensors {
            let changed = match current_by_uuid.get(&sensor.uuid) {
                None => true,
                Some(existing) => *existing != sensor,
            };
            if !changed {
                continue;
            }

            match self.adapter.apply_sensor_config(sensor).await {
                Ok(()) => {
                    applied += 1;
                    if let Err(e) = upsert_sensor_with_pool(sensor, &self.pool).await {
                        error!("Failed to persist sensor {}: {e}", sensor.uuid);
                    }
                }
                Err(e) => {
                    failed += 1;
                    error!("Failed to apply sensor {} ({}): {e}", sensor.uuid, sensor.name);
                }
            }
        }

        for sensor in &current {
            if target_uuids.contains_key(&sensor.uuid) {
                continue;
            }

            match self.adapter.remove_sensor_config(sensor.uuid).await {
                Ok(()) => {
                    applied += 1;
                    if let Err(e) = delete_sensor_with_pool(sensor.uuid, &self.pool).await {
                        error!("Failed to delete sensor row {}: {e}", sensor.uuid);
                    }
                }
                Err(e) => {
                    failed += 1;
                    error!("Failed to remove sensor {}: {e}", sensor.uuid);
                }
            }
        }

        if applied > 0 || failed > 0 {
            info!("Sensor reconcile applied {applied} change(s), {failed} failure(s)");
        }

        self.ensure_sensor_outputs(&target).await;

        self.events.emit(ReconcilerEvent::ConfigApplied);
        Ok(())
    }

    /// Every protocol with at least one enabled sensor needs an output
    /// socket configuration for its adapter; seed a default row where the
    /// operator has not configured one yet.
    async fn ensure_sensor_outputs(&self, target: &DeviceConfig) {
        let mut protocols: Vec<Protocol> = target
            .sensors
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.protocol)
            .collect();
        protocols.sort_by_key(|p| p.as_str());
        protocols.dedup();

        for protocol in protocols {
            match get_sensor_output_with_pool(protocol, &self.pool).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let output = SensorOutput {
                        protocol,
                        socket_path: format!("/var/run/edgesync/{protocol}.sock"),
                        data_format: "json".to_string(),
                        delimiter: None,
                        include_timestamp: true,
                        include_device_name: false,
                        logging: None,
                    };
                    if let Err(e) = upsert_sensor_output_with_pool(&output, &self.pool).await {
                        error!("Failed to seed {protocol} output config: {e}");
                    }
                }
                Err(e) => error!("Failed to read {protocol} output config: {e}"),
            }
        }
    }

    /// Last successfully applied configuration: the durable sensor set
    /// plus whatever extra config keys the target carried.
    pub async fn current_config(&self) -> Result<DeviceConfig, ReconcileError> {
        let sensors = list_sensors_with_pool(&self.pool).await?;
        let extra = self
            .target
            .read()
            .await
            .as_ref()
            .map(|t| t.extra.clone())
            .unwrap_or_default();

        Ok(DeviceConfig { sensors, extra })
    }
}
