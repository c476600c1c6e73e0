use async_trait::async_trait;
use log::warn;
use sqlx::SqlitePool;

use crate::models::device_info_model::{
    ApiTlsConfig,
    DeviceInfo,
};
use crate::utils::db::get_db_pool;
use crate::utils::error::DbError;
use crate::utils::settings::{
    get_setting_with_pool,
    set_setting_with_pool,
};

pub const KEY_DEVICE_UUID: &str = "device_uuid";
pub const KEY_DEVICE_API_KEY: &str = "device_api_key";
pub const KEY_OS_VERSION: &str = "os_version";
pub const KEY_PROVISIONED: &str = "provisioned";
pub const KEY_API_CA_CERT: &str = "api_ca_cert";
pub const KEY_API_VERIFY_CERT: &str = "api_verify_certificate";

/// Read-only view of the device identity and credentials. The cloud sync
/// engine fetches this per request instead of caching credentials.
#[async_trait]
pub trait DeviceInfoAccessor: Send + Sync {
    async fn get_device_info(&self) -> Result<DeviceInfo, DbError>;
}

/// Settings-table-backed accessor. Provisioning writes identity keys into
/// `settings`; this assembles them into a [`DeviceInfo`].
pub struct SettingsDeviceInfo;

impl SettingsDeviceInfo {
    pub async fn load_with_pool(pool: &SqlitePool) -> Result<DeviceInfo, DbError> {
        let uuid = get_setting_with_pool(KEY_DEVICE_UUID, pool)
            .await?
            .unwrap_or_default();
        let device_api_key = get_setting_with_pool(KEY_DEVICE_API_KEY, pool).await?;
        let provisioned = get_setting_with_pool(KEY_PROVISIONED, pool)
            .await?
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let os_version = match get_setting_with_pool(KEY_OS_VERSION, pool).await? {
            Some(v) => Some(v),
            None => sysinfo::System::long_os_version(),
        };

        let api_tls_config = match get_setting_with_pool(KEY_API_CA_CERT, pool).await? {
            Some(ca_cert) if !ca_cert.is_empty() => {
                let verify_certificate = get_setting_with_pool(KEY_API_VERIFY_CERT, pool)
                    .await?
                    .map(|v| v != "false" && v != "0")
                    .unwrap_or(true);
                Some(ApiTlsConfig {
                    ca_cert,
                    verify_certificate,
                })
            }
            _ => None,
        };

        if uuid.is_empty() {
            warn!("Device UUID not set; device is not provisioned yet");
        }

        Ok(DeviceInfo {
            uuid,
            device_api_key,
            os_version,
            agent_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            provisioned,
            api_tls_config,
        })
    }

    pub async fn store_identity_with_pool(
        pool: &SqlitePool, uuid: &str, api_key: &str,
    ) -> Result<(), DbError> {
        set_setting_with_pool(KEY_DEVICE_UUID, uuid, pool).await?;
        set_setting_with_pool(KEY_DEVICE_API_KEY, api_key, pool).await?;
        set_setting_with_pool(KEY_PROVISIONED, "true", pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceInfoAccessor for SettingsDeviceInfo {
    async fn get_device_info(&self) -> Result<DeviceInfo, DbError> {
        let pool = get_db_pool().await.map_err(DbError::ConnectionFailed)?;
        Self::load_with_pool(&pool).await
    }
}
