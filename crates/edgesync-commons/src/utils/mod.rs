pub mod canonical;
pub mod config_dir;
pub mod db;
pub mod device_info;
pub mod error;
pub mod logging;
pub mod sensor_store;
pub mod settings;
pub mod state_snapshot;
