pub mod device_info_model;
pub mod device_state;
pub mod report;
pub mod sensor;
pub mod snapshot;
