pub mod config_manager;
pub mod container_manager;
pub mod drivers;
pub mod error;
pub mod events;
pub mod reconciler;

pub use config_manager::ConfigManager;
pub use container_manager::ContainerManager;
pub use drivers::{
    ContainerAction,
    ContainerRuntimeDriver,
    ProtocolAdapterDriver,
};
pub use error::ReconcileError;
pub use events::{
    EventBus,
    ReconcilerEvent,
};
pub use reconciler::StateReconciler;
