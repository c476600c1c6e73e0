pub mod circuit_breaker;
pub mod error;
pub mod http;
pub mod monitor;
pub mod mqtt;
pub mod queue;
pub mod report;
pub mod retry;
pub mod single_flight;
pub mod sync;

pub use circuit_breaker::{
    BreakerOptions,
    CircuitBreaker,
};
pub use error::SyncError;
pub use http::{
    HttpClient,
    HttpResponse,
    ReqwestClient,
    RequestOptions,
};
pub use monitor::{
    ConnectionEvent,
    ConnectionHealth,
    ConnectionMonitor,
    ConnectionStatus,
    SyncOp,
};
pub use mqtt::MqttManager;
pub use queue::OfflineQueue;
pub use single_flight::SingleFlight;
pub use sync::{
    CloudSync,
    SyncOptions,
};
